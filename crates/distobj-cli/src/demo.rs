// Copyright 2025 Distobj Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Objects exported by `distobj serve`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use distobj_common::coder::Value;
use distobj_common::protocol::{DistobjError, Result};
use distobj_connection::{Invocation, Payload, RemoteObject};

/// Root object of the demo server.
///
/// | selector      | signature | result                               |
/// |---------------|-----------|--------------------------------------|
/// | `add:to:`     | `q@:qq`   | sum of two 64-bit integers           |
/// | `echo:`       | `*@:*`    | the string it was given              |
/// | `describe`    | `*@:`     | a short status line                  |
/// | `counter`     | `@@:`     | a new [`Counter`], passed by reference |
#[derive(Debug, Default)]
pub struct Calculator {
    calls: AtomicU64,
}

impl Calculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

fn integer(invocation: &Invocation, index: usize) -> Result<i64> {
    invocation
        .argument(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| DistobjError::RemoteInvocation(format!("argument {} is not an integer", index)))
}

#[async_trait]
impl RemoteObject for Calculator {
    fn class_name(&self) -> &str {
        "Calculator"
    }

    fn method_signature(&self, selector: &str) -> Option<String> {
        let signature = match selector {
            "add:to:" => "q@:qq",
            "echo:" => "*@:*",
            "describe" => "*@:",
            "counter" => "@@:",
            _ => return None,
        };
        Some(signature.to_string())
    }

    async fn invoke(&self, invocation: Invocation) -> Result<Payload> {
        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        match invocation.selector() {
            "add:to:" => {
                let sum = integer(&invocation, 0)?
                    .checked_add(integer(&invocation, 1)?)
                    .ok_or_else(|| DistobjError::RemoteInvocation("integer overflow".into()))?;
                Ok(Payload::new().with(Value::Long(sum)))
            }
            "echo:" => {
                let arguments = invocation.arguments();
                let text = invocation
                    .argument(0)
                    .and_then(|value| arguments.text(value))
                    .unwrap_or_default()
                    .to_string();
                let mut payload = Payload::new();
                let value = payload.cstring(&text);
                Ok(payload.with(value))
            }
            "describe" => {
                let mut payload = Payload::new();
                let value = payload.cstring(&format!("Calculator, {} calls served", calls));
                Ok(payload.with(value))
            }
            "counter" => {
                let mut payload = Payload::new();
                let value = payload.export(Arc::new(Counter::default()));
                Ok(payload.with(value))
            }
            other => Err(DistobjError::RemoteInvocation(format!(
                "Calculator does not respond to {}",
                other
            ))),
        }
    }
}

/// A counter that lives on the server and is used through a proxy.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicI64,
}

#[async_trait]
impl RemoteObject for Counter {
    fn class_name(&self) -> &str {
        "Counter"
    }

    fn method_signature(&self, selector: &str) -> Option<String> {
        matches!(selector, "increment" | "value").then(|| "q@:".to_string())
    }

    async fn invoke(&self, invocation: Invocation) -> Result<Payload> {
        let value = match invocation.selector() {
            "increment" => self.value.fetch_add(1, Ordering::SeqCst) + 1,
            "value" => self.value.load(Ordering::SeqCst),
            other => {
                return Err(DistobjError::RemoteInvocation(format!(
                    "Counter does not respond to {}",
                    other
                )))
            }
        };
        Ok(Payload::new().with(Value::Long(value)))
    }
}
