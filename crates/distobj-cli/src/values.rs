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

//! Conversions between command-line text, archive values and JSON output.

use std::collections::HashSet;

use distobj_common::coder::{ObjectId, Value};
use distobj_connection::{Payload, Received};
use serde_json::{json, Map, Number};

/// Nesting beyond this depth is printed as a placeholder.
const MAX_DEPTH: usize = 64;

/// Parses one `-a` argument: `true`/`false`, an integer, a float, or else a
/// string.
pub fn parse_argument(text: &str, payload: &mut Payload) -> Value {
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(integer) = text.parse::<i64>() {
        return Value::Long(integer);
    }
    if let Ok(float) = text.parse::<f64>() {
        return Value::Double(float);
    }
    payload.cstring(text)
}

/// Renders the results of a call as a JSON array, one element per result.
///
/// Proxies print as `{"proxy": target, "class": hint}`. Objects copied by
/// value print as `{"class": name, "fields": [...]}`; an object reached a
/// second time prints as `{"ref": index}`.
pub fn reply_to_json(reply: &Received) -> serde_json::Value {
    let mut seen = HashSet::new();
    serde_json::Value::Array(
        reply
            .roots()
            .iter()
            .map(|value| value_to_json(reply, value, &mut seen, 0))
            .collect(),
    )
}

fn value_to_json(reply: &Received, value: &Value, seen: &mut HashSet<ObjectId>, depth: usize) -> serde_json::Value {
    match value {
        Value::Bool(v) => json!(v),
        Value::Char(v) => json!(v),
        Value::UChar(v) => json!(v),
        Value::Short(v) => json!(v),
        Value::UShort(v) => json!(v),
        Value::Int(v) => json!(v),
        Value::UInt(v) => json!(v),
        Value::Long(v) => json!(v),
        Value::ULong(v) => json!(v),
        Value::Float(v) => float(f64::from(*v)),
        Value::Double(v) => float(*v),
        Value::CString(Some(_)) => match reply.text(value) {
            Some(text) => json!(text),
            None => json!({ "bytes": hex(reply, value) }),
        },
        Value::Pointer(Some(_)) => json!({ "bytes": hex(reply, value) }),
        Value::Selector(Some(name)) => json!({ "selector": name }),
        Value::Class(Some(name)) => json!({ "class": name }),
        Value::Object(Some(id)) | Value::ConditionalObject(Some(id)) => {
            if let Some(proxy) = reply.proxy(value) {
                return json!({ "proxy": proxy.target(), "class": proxy.class_hint() });
            }
            if depth >= MAX_DEPTH {
                return json!("...");
            }
            if !seen.insert(*id) {
                return json!({ "ref": id.index() });
            }
            let Some(node) = reply.graph().object(*id) else {
                return serde_json::Value::Null;
            };
            let fields: Vec<_> = node
                .fields()
                .iter()
                .map(|field| value_to_json(reply, field, seen, depth + 1))
                .collect();
            let mut object = Map::new();
            object.insert("class".into(), json!(node.class_name()));
            object.insert("fields".into(), serde_json::Value::Array(fields));
            serde_json::Value::Object(object)
        }
        _ => serde_json::Value::Null,
    }
}

fn float(v: f64) -> serde_json::Value {
    Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

fn hex(reply: &Received, value: &Value) -> String {
    let blob: &[u8] = match value {
        Value::CString(Some(id)) | Value::Pointer(Some(id)) => reply.graph().blob(*id).unwrap_or_default(),
        _ => &[],
    };
    blob.iter().map(|byte| format!("{:02x}", byte)).collect()
}
