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

//! Distobj Connections
//!
//! This crate lets two processes call methods on each other's objects. Each
//! side exports objects implementing [`RemoteObject`]; the other side holds
//! [`Proxy`] handles for them and invokes methods by selector.
//!
//! Objects cross the link by reference: a local object placed in a
//! [`Payload`] with [`Payload::export`] reaches the peer as a proxy, and a
//! proxy handed back arrives as the original object. Exported objects stay
//! alive while the peer holds proxies for them and are released once it
//! drops the last one.

pub mod config;
pub mod connection;
mod context;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod stats;
pub mod target;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionId};
pub use proxy::Proxy;
pub use registry::ConnectionRegistry;
pub use server::{connect, Server};
pub use stats::StatsSnapshot;
pub use target::{Invocation, Payload, Received, RemoteObject, Reply};
