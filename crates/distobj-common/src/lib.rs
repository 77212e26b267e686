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

//! Distobj Common Types, Archiving and Transport
//!
//! This crate provides the pieces of the distobj system that do not depend on
//! a live connection:
//!
//! - **Coder**: encodes object graphs (shared and cyclic structures included)
//!   into a compact binary archive with cross-reference deduplication, and
//!   decodes them back against a class registry
//! - **Protocol**: message envelopes, payload layouts and the error taxonomy
//! - **Transport**: framed byte links (TCP and in-memory)
//!
//! # Archive Format
//!
//! - **Header**: four big-endian `u32`s (version, class count, object count,
//!   pointer count)
//! - **Records**: a tag byte per value; a set high bit marks a backreference
//!   by index, with index 0 meaning nil
//!
//! # Example
//!
//! ```
//! use distobj_common::coder::{archive, unarchive, ClassInfo, ClassRegistry, ObjectGraph, Value};
//!
//! let mut graph = ObjectGraph::new();
//! let node = graph.reserve("Node");
//! graph.set_fields(node, vec![Value::Object(Some(node))]);
//!
//! let bytes = archive(&graph, &[Value::Object(Some(node))]).unwrap();
//! let registry = ClassRegistry::new().with_class(ClassInfo::new("Node"));
//! let decoded = unarchive(&bytes, &registry).unwrap();
//! assert!(graph.equivalent(&[Value::Object(Some(node))], &decoded.graph, &decoded.roots));
//! ```

pub mod coder;
pub mod protocol;
pub mod transport;

pub use protocol::*;
