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

//! # Distobj CLI
//!
//! Command-line interface for the distobj distributed-objects system.
//!
//! ## Key Commands
//!
//! - `distobj serve`: Export the demo calculator over TCP
//! - `distobj call`: Invoke a selector on a server's root object (outputs raw JSON)
//! - `distobj describe`: Print the method type string of a selector

pub mod demo;
pub mod values;
