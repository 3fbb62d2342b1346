// Copyright 2025 The stoker authors
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

#![warn(missing_debug_implementations, rust_2018_idioms, unused_imports)]

//! stoker is a single-reactor HTTP/1.1 file server.
//!
//! One thread runs the readiness dispatcher, the connection table and the
//! idle-timeout heap; a bounded worker pool performs all socket I/O and
//! parsing; file bodies are memory-mapped and written with scatter I/O,
//! never copied through the write buffer.

pub mod buffer;
pub mod config;
pub mod db;
pub mod http;
pub mod logging;
pub mod pool;
pub mod poller;
pub mod server;
pub mod timer;
