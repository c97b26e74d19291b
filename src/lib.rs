// Copyright 2025 Lablup Inc. and Jeongkyu Shin
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

//! treeshare: a read-only SFTP and HTTP gateway confined to one directory tree.

pub mod config;
pub mod guard;
pub mod server;
pub mod shared;
pub mod utils;
pub mod web;

pub use config::AppConfig;
pub use guard::PathGuard;
pub use server::Gateway;
pub use web::WebServer;
