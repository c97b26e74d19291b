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

//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Create an environment filter based on verbosity level.
///
/// `RUST_LOG` takes precedence when set.
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbosity {
            0 => EnvFilter::new("treeshare=warn"),
            1 => EnvFilter::new("treeshare=info"),
            // -vv: include russh handshake and auth chatter
            2 => EnvFilter::new("treeshare=debug,russh=debug"),
            _ => EnvFilter::new("treeshare=trace,russh=trace,russh_sftp=debug,axum=debug"),
        }
    }
}

/// Install the global fmt subscriber. Calling it twice is a no-op.
pub fn init_logging(verbosity: u8) {
    let filter = create_env_filter(verbosity);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
