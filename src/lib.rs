// Copyright 2016 Mozilla Foundation
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

//! Client-side remote build driver for an icecc-compatible compile
//! cluster.
//!
//! A compiler wrapper hands a [`compiler::CompileJob`] plus a channel to
//! the co-located daemon to [`remote::build_remote`], which negotiates a
//! build host, ships the compile environment when needed, streams the
//! preprocessed source over and publishes the returned object as if the
//! compile had run locally. A sampled fraction of jobs is built on several
//! hosts concurrently and the objects compared to smoke out flaky builders.

#![deny(rust_2018_idioms)]

pub mod channel;
pub mod compiler;
pub mod envs;
pub mod errors;
pub mod mock_command;
pub mod protocol;
pub mod remote;
mod replicate;
pub mod scheduler;
#[doc(hidden)]
pub mod util;

use std::env;

/// Set up the `log` backend from `$ICECC_LOG`, if the wrapper asked for
/// logging at all.
pub fn init_logging() {
    if env::var("ICECC_LOG").is_ok() {
        match env_logger::Builder::from_env("ICECC_LOG").try_init() {
            Ok(_) => (),
            Err(e) => panic!("Failed to initialize logging: {:?}", e),
        }
    }
}
