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

pub use anyhow::{anyhow, bail, Context, Error};

// We use `anyhow` for error handling.
// - Use `context()`/`with_context()` to annotate errors.
// - Use `anyhow!` with a string to create a new `anyhow::Error`.
// - The error types below are internal ones that need to be checked at
//   points other than the outermost error-checking layer: `ClientError`
//   carries the numbered code the wrapper turns into a process exit, and
//   `RemoteError` marks conditions where the wrapper should fall back to a
//   local compile instead of failing the build.
//
// The numbers in the rendered `Error <n> - <text>` messages are a stable
// contract; users grep them out of build logs.

pub type Result<T> = anyhow::Result<T>;

/// A fatal driver failure from the numbered taxonomy.
#[derive(Debug)]
pub struct ClientError {
    pub code: i32,
    pub msg: String,
}

impl std::error::Error for ClientError {}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error {} - {}", self.code, self.msg)
    }
}

/// A remote-side condition the caller should recover from by compiling
/// locally (out-of-memory: 101, stdout/stderr workaround: 102).
#[derive(Debug)]
pub struct RemoteError {
    pub code: i32,
    pub msg: String,
}

impl std::error::Error for RemoteError {}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error {} - {}", self.code, self.msg)
    }
}

pub fn client_error<S: Into<String>>(code: i32, msg: S) -> Error {
    Error::new(ClientError {
        code,
        msg: msg.into(),
    })
}

pub fn remote_error<S: Into<String>>(code: i32, msg: S) -> Error {
    Error::new(RemoteError {
        code,
        msg: msg.into(),
    })
}

/// The taxonomy number behind `err`, if it carries one.
pub fn error_code(err: &Error) -> Option<i32> {
    if let Some(e) = err.downcast_ref::<ClientError>() {
        return Some(e.code);
    }
    err.downcast_ref::<RemoteError>().map(|e| e.code)
}

/// True for the recoverable class; the wrapper retries on the local machine.
pub fn is_recoverable(err: &Error) -> bool {
    err.downcast_ref::<RemoteError>().is_some()
}
