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

//! The compiler-side collaborators of the driver: spawning the local
//! preprocessor and running a full local build. Both are traits so tests
//! can script them without forking real compilers.

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::process::{Command, ExitStatus, Stdio};

use log::trace;

use crate::compiler::CompileJob;

/// Where the preprocessor's output goes: a pipe the driver reads, or a file
/// the child writes directly (replication preprocesses once to disk).
pub enum CppOutput {
    Pipe,
    File(File),
}

/// A running preprocessor.
pub trait CommandChild {
    /// The read end of the output pipe. `None` in file mode.
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;
    /// Wait for the child, retrying on EINTR.
    fn wait(&mut self) -> io::Result<ExitStatus>;
    /// Best-effort SIGTERM, used when streaming to the remote fails
    /// mid-flight.
    fn terminate(&mut self);
}

/// Launches the preprocessor and the local-fallback compile.
pub trait CommandCreator: Send + Sync {
    type Child: CommandChild + Send;

    fn call_cpp(&self, job: &CompileJob, out: CppOutput) -> io::Result<Self::Child>;

    /// Run the whole compile on this machine, returning the compiler's exit
    /// code.
    fn build_local(&self, job: &CompileJob) -> io::Result<i32>;
}

/// The real thing, backed by `std::process`.
pub struct ProcessCommandCreator;

pub struct ProcessChild {
    child: std::process::Child,
}

impl CommandChild for ProcessChild {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|out| Box::new(out) as Box<dyn Read + Send>)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        // std's wait loops on EINTR itself.
        self.child.wait()
    }

    fn terminate(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }
}

impl CommandCreator for ProcessCommandCreator {
    type Child = ProcessChild;

    fn call_cpp(&self, job: &CompileJob, out: CppOutput) -> io::Result<ProcessChild> {
        let mut cmd = Command::new(&job.compiler_name);
        cmd.args(&job.rest_flags)
            .arg("-E")
            .arg(&job.input_file)
            .stdin(Stdio::null())
            .stdout(match out {
                CppOutput::Pipe => Stdio::piped(),
                CppOutput::File(f) => Stdio::from(f),
            });
        trace!("call_cpp: {:?}", cmd);
        cmd.spawn().map(|child| ProcessChild { child })
    }

    fn build_local(&self, job: &CompileJob) -> io::Result<i32> {
        let mut cmd = Command::new(&job.compiler_name);
        cmd.args(&job.rest_flags)
            .args(&job.remote_flags)
            .arg("-c")
            .arg(&job.input_file)
            .arg("-o")
            .arg(&job.output_file);
        trace!("build_local: {:?}", cmd);
        let status = cmd.status()?;
        Ok(crate::util::shell_exit_status(&status))
    }
}

/// Scripted preprocessor child. In pipe mode the configured output bytes are
/// served through `take_stdout`; in file mode they are written to the file
/// up front by [`MockCommandCreator::call_cpp`].
pub struct MockChild {
    stdout: Option<Box<dyn Read + Send>>,
    exit: i32,
}

impl MockChild {
    pub fn new(exit: i32, stdout: &[u8]) -> MockChild {
        MockChild {
            stdout: Some(Box::new(Cursor::new(stdout.to_vec()))),
            exit,
        }
    }
}

impl CommandChild for MockChild {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stdout.take()
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        Ok(exit_status(self.exit))
    }

    fn terminate(&mut self) {}
}

/// Scripted launcher for tests; all spawned preprocessors produce
/// `cpp_output` and exit with `cpp_exit`, and local builds return
/// `local_exit` after writing `local_output` to the job's output path.
pub struct MockCommandCreator {
    pub cpp_output: Vec<u8>,
    pub cpp_exit: i32,
    pub local_exit: i32,
    pub local_output: Vec<u8>,
}

impl Default for MockCommandCreator {
    fn default() -> MockCommandCreator {
        MockCommandCreator {
            cpp_output: b"preprocessed source".to_vec(),
            cpp_exit: 0,
            local_exit: 0,
            local_output: vec![],
        }
    }
}

impl CommandCreator for MockCommandCreator {
    type Child = MockChild;

    fn call_cpp(&self, _job: &CompileJob, out: CppOutput) -> io::Result<MockChild> {
        match out {
            CppOutput::Pipe => Ok(MockChild::new(self.cpp_exit, &self.cpp_output)),
            CppOutput::File(mut f) => {
                use std::io::Write;
                f.write_all(&self.cpp_output)?;
                Ok(MockChild::new(self.cpp_exit, &[]))
            }
        }
    }

    fn build_local(&self, job: &CompileJob) -> io::Result<i32> {
        if !self.local_output.is_empty() {
            std::fs::write(&job.output_file, &self.local_output)?;
        }
        Ok(self.local_exit)
    }
}

/// Build an `ExitStatus` carrying `code`, for mocks.
#[cfg(unix)]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw((code & 0xff) << 8)
}

#[cfg(windows)]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    ExitStatus::from_raw(code as u32)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::Language;

    fn job() -> CompileJob {
        CompileJob::new("cc", Language::C, "/src/a.c", "/src/a.o", "x86_64")
    }

    #[test]
    fn test_exit_status_roundtrip() {
        assert_eq!(exit_status(0).code(), Some(0));
        assert_eq!(exit_status(3).code(), Some(3));
        assert!(exit_status(0).success());
        assert!(!exit_status(1).success());
    }

    #[test]
    fn test_mock_child_serves_stdout_once() {
        let mut child = MockChild::new(0, b"data");
        let mut buf = Vec::new();
        child.take_stdout().unwrap().read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"data");
        assert!(child.take_stdout().is_none());
        assert_eq!(child.wait().unwrap().code(), Some(0));
    }

    #[test]
    fn test_mock_creator_file_mode_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pre.ix");
        let creator = MockCommandCreator::default();
        let f = std::fs::File::create(&path).unwrap();
        let mut child = creator.call_cpp(&job(), CppOutput::File(f)).unwrap();
        assert!(child.wait().unwrap().success());
        assert_eq!(std::fs::read(&path).unwrap(), b"preprocessed source");
    }
}
