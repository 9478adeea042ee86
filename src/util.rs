// Copyright 2017 Mozilla Foundation
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

use std::env;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use fs_err as fs;

/// Turn `file` into an absolute, `.`/`..`-free form.
///
/// The result is only used as a stable scheduler fingerprint; it need not
/// resolve to the same inode as the input, so the rewrites are textual and
/// no symlinks are followed.
pub fn get_absfilename(file: &str) -> String {
    if file.is_empty() {
        return String::new();
    }

    let mut file = if !file.starts_with('/') {
        let cwd = env::current_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}/{}", cwd, file)
    } else {
        file.to_owned()
    };

    while let Some(idx) = file.find("/..") {
        file.replace_range(idx..idx + 3, "/");
    }

    while let Some(idx) = file.find("/./") {
        file.replace_range(idx..idx + 3, "/");
    }

    while let Some(idx) = file.find("//") {
        file.replace_range(idx..idx + 2, "/");
    }

    file
}

/// Calculate the MD5 digest of the contents of `path` as 32 lowercase hex
/// characters. Returns the empty string if the file cannot be opened;
/// callers treat empty digests as never-equal. Used for replica-agreement
/// checks only, not as a security primitive.
pub fn md5_for_file<P: AsRef<Path>>(path: P) -> String {
    let f = match fs::File::open(path.as_ref()) {
        Ok(f) => f,
        Err(_) => return String::new(),
    };
    let mut ctx = md5::Context::new();
    let mut reader = BufReader::new(f);
    let mut buffer = [0; 40 * 1024];
    loop {
        match reader.read(&mut buffer[..]) {
            Ok(0) => break,
            Ok(count) => ctx.consume(&buffer[..count]),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return String::new(),
        }
    }
    format!("{:x}", ctx.compute())
}

/// The debug-info sidecar path beside an object file: `foo.o` -> `foo.dwo`.
pub fn dwo_path(output: &str) -> PathBuf {
    Path::new(output).with_extension("dwo")
}

/// Resource usage accumulated by reaped children, in the units `JobDone`
/// reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildUsage {
    pub user_msec: u64,
    pub sys_msec: u64,
    pub pfaults: u64,
}

impl ChildUsage {
    pub fn since(&self, earlier: &ChildUsage) -> ChildUsage {
        ChildUsage {
            user_msec: self.user_msec.saturating_sub(earlier.user_msec),
            sys_msec: self.sys_msec.saturating_sub(earlier.sys_msec),
            pfaults: self.pfaults.saturating_sub(earlier.pfaults),
        }
    }
}

/// Snapshot of `getrusage(RUSAGE_CHILDREN)`; diff two snapshots around a
/// local build to fill the `JobDone` statistics.
#[cfg(unix)]
pub fn child_usage() -> ChildUsage {
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut ru) };
    if rc != 0 {
        return ChildUsage::default();
    }
    ChildUsage {
        user_msec: (ru.ru_utime.tv_sec as u64) * 1000 + (ru.ru_utime.tv_usec as u64) / 1000,
        sys_msec: (ru.ru_stime.tv_sec as u64) * 1000 + (ru.ru_stime.tv_usec as u64) / 1000,
        pfaults: (ru.ru_majflt + ru.ru_minflt + ru.ru_nswap) as u64,
    }
}

#[cfg(not(unix))]
pub fn child_usage() -> ChildUsage {
    ChildUsage::default()
}

/// The exit code to report for a finished child, mapping signal deaths the
/// way a shell does.
pub fn shell_exit_status(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_absfilename_passes_through_clean_paths() {
        assert_eq!(get_absfilename("/src/foo.c"), "/src/foo.c");
    }

    #[test]
    fn test_absfilename_rewrites() {
        assert_eq!(get_absfilename("/src/../foo.c"), "/src/foo.c");
        assert_eq!(get_absfilename("/a/./b//c.c"), "/a/b/c.c");
        assert_eq!(get_absfilename("/a/../../b.c"), "/a/b.c");
    }

    #[test]
    fn test_absfilename_prepends_cwd() {
        let cwd = env::current_dir().unwrap();
        let abs = get_absfilename("foo.c");
        assert!(abs.starts_with('/'));
        assert!(abs.ends_with("/foo.c"));
        // The cwd itself may contain no rewritable sequences, in which case
        // the result is exactly cwd + "/foo.c".
        let expected = get_absfilename(&format!("{}/foo.c", cwd.display()));
        assert_eq!(abs, expected);
    }

    #[test]
    fn test_absfilename_idempotent() {
        for p in ["/src/../foo.c", "a/b/./c.c", "//x//y.c", "/plain.c"] {
            let once = get_absfilename(p);
            assert_eq!(get_absfilename(&once), once);
        }
    }

    #[test]
    fn test_md5_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"hello world")
            .unwrap();
        assert_eq!(md5_for_file(&path), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_md5_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::File::create(&path).unwrap();
        assert_eq!(md5_for_file(&path), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_md5_missing_file_is_empty_string() {
        assert_eq!(md5_for_file("/nonexistent/definitely/not/here"), "");
    }

    #[test]
    fn test_dwo_path() {
        assert_eq!(dwo_path("/tmp/out.o"), PathBuf::from("/tmp/out.dwo"));
        assert_eq!(dwo_path("out.pic.o"), PathBuf::from("out.pic.dwo"));
    }
}
