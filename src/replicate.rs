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

//! Reproducibility-check replication: build one job on several hosts off a
//! shared preprocessed file and verify their objects agree byte for byte.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use fs_err as fs;
use log::{error, info, trace};
use rand::Rng;

use crate::channel::Channel;
use crate::compiler::CompileJob;
use crate::envs::EnvCatalog;
use crate::errors::*;
use crate::mock_command::{CommandChild, CommandCreator, CppOutput};
use crate::protocol::UseCs;
use crate::remote::{build_remote_int, maybe_build_local, DaemonLock};
use crate::scheduler::{get_server, request_build_host};
use crate::util::{dwo_path, md5_for_file, shell_exit_status};

/// A replica that died without producing a meaningful exit code.
const EXIT_MISC: i32 = 42;

fn caught_name<P: AsRef<Path>>(path: P) -> PathBuf {
    let mut name = path.as_ref().as_os_str().to_owned();
    name.push(".caught");
    PathBuf::from(name)
}

/// Build `job` on `torepeat` hosts at once and reconcile the results.
///
/// The preprocessor runs exactly once, into a temp file every replica
/// streams from. Slot 0 writes to the user-requested output path and is the
/// only replica emitting diagnostics; the others write to temp objects that
/// are removed before returning, whatever happens.
pub(crate) fn build_replicated<C: CommandCreator>(
    job: &mut CompileJob,
    daemon: &mut dyn Channel,
    compiler: &C,
    catalog: &EnvCatalog,
    torepeat: usize,
) -> Result<i32> {
    let preproc = tempfile::Builder::new()
        .prefix("icecc")
        .suffix(".ix")
        .tempfile()
        .context("cannot create temporary file for preprocessed source")?;
    let (preproc_file, preproc_path) = preproc
        .keep()
        .context("cannot keep temporary file for preprocessed source")?;

    let mut cpp = match compiler.call_cpp(job, CppOutput::File(preproc_file)) {
        Ok(cpp) => cpp,
        Err(_) => {
            let _ = fs::remove_file(&preproc_path);
            return Err(client_error(10, "(unable to fork process?)"));
        }
    };
    let status = match cpp.wait() {
        Ok(status) => status,
        Err(_) => {
            let _ = fs::remove_file(&preproc_path);
            return Err(client_error(10, "(unable to fork process?)"));
        }
    };
    let code = shell_exit_status(&status);
    if code != 0 {
        let _ = fs::remove_file(&preproc_path);
        return Ok(code);
    }

    // All replicas must agree on the seed, or the outputs differ by
    // construction.
    let seed: u32 = rand::thread_rng().gen();
    job.append_remote_flag(format!("-frandom-seed={}", seed));

    let mut jobs: Vec<CompileJob> = Vec::with_capacity(torepeat);
    let mut umsgs: Vec<UseCs> = Vec::with_capacity(torepeat);
    let result = run_replicas(
        job,
        daemon,
        compiler,
        catalog,
        torepeat,
        &preproc_path,
        &mut jobs,
        &mut umsgs,
    );

    // Sibling outputs are never left behind, whatever the outcome above.
    for j in jobs.iter().skip(1) {
        let _ = fs::remove_file(&j.output_file);
        if j.dwarf_fission {
            let _ = fs::remove_file(dwo_path(&j.output_file));
        }
    }
    let _ = fs::remove_file(&preproc_path);

    result
}

#[allow(clippy::too_many_arguments)]
fn run_replicas<C: CommandCreator>(
    job: &CompileJob,
    daemon: &mut dyn Channel,
    compiler: &C,
    catalog: &EnvCatalog,
    torepeat: usize,
    preproc: &Path,
    jobs: &mut Vec<CompileJob>,
    umsgs: &mut Vec<UseCs>,
) -> Result<i32> {
    request_build_host(daemon, catalog, job, torepeat as u32)?;

    for i in 0..torepeat {
        let mut replica = job.clone();
        if i > 0 {
            let output = tempfile::Builder::new()
                .prefix("icecc")
                .suffix(".o")
                .tempfile()
                .context("cannot create temporary file for replica output")?;
            let (_, path) = output
                .keep()
                .context("cannot keep temporary file for replica output")?;
            replica.output_file = path.to_string_lossy().into_owned();
        }
        jobs.push(replica);

        let usecs = get_server(daemon)?;
        trace!("got_server_for_job {}", usecs.hostname);
        umsgs.push(usecs);
    }

    let mut exit_codes = vec![EXIT_MISC; torepeat];
    let mut misc_error = false;

    let daemon: DaemonLock<'_> = Mutex::new(daemon);
    let results: Vec<Result<i32>> = thread::scope(|scope| {
        let daemon = &daemon;
        let handles: Vec<_> = jobs
            .iter_mut()
            .zip(umsgs.iter())
            .enumerate()
            .map(|(i, (replica, usecs))| {
                scope.spawn(move || -> Result<i32> {
                    if let Some(ret) = maybe_build_local(daemon, usecs, replica, compiler)? {
                        return Ok(ret);
                    }
                    let environment = catalog
                        .version(&usecs.host_platform)
                        .unwrap_or_default()
                        .to_owned();
                    let version_file = catalog
                        .version_file(&usecs.host_platform)
                        .unwrap_or_else(|| Path::new(""))
                        .to_owned();
                    build_remote_int(
                        replica,
                        usecs,
                        daemon,
                        &environment,
                        &version_file,
                        Some(preproc),
                        i == 0,
                        compiler,
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("replica worker panicked")),
            })
            .collect()
    });

    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(code) => exit_codes[i] = code,
            Err(e) => {
                info!("remote build of replica {} failed: {:#}", i, e);
                misc_error = true;
            }
        }
    }

    if misc_error {
        let _ = fs::remove_file(&jobs[0].output_file);
        if jobs[0].dwarf_fission {
            let _ = fs::remove_file(dwo_path(&jobs[0].output_file));
        }
        return Err(client_error(27, "misc error"));
    }

    Ok(reconcile_replicas(jobs, umsgs, &mut exit_codes, preproc))
}

/// Compare every sibling against slot 0. An exit-code disagreement deletes
/// the slot-0 artifacts; a digest disagreement preserves them (and the
/// preprocessed input) under `.caught` names for post-mortem analysis.
/// Either way the final exit becomes -1. Siblings with the misc sentinel
/// prove nothing and are skipped.
fn reconcile_replicas(
    jobs: &[CompileJob],
    umsgs: &[UseCs],
    exit_codes: &mut [i32],
    preproc: &Path,
) -> i32 {
    let has_split_dwarf = jobs[0].dwarf_fission;
    let first_md5 = md5_for_file(&jobs[0].output_file);

    for i in 1..jobs.len() {
        if exit_codes[0] != 0 {
            // If the first failed, we fail anyway.
            break;
        }
        if exit_codes[i] == EXIT_MISC {
            continue;
        }

        if exit_codes[i] != 0 {
            error!(
                "{} compiled with exit code {} and {} compiled with exit code {} - aborting!",
                umsgs[i].hostname, exit_codes[i], umsgs[0].hostname, exit_codes[0]
            );
            let _ = fs::remove_file(&jobs[0].output_file);
            if has_split_dwarf {
                let _ = fs::remove_file(dwo_path(&jobs[0].output_file));
            }
            exit_codes[0] = -1;
            break;
        }

        let other_md5 = md5_for_file(&jobs[i].output_file);
        if first_md5.is_empty() || other_md5.is_empty() || other_md5 != first_md5 {
            error!(
                "{} compiled {} with md5 sum {} ({}) and {} compiled with md5 sum {} - aborting!",
                umsgs[i].hostname,
                jobs[0].output_file,
                other_md5,
                jobs[i].output_file,
                umsgs[0].hostname,
                first_md5
            );
            let _ = fs::rename(&jobs[0].output_file, caught_name(&jobs[0].output_file));
            let _ = fs::rename(preproc, caught_name(preproc));
            if has_split_dwarf {
                let dwo = dwo_path(&jobs[0].output_file);
                let _ = fs::rename(&dwo, caught_name(&dwo));
            }
            exit_codes[0] = -1;
            break;
        }
    }

    exit_codes[0]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::Language;
    use tempfile::TempDir;

    fn slot(dir: &TempDir, name: &str, content: Option<&[u8]>) -> CompileJob {
        let path = dir.path().join(name);
        if let Some(content) = content {
            std::fs::write(&path, content).unwrap();
        }
        CompileJob::new(
            "gcc",
            Language::C,
            "/src/foo.c".to_owned(),
            path.to_string_lossy().into_owned(),
            "x86_64".to_owned(),
        )
    }

    fn assignment(host: &str) -> UseCs {
        UseCs {
            hostname: host.to_owned(),
            port: 10245,
            job_id: 1,
            host_platform: "x86_64".to_owned(),
            got_env: true,
            matched_job_id: 0,
        }
    }

    fn mk_preproc(dir: &TempDir) -> PathBuf {
        let p = dir.path().join("icecc1234.ix");
        std::fs::write(&p, b"preprocessed").unwrap();
        p
    }

    #[test]
    fn test_reconcile_agreement_returns_zero() {
        let dir = TempDir::new().unwrap();
        let jobs = vec![
            slot(&dir, "a.o", Some(b"object")),
            slot(&dir, "b.o", Some(b"object")),
            slot(&dir, "c.o", Some(b"object")),
        ];
        let umsgs = vec![assignment("h0"), assignment("h1"), assignment("h2")];
        let mut codes = vec![0, 0, 0];
        let preproc = mk_preproc(&dir);

        assert_eq!(reconcile_replicas(&jobs, &umsgs, &mut codes, &preproc), 0);
        assert!(Path::new(&jobs[0].output_file).exists());
        assert!(!caught_name(&jobs[0].output_file).exists());
    }

    #[test]
    fn test_reconcile_digest_mismatch_preserves_caught() {
        let dir = TempDir::new().unwrap();
        let jobs = vec![
            slot(&dir, "a.o", Some(b"object")),
            slot(&dir, "b.o", Some(b"object")),
            slot(&dir, "c.o", Some(b"DIFFERENT")),
        ];
        let umsgs = vec![assignment("h0"), assignment("h1"), assignment("h2")];
        let mut codes = vec![0, 0, 0];
        let preproc = mk_preproc(&dir);

        assert_eq!(reconcile_replicas(&jobs, &umsgs, &mut codes, &preproc), -1);
        assert!(!Path::new(&jobs[0].output_file).exists());
        assert_eq!(
            std::fs::read(caught_name(&jobs[0].output_file)).unwrap(),
            b"object"
        );
        assert_eq!(std::fs::read(caught_name(&preproc)).unwrap(), b"preprocessed");
    }

    #[test]
    fn test_reconcile_exit_mismatch_deletes_first() {
        let dir = TempDir::new().unwrap();
        let jobs = vec![
            slot(&dir, "a.o", Some(b"object")),
            slot(&dir, "b.o", None),
        ];
        let umsgs = vec![assignment("h0"), assignment("h1")];
        let mut codes = vec![0, 1];
        let preproc = mk_preproc(&dir);

        assert_eq!(reconcile_replicas(&jobs, &umsgs, &mut codes, &preproc), -1);
        assert!(!Path::new(&jobs[0].output_file).exists());
        // No divergence was proven, so nothing is preserved.
        assert!(!caught_name(&jobs[0].output_file).exists());
    }

    #[test]
    fn test_reconcile_skips_misc_sentinel() {
        let dir = TempDir::new().unwrap();
        let jobs = vec![
            slot(&dir, "a.o", Some(b"object")),
            slot(&dir, "b.o", None),
            slot(&dir, "c.o", Some(b"object")),
        ];
        let umsgs = vec![assignment("h0"), assignment("h1"), assignment("h2")];
        let mut codes = vec![0, EXIT_MISC, 0];
        let preproc = mk_preproc(&dir);

        assert_eq!(reconcile_replicas(&jobs, &umsgs, &mut codes, &preproc), 0);
        assert!(Path::new(&jobs[0].output_file).exists());
    }

    #[test]
    fn test_reconcile_failing_first_skips_comparison() {
        let dir = TempDir::new().unwrap();
        let jobs = vec![
            slot(&dir, "a.o", None),
            slot(&dir, "b.o", Some(b"object")),
        ];
        let umsgs = vec![assignment("h0"), assignment("h1")];
        let mut codes = vec![5, 0];
        let preproc = mk_preproc(&dir);

        assert_eq!(reconcile_replicas(&jobs, &umsgs, &mut codes, &preproc), 5);
    }

    #[test]
    fn test_reconcile_missing_digest_counts_as_mismatch() {
        let dir = TempDir::new().unwrap();
        // Both replicas claim success but neither produced a readable
        // object; empty digests must never compare equal.
        let jobs = vec![slot(&dir, "a.o", None), slot(&dir, "b.o", None)];
        let umsgs = vec![assignment("h0"), assignment("h1")];
        let mut codes = vec![0, 0];
        let preproc = mk_preproc(&dir);

        assert_eq!(reconcile_replicas(&jobs, &umsgs, &mut codes, &preproc), -1);
    }

    #[test]
    fn test_reconcile_renames_dwo_sidecar() {
        let dir = TempDir::new().unwrap();
        let mut jobs = vec![
            slot(&dir, "a.o", Some(b"object")),
            slot(&dir, "b.o", Some(b"DIFFERENT")),
        ];
        jobs[0].dwarf_fission = true;
        jobs[1].dwarf_fission = true;
        std::fs::write(dir.path().join("a.dwo"), b"debug").unwrap();
        let umsgs = vec![assignment("h0"), assignment("h1")];
        let mut codes = vec![0, 0];
        let preproc = mk_preproc(&dir);

        assert_eq!(reconcile_replicas(&jobs, &umsgs, &mut codes, &preproc), -1);
        assert!(!dir.path().join("a.dwo").exists());
        assert_eq!(
            std::fs::read(dir.path().join("a.dwo.caught")).unwrap(),
            b"debug"
        );
    }

    #[test]
    fn test_caught_name_appends_suffix() {
        assert_eq!(
            caught_name("/tmp/out.o"),
            PathBuf::from("/tmp/out.o.caught")
        );
        assert_eq!(
            caught_name("/tmp/icecc42.ix"),
            PathBuf::from("/tmp/icecc42.ix.caught")
        );
    }
}
