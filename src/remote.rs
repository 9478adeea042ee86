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

//! Dispatch of one compile job to an assigned build host: environment
//! shipment and verification, source streaming, artifact receive, and the
//! loopback shortcut.

use std::env;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use fs_err as fs;
use log::{debug, error, info, trace, warn};
use rand::Rng;

use crate::channel::{connect_to_host, Channel};
use crate::compiler::CompileJob;
use crate::envs::{usable_catalog, Environments};
use crate::errors::*;
use crate::mock_command::{CommandChild, CommandCreator, CppOutput};
use crate::protocol::{
    CompileResult, FileChunk, JobDone, Message, UseCs, CHUNK_TIMEOUT, COMPILE_RESULT_TIMEOUT,
    CONNECT_TIMEOUT, ENV_VERIFY_PROTOCOL, STATUS_DRAIN_TIMEOUT, VERIFY_ENV_TIMEOUT,
};
use crate::replicate;
use crate::scheduler::{get_server, ignore_unverified, request_build_host};
use crate::util::{child_usage, dwo_path, shell_exit_status};

/// The daemon channel shared between the assignment dialogue and the
/// JobDone/Blacklist reports; one operation in flight at a time.
pub(crate) type DaemonLock<'a> = Mutex<&'a mut (dyn Channel + 'a)>;

/// Streaming buffer for source and environment bytes.
const CHUNK_BUFFER: usize = 100_000;

fn check_for_failure(msg: &Message, conn: &dyn Channel) -> Result<()> {
    if let Message::StatusText { text } = msg {
        error!(
            "remote status (compiled on {}): {}",
            conn.peer_name(),
            text
        );
        return Err(client_error(
            23,
            format!("remote status (compiled on {})\n{}", conn.peer_name(), text),
        ));
    }
    Ok(())
}

/// Late remote errors must reach the user log even while unwinding; pull
/// whatever status messages are pending before the channel goes away.
fn drain_pending_status(conn: &mut dyn Channel) {
    while let Some(msg) = conn.get_msg(Duration::ZERO) {
        if let Message::StatusText { text } = msg {
            error!(
                "remote status (compiled on {}): {}",
                conn.peer_name(),
                text
            );
        }
    }
}

/// Stream `source` to the remote in bounded chunks (C6). The source is
/// closed when this returns, success or not; the caller sends the trailing
/// `End`.
pub(crate) fn send_file_chunks<R: Read>(mut source: R, conn: &mut dyn Channel) -> Result<()> {
    let mut buffer = vec![0u8; CHUNK_BUFFER];
    let mut offset = 0;
    let mut uncompressed: u64 = 0;
    let mut compressed: u64 = 0;

    loop {
        let bytes = loop {
            match source.read(&mut buffer[offset..]) {
                Ok(n) => break n,
                Err(ref e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    continue
                }
                Err(e) => {
                    error!("reading local source failed: {}", e);
                    return Err(client_error(16, "error reading local cpp file"));
                }
            }
        };

        offset += bytes;

        if bytes == 0 || offset == buffer.len() {
            if offset > 0 {
                let chunk = FileChunk::from_plain(&buffer[..offset])?;
                let wire = chunk.compressed() as u64;
                if conn.send_msg(&Message::FileChunk(chunk)).is_err() {
                    // The remote may have told us why it tore the
                    // connection down; give it a moment to say so.
                    if let Some(m) = conn.get_msg(STATUS_DRAIN_TIMEOUT) {
                        check_for_failure(&m, conn)?;
                    }
                    error!("write of source chunk to host {} failed", conn.peer_name());
                    return Err(client_error(15, "write to host failed"));
                }
                uncompressed += offset as u64;
                compressed += wire;
                offset = 0;
            }

            if bytes == 0 {
                break;
            }
        }
    }

    if uncompressed > 0 {
        trace!(
            "sent {} bytes ({}%)",
            compressed,
            compressed * 100 / uncompressed
        );
    }
    Ok(())
}

/// Receive chunks into `sink` until `End` (C7 inner loop).
fn receive_chunks(sink: &mut dyn Write, conn: &mut dyn Channel) -> Result<()> {
    let mut uncompressed: u64 = 0;
    let mut compressed: u64 = 0;

    loop {
        match conn.get_msg(CHUNK_TIMEOUT) {
            None => return Err(client_error(19, "(network failure?)")),
            Some(Message::End) => break,
            Some(Message::FileChunk(chunk)) => {
                compressed += chunk.compressed() as u64;
                uncompressed += chunk.len as u64;
                let plain = chunk
                    .into_plain()
                    .map_err(|_| client_error(20, "unexpected message"))?;
                sink.write_all(&plain)
                    .map_err(|_| client_error(21, "error writing file"))?;
            }
            Some(msg) => {
                check_for_failure(&msg, conn)?;
                return Err(client_error(20, "unexpected message"));
            }
        }
    }

    if uncompressed > 0 {
        trace!(
            "got {} bytes ({}%)",
            compressed,
            compressed * 100 / uncompressed
        );
    }
    Ok(())
}

#[cfg(unix)]
fn create_output_temp(path: &str) -> io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(path)
}

#[cfg(not(unix))]
fn create_output_temp(path: &str) -> io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Receive an artifact into `output`, publishing it atomically: bytes land
/// in `<output>_icetmp` and are renamed into place only once fully written
/// and synced. On failure the temp is unlinked and `output` is untouched.
fn receive_file(output: &str, conn: &mut dyn Channel) -> Result<()> {
    let tmp_file = format!("{}_icetmp", output);
    let mut obj = match create_output_temp(&tmp_file) {
        Ok(f) => f,
        Err(e) => {
            error!("can't create {}: {}", tmp_file, e);
            return Err(client_error(31, format!("can't create {}", tmp_file)));
        }
    };

    if let Err(e) = receive_chunks(&mut obj, conn) {
        drop(obj);
        let _ = fs::remove_file(&tmp_file);
        return Err(e);
    }

    if obj.sync_all().is_err() || fs::rename(&tmp_file, output).is_err() {
        let _ = fs::remove_file(&tmp_file);
        return Err(client_error(30, "error closing temp file"));
    }
    Ok(())
}

/// Ship the compile environment to the remote and, on protocol ≥ 31, have
/// the remote verify it can actually run it (C5).
fn transfer_env(
    conn: &mut dyn Channel,
    daemon: &DaemonLock<'_>,
    job: &CompileJob,
    version_file: &Path,
) -> Result<()> {
    debug!(
        "transferring environment {} ({}) to {}",
        job.environment_version,
        job.target_platform,
        conn.peer_name()
    );

    if fs::metadata(version_file).is_err() {
        return Err(client_error(4, "unable to stat version file"));
    }

    conn.send_msg(&Message::EnvTransfer {
        platform: job.target_platform.clone(),
        version: job.environment_version.clone(),
    })
    .map_err(|_| client_error(6, "send environment to remote failed"))?;

    let env_fd = fs::File::open(version_file).map_err(|_| {
        client_error(
            5,
            format!("unable to open version file:\n\t{}", version_file.display()),
        )
    })?;
    send_file_chunks(env_fd, conn)?;

    if conn.send_msg(&Message::End).is_err() {
        error!("write of environment failed");
        return Err(client_error(8, "write environment to remote failed"));
    }

    if conn.protocol() >= ENV_VERIFY_PROTOCOL {
        conn.send_msg(&Message::VerifyEnv {
            platform: job.target_platform.clone(),
            version: job.environment_version.clone(),
        })
        .map_err(|_| client_error(22, "error sending environment"))?;

        match conn.get_msg(VERIFY_ENV_TIMEOUT) {
            Some(Message::VerifyEnvResult { ok: true }) => {
                trace!(
                    "verified host {} for environment {} ({})",
                    conn.peer_name(),
                    job.environment_version,
                    job.target_platform
                );
            }
            Some(Message::VerifyEnvResult { ok: false }) => {
                // The remote can't handle the environment at all (e.g.
                // kernel too old); mark it as never to be used again for
                // this environment.
                info!(
                    "host {} did not successfully verify environment",
                    conn.peer_name()
                );
                let blacklist = Message::BlacklistHostEnv {
                    platform: job.target_platform.clone(),
                    version: job.environment_version.clone(),
                    hostname: conn.peer_name().to_owned(),
                };
                if let Err(e) = daemon.lock().unwrap().send_msg(&blacklist) {
                    warn!("blacklisting {} failed: {}", conn.peer_name(), e);
                }
                return Err(client_error(
                    24,
                    format!("remote {} unable to handle environment", conn.peer_name()),
                ));
            }
            _ => {
                return Err(client_error(
                    25,
                    "other error verifying environment on remote",
                ))
            }
        }
    }
    Ok(())
}

/// The compile against one connected host: C5 through C7 in protocol order.
pub(crate) fn perform_remote_build<C: CommandCreator>(
    conn: &mut dyn Channel,
    job: &mut CompileJob,
    usecs: &UseCs,
    daemon: &DaemonLock<'_>,
    version_file: &Path,
    preproc: Option<&Path>,
    emit_output: bool,
    compiler: &C,
) -> Result<i32> {
    if !usecs.got_env {
        transfer_env(conn, daemon, job, version_file)?;
    }

    if conn.protocol() < ENV_VERIFY_PROTOCOL && ignore_unverified() {
        warn!("host {} cannot be verified", conn.peer_name());
        return Err(client_error(
            26,
            format!("environment on {} cannot be verified", conn.peer_name()),
        ));
    }

    debug!("send compile_file");
    if conn.send_msg(&Message::CompileFile(job.clone())).is_err() {
        info!("write of job failed");
        return Err(client_error(9, "error sending file to remote"));
    }

    if job.streaming {
        debug!("sending stdin");
        send_file_chunks(io::stdin().lock(), conn)?;
    } else if let Some(preproc) = preproc {
        let cpp_fd = fs::File::open(preproc)
            .map_err(|_| client_error(11, "unable to open preprocessed file"))?;
        send_file_chunks(cpp_fd, conn)?;
    } else {
        let mut cpp = compiler
            .call_cpp(job, CppOutput::Pipe)
            .map_err(|_| client_error(18, "(fork error?)"))?;
        let cpp_out = cpp
            .take_stdout()
            .ok_or_else(|| client_error(18, "(fork error?)"))?;

        if let Err(e) = send_file_chunks(cpp_out, conn) {
            cpp.terminate();
            let _ = cpp.wait();
            return Err(e);
        }

        debug!("wait for cpp");
        let status = cpp.wait().map_err(|_| client_error(18, "(fork error?)"))?;
        let code = shell_exit_status(&status);
        if code != 0 {
            // A preprocessor failure is the user's compile error, not a
            // remote one.
            return Ok(code);
        }
    }

    if conn.send_msg(&Message::End).is_err() {
        info!("write of end failed");
        return Err(client_error(12, "failed to send file to remote"));
    }

    debug!("wait for cs");
    let msg = conn
        .get_msg(COMPILE_RESULT_TIMEOUT)
        .ok_or_else(|| client_error(14, "error reading message from remote"))?;
    check_for_failure(&msg, conn)?;
    let crmsg: CompileResult = match msg {
        Message::CompileResult(c) => c,
        other => {
            warn!("waited for compile result, but got {}", other.tag());
            return Err(client_error(13, "did not get compile response message"));
        }
    };

    let status = crmsg.status;

    if status != 0 && crmsg.was_out_of_memory {
        info!("the server ran out of memory, recompiling locally");
        return Err(remote_error(
            101,
            "the server ran out of memory, recompiling locally",
        ));
    }

    if emit_output {
        if (!crmsg.out.is_empty() || !crmsg.err.is_empty()) && job.output_needs_workaround() {
            info!("command needs stdout/stderr workaround, recompiling locally");
            return Err(remote_error(
                102,
                "command needs stdout/stderr workaround, recompiling locally",
            ));
        }

        let _ = io::stdout().write_all(crmsg.out.as_bytes());
        let _ = io::stderr().write_all(crmsg.err.as_bytes());

        if status != 0 && (!crmsg.out.is_empty() || !crmsg.err.is_empty()) {
            error!("compiled on {}", conn.peer_name());
        }
    }

    if status == 0 {
        if job.streaming {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            receive_chunks(&mut handle, conn)?;
        } else {
            receive_file(&job.output_file, conn)?;
            if crmsg.have_dwo_file {
                let dwo = dwo_path(&job.output_file);
                receive_file(&dwo.to_string_lossy(), conn)?;
            }
        }
    }

    Ok(status)
}

/// Dial the assigned host and run the compile there (C8). On any failure
/// the channel is drained of pending status text before it is closed.
pub(crate) fn build_remote_int<C: CommandCreator>(
    job: &mut CompileJob,
    usecs: &UseCs,
    daemon: &DaemonLock<'_>,
    environment: &str,
    version_file: &Path,
    preproc: Option<&Path>,
    emit_output: bool,
    compiler: &C,
) -> Result<i32> {
    job.job_id = usecs.job_id;
    // hoping on the scheduler's wisdom
    job.environment_version = environment.to_owned();
    trace!(
        "have to use host {}:{} - job id: {} - env: {} - has env: {} - match j: {}",
        usecs.hostname,
        usecs.port,
        job.job_id,
        usecs.host_platform,
        usecs.got_env,
        usecs.matched_job_id
    );

    let mut conn = match connect_to_host(&usecs.hostname, usecs.port, CONNECT_TIMEOUT) {
        Ok(conn) => conn,
        Err(e) => {
            error!(
                "no server found behind given hostname {}:{} ({})",
                usecs.hostname, usecs.port, e
            );
            return Err(client_error(
                2,
                format!("no server found at {}", usecs.hostname),
            ));
        }
    };

    let result = perform_remote_build(
        &mut conn,
        job,
        usecs,
        daemon,
        version_file,
        preproc,
        emit_output,
        compiler,
    );
    if result.is_err() {
        drain_pending_status(&mut conn);
    }
    result
}

/// When the scheduler hands back the loopback address it wants the job
/// built by the submitter itself; do so and report the statistics the
/// daemon forwards on our behalf. Returns `None` when the job should go
/// remote after all.
pub(crate) fn maybe_build_local<C: CommandCreator>(
    daemon: &DaemonLock<'_>,
    usecs: &UseCs,
    job: &mut CompileJob,
    compiler: &C,
) -> Result<Option<i32>> {
    if usecs.hostname != "127.0.0.1" {
        return Ok(None);
    }
    // A test daemon runs with remote builds disabled and marks assignments
    // it wants exercised remotely with a non-zero port.
    if env::var_os("ICECC_TEST_REMOTEBUILD").is_some() && usecs.port != 0 {
        return Ok(None);
    }

    trace!("building myself, but telling localhost");
    job.job_id = usecs.job_id;
    job.environment_version = "__client".to_owned();

    if daemon
        .lock()
        .unwrap()
        .send_msg(&Message::CompileFile(job.clone()))
        .is_err()
    {
        info!("write of job failed");
        return Err(client_error(29, "write of job failed"));
    }

    let started = Instant::now();
    let usage_before = child_usage();
    let ret = compiler.build_local(job).context("local build failed")?;
    let usage = child_usage().since(&usage_before);

    // Filling the stats, so the daemon can play proxy for us.
    let mut done = JobDone::from_submitter(job.job_id, ret);
    done.real_msec = started.elapsed().as_millis() as u64;
    done.user_msec = usage.user_msec;
    done.sys_msec = usage.sys_msec;
    done.pfaults = usage.pfaults;
    done.out_uncompressed = fs::metadata(&job.output_file).map(|m| m.len()).unwrap_or(0)
        + fs::metadata(dwo_path(&job.output_file))
            .map(|m| m.len())
            .unwrap_or(0);

    if done.user_msec > 50 && done.out_uncompressed > 1024 {
        trace!("speed={}", done.out_uncompressed / done.user_msec);
    }

    if let Err(e) = daemon.lock().unwrap().send_msg(&Message::JobDone(done)) {
        warn!("could not report job statistics to the local daemon: {}", e);
    }
    Ok(Some(ret))
}

/// Drive one compile job through the cluster: obtain an assignment, decide
/// between loopback and remote, and for a sampled fraction of jobs build on
/// several hosts at once and compare the results.
pub fn build_remote<C: CommandCreator>(
    job: &mut CompileJob,
    daemon: &mut dyn Channel,
    compiler: &C,
    envs: &Environments,
    permill: u32,
) -> Result<i32> {
    let mut torepeat = 1;
    // Streaming jobs cannot be replayed, and clang lacks the options that
    // make its output reproducible.
    if !job.is_clang() && !job.streaming && rand::thread_rng().gen_range(0..1000u32) < permill {
        torepeat = 3;
    }
    trace!(
        "{} compiled {} times on {}",
        job.input_file,
        torepeat,
        job.target_platform
    );

    let catalog = usable_catalog(envs)?;

    if torepeat == 1 {
        request_build_host(daemon, &catalog, job, 1)?;
        let usecs = get_server(daemon)?;
        debug!("scheduler assigned {}", usecs.hostname);

        let daemon: DaemonLock<'_> = Mutex::new(daemon);
        if let Some(ret) = maybe_build_local(&daemon, &usecs, job, compiler)? {
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
            job,
            &usecs,
            &daemon,
            &environment,
            &version_file,
            None,
            true,
            compiler,
        )
    } else {
        replicate::build_replicated(job, daemon, compiler, &catalog, torepeat)
    }
}
