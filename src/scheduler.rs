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

//! The assignment dialogue with the local daemon, which brokers the
//! cluster scheduler. The driver never talks to the scheduler directly.

use std::env;

use log::warn;

use crate::channel::Channel;
use crate::compiler::CompileJob;
use crate::envs::EnvCatalog;
use crate::errors::*;
use crate::protocol::{
    GetCs, Message, UseCs, ENV_VERIFY_PROTOCOL, MIN_PROTOCOL_VERSION, SCHEDULER_TIMEOUT,
};
use crate::util::get_absfilename;

/// Whether hosts that cannot verify a shipped environment are refused.
pub fn ignore_unverified() -> bool {
    env::var_os("ICECC_IGNORE_UNVERIFIED").is_some()
}

/// Minimal protocol version of a remote host we want for the job: the
/// system-wide floor, raised to the verify handshake when unverified hosts
/// are refused.
pub fn minimal_remote_version(refuse_unverified: bool) -> u32 {
    if refuse_unverified {
        MIN_PROTOCOL_VERSION.max(ENV_VERIFY_PROTOCOL)
    } else {
        MIN_PROTOCOL_VERSION
    }
}

/// The scheduler fingerprint for a job. A single build hashes the flags in
/// as well; replicated builds use the canonical input path alone so all
/// replicas land on the same record.
pub fn job_fingerprint(job: &CompileJob, count: u32) -> String {
    let mut filename = String::new();
    if count == 1 {
        for flag in job.remote_flags.iter().chain(job.rest_flags.iter()) {
            filename.push('/');
            filename.push_str(flag);
        }
    }
    filename.push_str(&get_absfilename(&job.input_file));
    filename
}

/// Send the `GetCS` request for `count` assignments.
pub fn request_build_host(
    daemon: &mut dyn Channel,
    catalog: &EnvCatalog,
    job: &CompileJob,
    count: u32,
) -> Result<()> {
    let preferred_host = env::var("ICECC_PREFERRED_HOST").unwrap_or_default();
    let getcs = GetCs {
        envs: catalog.envs.clone(),
        filename: job_fingerprint(job, count),
        lang: job.language.clone(),
        count,
        target: job.target_platform.clone(),
        arg_flags: job.argument_flags.clone(),
        preferred_host,
        min_protocol: minimal_remote_version(ignore_unverified()),
    };

    if let Err(e) = daemon.send_msg(&Message::GetCs(getcs)) {
        warn!("asked for CS: {}", e);
        return Err(client_error(24, "asked for CS"));
    }
    Ok(())
}

/// Await one `UseCS` assignment from the daemon.
pub fn get_server(daemon: &mut dyn Channel) -> Result<UseCs> {
    match daemon.get_msg(SCHEDULER_TIMEOUT) {
        Some(Message::UseCs(usecs)) => Ok(usecs),
        other => {
            warn!(
                "replied not with use_cs: {}",
                other.as_ref().map_or("<none>", |m| m.tag())
            );
            Err(client_error(
                1,
                "expected use_cs reply, but got something else",
            ))
        }
    }
}
