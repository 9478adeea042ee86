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

//! Messages exchanged with the local daemon and remote build hosts.

use std::io::Read;
use std::time::Duration;

use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::compiler::{CompileJob, Language};
use crate::errors::*;

/// Protocol version this driver speaks.
pub const PROTOCOL_VERSION: u32 = 34;

/// Oldest remote protocol this driver will talk to at all.
pub const MIN_PROTOCOL_VERSION: u32 = 27;

/// First protocol version supporting the environment-verify handshake.
pub const ENV_VERIFY_PROTOCOL: u32 = 31;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const SCHEDULER_TIMEOUT: Duration = Duration::from_secs(4 * 60);
pub const VERIFY_ENV_TIMEOUT: Duration = Duration::from_secs(60);
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(40);
pub const COMPILE_RESULT_TIMEOUT: Duration = Duration::from_secs(12 * 60);
pub const STATUS_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Ask the daemon for a build host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetCs {
    /// `(platform, version-id)` pairs the client can ship.
    pub envs: Vec<(String, String)>,
    /// Job fingerprint the scheduler uses for affinity.
    pub filename: String,
    pub lang: Language,
    /// How many concurrent assignments are wanted (replication).
    pub count: u32,
    pub target: String,
    pub arg_flags: Vec<String>,
    pub preferred_host: String,
    pub min_protocol: u32,
}

/// Scheduler assignment relayed by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseCs {
    pub hostname: String,
    pub port: u16,
    pub job_id: u32,
    pub host_platform: String,
    /// The remote already holds this environment version.
    pub got_env: bool,
    /// Diagnostic only.
    pub matched_job_id: u32,
}

/// A slice of a byte stream, deflated for the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Uncompressed payload length.
    pub len: u32,
    data: Vec<u8>,
}

impl FileChunk {
    pub fn from_plain(plain: &[u8]) -> Result<FileChunk> {
        let mut data = Vec::new();
        ZlibEncoder::new(plain, Compression::fast())
            .read_to_end(&mut data)
            .context("compressing file chunk")?;
        Ok(FileChunk {
            len: plain.len() as u32,
            data,
        })
    }

    pub fn into_plain(self) -> Result<Vec<u8>> {
        let mut plain = Vec::with_capacity(self.len as usize);
        ZlibDecoder::new(&self.data[..])
            .read_to_end(&mut plain)
            .context("decompressing file chunk")?;
        if plain.len() != self.len as usize {
            bail!("file chunk length mismatch");
        }
        Ok(plain)
    }

    /// On-wire payload size.
    pub fn compressed(&self) -> usize {
        self.data.len()
    }
}

/// Outcome of a remote compile, preceding the artifact stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileResult {
    pub status: i32,
    pub out: String,
    pub err: String,
    pub was_out_of_memory: bool,
    pub have_dwo_file: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobDoneFrom {
    Scheduler,
    Submitter,
}

/// Completion statistics the daemon forwards to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDone {
    pub job_id: u32,
    pub exitcode: i32,
    pub from: JobDoneFrom,
    pub real_msec: u64,
    pub user_msec: u64,
    pub sys_msec: u64,
    pub pfaults: u64,
    pub out_uncompressed: u64,
}

impl JobDone {
    pub fn from_submitter(job_id: u32, exitcode: i32) -> JobDone {
        JobDone {
            job_id,
            exitcode,
            from: JobDoneFrom::Submitter,
            real_msec: 0,
            user_msec: 0,
            sys_msec: 0,
            pfaults: 0,
            out_uncompressed: 0,
        }
    }
}

/// The closed message set. Every channel frame carries exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    GetCs(GetCs),
    UseCs(UseCs),
    CompileFile(CompileJob),
    FileChunk(FileChunk),
    End,
    EnvTransfer {
        platform: String,
        version: String,
    },
    VerifyEnv {
        platform: String,
        version: String,
    },
    VerifyEnvResult {
        ok: bool,
    },
    BlacklistHostEnv {
        platform: String,
        version: String,
        hostname: String,
    },
    CompileResult(CompileResult),
    JobDone(JobDone),
    StatusText {
        text: String,
    },
}

impl Message {
    /// Short tag for log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::GetCs(_) => "GetCS",
            Message::UseCs(_) => "UseCS",
            Message::CompileFile(_) => "CompileFile",
            Message::FileChunk(_) => "FileChunk",
            Message::End => "End",
            Message::EnvTransfer { .. } => "EnvTransfer",
            Message::VerifyEnv { .. } => "VerifyEnv",
            Message::VerifyEnvResult { .. } => "VerifyEnvResult",
            Message::BlacklistHostEnv { .. } => "BlacklistHostEnv",
            Message::CompileResult(_) => "CompileResult",
            Message::JobDone(_) => "JobDone",
            Message::StatusText { .. } => "StatusText",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_file_chunk_preserves_bytes() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let chunk = FileChunk::from_plain(&payload).unwrap();
        assert_eq!(chunk.len as usize, payload.len());
        assert!(chunk.compressed() > 0);
        assert_eq!(chunk.into_plain().unwrap(), payload);
    }

    #[test]
    fn test_file_chunk_rejects_length_mismatch() {
        let mut chunk = FileChunk::from_plain(b"four").unwrap();
        chunk.len = 5;
        assert!(chunk.into_plain().is_err());
    }

    #[test]
    fn test_message_roundtrip_through_bincode() {
        let msg = Message::UseCs(UseCs {
            hostname: "10.0.0.7".to_owned(),
            port: 10245,
            job_id: 42,
            host_platform: "x86_64".to_owned(),
            got_env: true,
            matched_job_id: 0,
        });
        let bytes = bincode::serialize(&msg).unwrap();
        let back: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.tag(), "UseCS");
    }
}
