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

use serde::{Deserialize, Serialize};

/// Source language of a compile job, as the wrapper classified it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    #[default]
    C,
    Cxx,
    ObjC,
    Custom(String),
}

/// One compilation as handed over by the wrapper's argument parser.
///
/// The flags are pre-split the way the scheduler wants them: `remote_flags`
/// travel to the build host, `rest_flags` stay meaningful for preprocessing,
/// and `argument_flags` describe the job to the scheduler. The driver
/// mutates only `job_id` and `environment_version`, both assigned while the
/// job is being placed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompileJob {
    pub job_id: u32,
    pub language: Language,
    pub compiler_name: String,
    pub environment_version: String,
    pub input_file: String,
    pub output_file: String,
    pub target_platform: String,
    pub remote_flags: Vec<String>,
    pub rest_flags: Vec<String>,
    pub argument_flags: Vec<String>,
    /// Preprocessed source arrives on stdin and the object leaves on stdout.
    pub streaming: bool,
    /// The compile produces a `.dwo` debug-info sidecar beside the object.
    pub dwarf_fission: bool,
}

impl CompileJob {
    pub fn new(
        compiler_name: impl Into<String>,
        language: Language,
        input_file: impl Into<String>,
        output_file: impl Into<String>,
        target_platform: impl Into<String>,
    ) -> CompileJob {
        CompileJob {
            compiler_name: compiler_name.into(),
            language,
            input_file: input_file.into(),
            output_file: output_file.into(),
            target_platform: target_platform.into(),
            ..Default::default()
        }
    }

    pub fn is_clang(&self) -> bool {
        self.compiler_name.contains("clang")
    }

    /// Whether remote stdout/stderr from this job cannot be reproduced
    /// faithfully and the compile has to be redone locally. Clang driven
    /// through `-frewrite-includes` emits diagnostics against the rewritten
    /// source.
    pub fn output_needs_workaround(&self) -> bool {
        self.is_clang() && self.rest_flags.iter().any(|f| f == "-frewrite-includes")
    }

    /// Append a flag to those shipped to the build host.
    pub fn append_remote_flag<S: Into<String>>(&mut self, flag: S) {
        self.remote_flags.push(flag.into());
    }
}
