// Copyright 2022 The Matrix.org Foundation C.I.C.
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

use std::{path::PathBuf, time::Duration};

/// Settings of the relay
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a session lives after its last access (default: 30s)
    pub expire_delay: Duration,

    /// Absolute lifetime of a session, never extended (default: 1h)
    pub max_expire_duration: Duration,

    /// Maximum request body size, in bytes (default: 800 MiB)
    pub max_bytes: usize,

    /// Where uploaded files are stored
    pub uploads_dir: PathBuf,

    /// Converter executables
    pub converters: Converters,
}

/// Program names or paths of the external converters
#[derive(Debug, Clone)]
pub struct Converters {
    pub kindlegen: PathBuf,
    pub kepubify: PathBuf,
    pub pdfcropmargins: PathBuf,
}

impl Default for Converters {
    fn default() -> Self {
        Self {
            kindlegen: "kindlegen".into(),
            kepubify: "kepubify".into(),
            pdfcropmargins: "pdfcropmargins".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            expire_delay: Duration::from_secs(30),
            max_expire_duration: Duration::from_secs(60 * 60),
            max_bytes: 800 * 1024 * 1024,
            uploads_dir: "uploads".into(),
            converters: Converters::default(),
        }
    }
}
