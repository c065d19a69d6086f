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

//! Conversion of uploaded ebooks through external command line tools

use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
};

use crate::config::Converters;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("{program} error: {source}")]
    Spawn {
        program: Conversion,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code:?}\n{stderr}")]
    Failed {
        program: Conversion,
        code: Option<i32>,
        stderr: String,
    },
}

/// The converters the relay knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// EPUB to MOBI, for Kindle readers
    Kindlegen,
    /// EPUB to KEPUB, for Kobo readers
    Kepubify,
    /// Crops the margins of PDFs
    PdfCropMargins,
}

impl fmt::Display for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Kindlegen => "kindlegen",
            Self::Kepubify => "kepubify",
            Self::PdfCropMargins => "pdfcropmargins",
        })
    }
}

/// Replace a (case-insensitive) suffix of `name`, if present
fn replace_suffix(name: &str, suffix: &str, replacement: &str) -> Option<String> {
    let cut = name.len().checked_sub(suffix.len())?;
    let (stem, tail) = (name.get(..cut)?, name.get(cut..)?);
    tail.eq_ignore_ascii_case(suffix)
        .then(|| format!("{stem}{replacement}"))
}

/// Swap the EPUB extension of `name` for `extension`, treating
/// `.kepub.epub` as a plain `.epub`
fn rename_epub(name: &str, extension: &str) -> String {
    let name = replace_suffix(name, ".kepub.epub", ".epub").unwrap_or_else(|| name.to_owned());
    replace_suffix(&name, ".epub", extension).unwrap_or(name)
}

impl Conversion {
    /// Whether an exit code counts as a success. kindlegen exits with 1 when
    /// it only emitted warnings.
    #[must_use]
    pub fn accepts(self, code: Option<i32>) -> bool {
        matches!((self, code), (_, Some(0)) | (Self::Kindlegen, Some(1)))
    }

    /// Where the converted file of `input` is written
    #[must_use]
    pub fn output_path(self, input: &Path) -> PathBuf {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let output = match self {
            Self::Kindlegen => rename_epub(&name, ".mobi"),
            Self::Kepubify => rename_epub(&name, ".kepub.epub"),
            Self::PdfCropMargins => {
                let stem = replace_suffix(&name, ".pdf", "").unwrap_or(name);
                format!("{stem}_cropped.pdf")
            }
        };
        input.with_file_name(output)
    }

    /// Name under which the converted file is offered
    #[must_use]
    pub fn display_name(self, name: &str) -> String {
        match self {
            Self::Kindlegen => rename_epub(name, ".mobi"),
            Self::Kepubify => rename_epub(name, ".kepub.epub"),
            Self::PdfCropMargins => name.to_owned(),
        }
    }

    fn arguments(self, input: &Path, output: &Path) -> Vec<OsString> {
        let input = input.file_name().unwrap_or_default().to_owned();
        let output = output.file_name().unwrap_or_default().to_owned();
        match self {
            Self::Kindlegen => vec![
                input,
                "-dont_append_source".into(),
                "-c1".into(),
                "-o".into(),
                output,
            ],
            Self::Kepubify => vec!["-v".into(), "-u".into(), "-o".into(), output, input],
            Self::PdfCropMargins => vec!["-s".into(), "-u".into(), "-o".into(), output, input],
        }
    }

    fn program(self, converters: &Converters) -> &Path {
        match self {
            Self::Kindlegen => &converters.kindlegen,
            Self::Kepubify => &converters.kepubify,
            Self::PdfCropMargins => &converters.pdfcropmargins,
        }
    }

    /// Run the converter on `input`, returning the path of the converted file.
    /// The converter runs in the directory of `input`.
    ///
    /// # Errors
    ///
    /// Returns an error if the converter could not be started or failed
    pub async fn run(self, converters: &Converters, input: &Path) -> Result<PathBuf, ConversionError> {
        let output = self.output_path(input);
        let mut command = tokio::process::Command::new(self.program(converters));
        command
            .args(self.arguments(input, &output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = input.parent().filter(|p| !p.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        tracing::info!(program = %self, input = %input.display(), "Converting");
        let result = command
            .output()
            .await
            .map_err(|source| ConversionError::Spawn {
                program: self,
                source,
            })?;

        let stdout = String::from_utf8_lossy(&result.stdout);
        if !stdout.trim().is_empty() {
            tracing::debug!(program = %self, "{}", stdout.trim_end());
        }

        let code = result.status.code();
        if self.accepts(code) {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&result.stderr).into_owned();
            tracing::error!(program = %self, ?code, "{}", stderr.trim_end());
            Err(ConversionError::Failed {
                program: self,
                code,
                stderr,
            })
        }
    }
}
