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

use std::path::PathBuf;

use axum::{
    extract::multipart::MultipartError,
    http::{header::CONNECTION, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::{convert::ConversionError, Key};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not generate a unique key.")]
    RegistryFull,

    #[error("Unknown key {0}")]
    UnknownKey(Key),

    #[error("User agent does not match.")]
    Forbidden,

    /// Only ever logged, stale files never fail the operation that drops them
    #[error("Could not delete {path}")]
    ArtifactRelease {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing key")]
    MissingKey,

    #[error("Invalid file submitted (empty file)")]
    EmptyFile,

    #[error("Uploaded file is of an invalid type: {name} ({mime})")]
    InvalidFileType { name: String, mime: String },

    #[error("No file or url selected")]
    NothingSubmitted,

    #[error(transparent)]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownKey(_)
            | Self::MissingKey
            | Self::EmptyFile
            | Self::InvalidFileType { .. }
            | Self::NothingSubmitted => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Multipart(e) => e.status(),
            Self::RegistryFull
            | Self::ArtifactRelease { .. }
            | Self::Conversion(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(ErrorBody {
            success: false,
            message: self.to_string(),
        });
        let mut response = (status, body).into_response();

        // A mismatching identity must not get another try on the same connection
        if matches!(self, Self::Forbidden) {
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }

        response
    }
}
