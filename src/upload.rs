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

//! Checks applied to uploaded files before they are handed to a session

use mime::Mime;

use crate::{convert::Conversion, Error};

pub const TYPE_EPUB: &str = "application/epub+zip";
pub const TYPE_MOBI: &str = "application/x-mobipocket-ebook";
const TYPE_CBZ: &str = "application/vnd.comicbook+zip";
const TYPE_CBR: &str = "application/vnd.comicbook-rar";

const ALLOWED_TYPES: &[&str] = &[
    TYPE_EPUB,
    TYPE_MOBI,
    "application/pdf",
    TYPE_CBZ,
    TYPE_CBR,
    "text/html",
    "text/plain",
    "application/zip",
    "application/x-rar-compressed",
];

const ALLOWED_EXTENSIONS: &[&str] = &["epub", "mobi", "pdf", "cbz", "cbr", "html", "txt"];

/// The kind of reader a session was created from, guessed from its user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Kindle,
    Kobo,
    Other,
}

impl Device {
    #[must_use]
    pub fn from_user_agent(agent: &str) -> Self {
        if agent.contains("Kindle") {
            Self::Kindle
        } else if agent.contains("Kobo") {
            Self::Kobo
        } else {
            Self::Other
        }
    }

    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::Kindle => "a Kindle device.",
            Self::Kobo => "a Kobo device.",
            Self::Other => "a device.",
        }
    }
}

/// Conversions requested alongside an upload
#[derive(Debug, Default, Clone, Copy)]
pub struct ConversionOptions {
    pub kindlegen: bool,
    pub kepubify: bool,
    pub pdfcropmargins: bool,
}

impl ConversionOptions {
    /// The conversion to apply to a file of type `mime` sent to `device`, if any
    #[must_use]
    pub fn select(self, mime: &Mime, device: Device) -> Option<Conversion> {
        match (mime.essence_str(), device) {
            (TYPE_EPUB, Device::Kindle) if self.kindlegen => Some(Conversion::Kindlegen),
            (TYPE_EPUB, Device::Kobo) if self.kepubify => Some(Conversion::Kepubify),
            ("application/pdf", _) if self.pdfcropmargins => Some(Conversion::PdfCropMargins),
            _ => None,
        }
    }
}

/// Lowercased extension of a file name
#[must_use]
pub fn extension(name: &str) -> Option<String> {
    let (_, extension) = name.rsplit_once('.')?;
    Some(extension.to_ascii_lowercase())
}

/// Reduce a client-provided file name to something safe to show and serve
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let name = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let name: String = name
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*'))
        .collect();
    let name = name.trim_end_matches(['.', ' ']).trim_start();
    if name.is_empty() {
        "file".to_owned()
    } else {
        name.to_owned()
    }
}

/// Kindle browsers choke on anything but a few ASCII characters in names
#[must_use]
pub fn kindle_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '"' | '\'' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn type_from_extension(extension: &str) -> Option<&'static str> {
    Some(match extension {
        "epub" => TYPE_EPUB,
        "mobi" => TYPE_MOBI,
        "pdf" => "application/pdf",
        "cbz" => TYPE_CBZ,
        "cbr" => TYPE_CBR,
        "html" => "text/html",
        "txt" => "text/plain",
        _ => return None,
    })
}

/// Work out the type of an uploaded file from its declared content type and
/// its name, rejecting anything the readers can't open
///
/// # Errors
///
/// Returns [`Error::InvalidFileType`] if the extension or the type are not
/// allowed
pub fn check_file_type(name: &str, declared: Option<&str>) -> Result<Mime, Error> {
    let invalid = |mime: &str| Error::InvalidFileType {
        name: name.to_owned(),
        mime: mime.to_owned(),
    };

    let extension = extension(name)
        .filter(|e| ALLOWED_EXTENSIONS.contains(&e.as_str()))
        .ok_or_else(|| invalid(declared.unwrap_or("unknown mimetype")))?;

    let declared = declared
        .and_then(|d| d.parse::<Mime>().ok())
        .unwrap_or(mime::APPLICATION_OCTET_STREAM);

    let essence = match declared.essence_str() {
        "application/octet-stream" => type_from_extension(&extension).unwrap_or_default(),
        "application/epub" => TYPE_EPUB,
        essence => essence,
    };

    if ALLOWED_TYPES.contains(&essence) {
        essence.parse().map_err(|_| invalid(essence))
    } else {
        Err(invalid(declared.essence_str()))
    }
}
