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

//! Relay files and URLs to e-readers.
//!
//! A reader asks for a short pairing [`Key`], an uploader sends a file or a
//! URL tagged with that key, and the reader polls and downloads it before the
//! key expires. Sessions live in memory only, in [`Sessions`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod config;
pub mod convert;
mod error;
mod handlers;
mod key;
mod sessions;
pub mod upload;


pub use self::{
    config::{Config, Converters},
    error::Error,
    handlers::router,
    key::{Key, KEY_ALPHABET, KEY_LENGTH},
    sessions::{Artifact, Session, Sessions},
};
