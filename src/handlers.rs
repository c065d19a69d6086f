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

use std::{
    path::{Path as FsPath, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use axum::{
    body::{boxed, HttpBody},
    extract::{multipart::Field, DefaultBodyLimit, FromRef, Multipart, Path, Query, State},
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_TYPE, ETAG, EXPIRES, IF_NONE_MATCH, SET_COOKIE},
        HeaderMap, HeaderValue, Request, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    BoxError, Json, Router, TypedHeader,
};
use base64ct::Encoding;
use bytes::Bytes;
use headers::{ETag, Expires, HeaderName, IfNoneMatch, UserAgent};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tower::ServiceExt;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    services::ServeFile,
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use ulid::Ulid;

use crate::{
    convert::Conversion,
    upload::{self, ConversionOptions, Device},
    Artifact, Config, Error, Key, Sessions,
};

#[derive(Clone)]
struct AppState {
    sessions: Sessions,
    config: Arc<Config>,
}

impl FromRef<AppState> for Sessions {
    fn from_ref(input: &AppState) -> Self {
        input.sessions.clone()
    }
}

impl FromRef<AppState> for Arc<Config> {
    fn from_ref(input: &AppState) -> Self {
        input.config.clone()
    }
}

fn client_identity(user_agent: Option<TypedHeader<UserAgent>>) -> String {
    user_agent
        .map(|TypedHeader(agent)| agent.as_str().to_owned())
        .unwrap_or_default()
}

async fn generate(
    State(sessions): State<Sessions>,
    user_agent: Option<TypedHeader<UserAgent>>,
) -> Result<impl IntoResponse, Error> {
    let key = sessions.create_session(client_identity(user_agent)).await?;

    let cookie = format!(
        "key={key}; Path=/; Max-Age={}; SameSite=Strict",
        sessions.expire_delay().as_secs()
    );
    Ok(([(SET_COOKIE, cookie)], key.to_string()))
}

#[derive(Serialize)]
struct StatusFile<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct StatusBody<'a> {
    #[serde(with = "time::serde::rfc3339")]
    alive: OffsetDateTime,
    file: Option<StatusFile<'a>>,
    urls: &'a [String],
}

/// Tag of what the reader can pick up. `alive` moves on every poll, so it
/// is left out.
fn delivery_etag(file: Option<&str>, urls: &[String]) -> ETag {
    let mut hasher = Sha256::new();
    if let Some(name) = file {
        hasher.update(b"file\0");
        hasher.update(name.as_bytes());
    }
    for url in urls {
        hasher.update(b"\0url\0");
        hasher.update(url.as_bytes());
    }
    let hash: [u8; 32] = hasher.finalize().into();
    let encoded = base64ct::Base64Url::encode_string(&hash);
    // SAFETY: Base64 encoding is URL-safe, so ETag-safe
    format!("\"{encoded}\"")
        .parse()
        .expect("base64-encoded hash should be URL-safe")
}

async fn status(
    State(sessions): State<Sessions>,
    Path(key): Path<Key>,
    user_agent: Option<TypedHeader<UserAgent>>,
    if_none_match: Option<TypedHeader<IfNoneMatch>>,
) -> Result<Response, Error> {
    let session = match sessions.authorize(&key, &client_identity(user_agent)).await {
        Ok(session) => session,
        Err(Error::UnknownKey(_)) => {
            let body = Json(serde_json::json!({ "error": "Unknown key" }));
            return Ok((StatusCode::NOT_FOUND, body).into_response());
        }
        Err(e) => return Err(e),
    };

    let file = session.artifact().map(Artifact::display_name);
    let etag = delivery_etag(file, session.urls());
    let expires = Expires::from(SystemTime::from(session.expires()));
    let headers = (TypedHeader(etag.clone()), TypedHeader(expires));

    if let Some(TypedHeader(if_none_match)) = if_none_match {
        if !if_none_match.precondition_passes(&etag) {
            return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
        }
    }

    let body = StatusBody {
        alive: session.last_alive(),
        file: file.map(|name| StatusFile { name }),
        urls: session.urls(),
    };
    Ok((headers, Json(body)).into_response())
}

async fn delete_file(
    State(sessions): State<Sessions>,
    Path(key): Path<Key>,
    user_agent: Option<TypedHeader<UserAgent>>,
) -> Result<&'static str, Error> {
    drop(sessions.authorize(&key, &client_identity(user_agent)).await?);
    sessions.clear_artifact(&key).await?;
    Ok("ok")
}

#[derive(Deserialize)]
struct DownloadQuery {
    key: Option<Key>,
}

async fn download(
    State(sessions): State<Sessions>,
    Path(filename): Path<String>,
    Query(query): Query<DownloadQuery>,
    user_agent: Option<TypedHeader<UserAgent>>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let key = if let Some(key) = query.key {
        key
    } else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    let session = match sessions.authorize(&key, &client_identity(user_agent)).await {
        Ok(session) => session,
        Err(Error::UnknownKey(_)) => return Ok(StatusCode::NOT_FOUND.into_response()),
        Err(e) => return Err(e),
    };
    let artifact = session
        .artifact()
        .filter(|artifact| artifact.display_name() == filename);
    let path = if let Some(artifact) = artifact {
        artifact.storage_location().to_owned()
    } else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let device = Device::from_user_agent(session.client_identity());

    tracing::info!(%key, path = %path.display(), name = %filename, "Sending file");

    // Forward the conditional and range headers of the reader
    let mut request = Request::new(());
    *request.headers_mut() = headers;
    // The session stays locked until the file is open, so that an upload
    // can't delete it in between
    let response = match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    drop(session);
    let mut response = response.map(boxed);

    if device == Device::Kindle {
        let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', "_"));
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            response.headers_mut().insert(CONTENT_DISPOSITION, value);
        }
    }

    Ok(response)
}

/// A file received from the uploader, not yet handed to a session
struct StoredFile {
    name: String,
    declared_type: Option<String>,
    path: PathBuf,
    size: u64,
}

impl StoredFile {
    fn discard(self) {
        Artifact::new(self.name, self.path).release_in_background();
    }
}

#[derive(Default)]
struct UploadForm {
    key: Option<Key>,
    url: Option<String>,
    file: Option<StoredFile>,
    options: ConversionOptions,
}

fn is_checked(value: &str) -> bool {
    !matches!(value.trim(), "" | "false" | "0" | "off")
}

async fn store_field(field: &mut Field<'_>, path: &FsPath) -> Result<u64, Error> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut size = 0;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(size)
}

async fn read_form(
    multipart: &mut Multipart,
    sessions: &Sessions,
    uploads_dir: &FsPath,
    form: &mut UploadForm,
) -> Result<(), Error> {
    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_owned();
                // Browsers send an empty file field when nothing was picked
                if file_name.is_empty() || form.file.is_some() {
                    continue;
                }

                // Nothing gets written for a key which is already known to be
                // wrong. A key sent after the file is checked once the form
                // is read.
                if let Some(key) = &form.key {
                    if sessions.get(key).await.is_none() {
                        return Err(Error::UnknownKey(key.clone()));
                    }
                }

                let display_name = upload::sanitize_filename(&file_name);
                let stored_name = match upload::extension(&display_name) {
                    Some(extension) => format!("file-{}.{extension}", Ulid::new()),
                    None => format!("file-{}", Ulid::new()),
                };
                let path = uploads_dir.join(stored_name);
                let declared_type = field.content_type().map(ToOwned::to_owned);

                // Recorded before writing, so that a failed transfer is cleaned up
                form.file = Some(StoredFile {
                    name: display_name,
                    declared_type,
                    path: path.clone(),
                    size: 0,
                });
                let size = store_field(&mut field, &path).await?;
                if let Some(file) = form.file.as_mut() {
                    file.size = size;
                }
            }
            "key" => form.key = Some(Key::from(field.text().await?)),
            "url" => form.url = Some(field.text().await?),
            "kindlegen" => form.options.kindlegen = is_checked(&field.text().await?),
            "kepubify" => form.options.kepubify = is_checked(&field.text().await?),
            "pdfcropmargins" => form.options.pdfcropmargins = is_checked(&field.text().await?),
            _ => {}
        }
    }

    Ok(())
}

/// Validate and convert an uploaded file, then hand it to the session.
/// Returns the name it is offered under.
async fn deliver(
    sessions: &Sessions,
    config: &Config,
    key: &Key,
    file: StoredFile,
    device: Device,
    options: ConversionOptions,
) -> Result<(String, Option<Conversion>), Error> {
    tracing::info!(%key, name = %file.name, size = file.size, "Uploaded file");

    if file.size == 0 {
        file.discard();
        return Err(Error::EmptyFile);
    }

    let mime = match upload::check_file_type(&file.name, file.declared_type.as_deref()) {
        Ok(mime) => mime,
        Err(e) => {
            file.discard();
            return Err(e);
        }
    };

    let mut name = file.name.clone();
    if device == Device::Kindle {
        name = upload::kindle_filename(&name);
    }

    let conversion = options.select(&mime, device);
    let path = if let Some(conversion) = conversion {
        name = conversion.display_name(&name);
        let result = conversion.run(&config.converters, &file.path).await;
        // The original upload is not needed anymore either way
        file.discard();
        result?
    } else {
        file.path
    };

    sessions
        .set_artifact(key, Artifact::new(name.clone(), path))
        .await?;
    Ok((name, conversion))
}

#[derive(Serialize)]
struct UploadResponse {
    success: bool,
    message: Vec<String>,
    key: Key,
    url: Option<String>,
}

async fn upload(
    State(sessions): State<Sessions>,
    State(config): State<Arc<Config>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, Error> {
    let mut form = UploadForm::default();
    if let Err(e) = read_form(&mut multipart, &sessions, &config.uploads_dir, &mut form).await {
        tracing::warn!(error = %e, "Rejected upload");
        if let Some(file) = form.file {
            file.discard();
        }
        return Err(e);
    }

    let checked = if let Some(key) = form.key {
        let agent = sessions
            .get(&key)
            .await
            .map(|session| session.client_identity().to_owned());
        match agent {
            Some(agent) => Ok((key, agent)),
            None => Err(Error::UnknownKey(key)),
        }
    } else {
        Err(Error::MissingKey)
    };

    let (key, agent) = match checked {
        Ok(checked) => checked,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected upload");
            if let Some(file) = form.file {
                file.discard();
            }
            return Err(e);
        }
    };
    sessions.touch(&key).await;

    let url = form
        .url
        .map(|url| url.trim().to_owned())
        .filter(|url| !url.is_empty());
    if let Some(url) = &url {
        sessions.add_url(&key, url).await?;
    }

    let mut message = Vec::new();
    if let Some(file) = form.file {
        let device = Device::from_user_agent(&agent);
        let (name, conversion) =
            deliver(&sessions, &config, &key, file, device, form.options).await?;
        let sent = match conversion {
            Some(conversion) => format!("Ebook was converted with {conversion} and sent"),
            None => "Sent".to_owned(),
        };
        message.push(format!("Upload successful! {sent} to {}", device.describe()));
        message.push(name);
    }
    if let Some(url) = &url {
        message.push(format!("Added url: {url}"));
    }

    if message.is_empty() {
        return Err(Error::NothingSubmitted);
    }

    Ok(Json(UploadResponse {
        success: true,
        message,
        key,
        url,
    }))
}

/// Build the relay router, mounted under `prefix`
///
/// `sessions` should come from [`Sessions::from_config`] with the same
/// `config`, so that cookies advertise the lifetime keys really have.
#[must_use]
pub fn router<B>(prefix: &str, sessions: Sessions, config: Config) -> Router<(), B>
where
    B: HttpBody + Send + 'static,
    <B as HttpBody>::Data: Into<Bytes> + Send,
    <B as HttpBody>::Error: Into<BoxError>,
{
    let max_bytes = config.max_bytes;
    let state = AppState {
        sessions,
        config: Arc::new(config),
    };

    let router = Router::new()
        .route("/generate", post(generate))
        .route("/upload", post(upload))
        .route("/file/:key", delete(delete_file))
        .route("/status/:key", get(status))
        .route("/:filename", get(download))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_bytes))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-max-bytes"),
            HeaderValue::from(max_bytes),
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers([CONTENT_TYPE, IF_NONE_MATCH])
                .expose_headers([ETAG, EXPIRES, HeaderName::from_static("x-max-bytes")]),
        )
        .layer(TraceLayer::new_for_http());

    let prefix = prefix.trim_end_matches('/');
    let router = if prefix.is_empty() {
        router
    } else {
        Router::new().nest(prefix, router)
    };

    router.with_state(state)
}
