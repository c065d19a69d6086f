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

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

use bytesize::ByteSize;
use clap::Parser;
use ereader_relay::{Config, Converters, Sessions};
use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

#[derive(Parser)]
struct Options {
    /// Address on which to listen
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    address: IpAddr,

    /// Port on which to listen
    #[arg(short, long, default_value_t = 3001)]
    port: u16,

    /// Path prefix on which to mount the relay
    #[arg(long)]
    prefix: Option<String>,

    /// How long a key stays alive after its last access
    #[arg(long, default_value = "30s")]
    expire_delay: humantime::Duration,

    /// How long a key lives at most, however often it is accessed
    #[arg(long, default_value = "1h")]
    max_expire_duration: humantime::Duration,

    /// Maximum upload size
    #[arg(short, long, default_value = "800MiB")]
    max_bytes: ByteSize,

    /// Directory where uploaded files are kept. Wiped on startup.
    #[arg(long, default_value = "uploads")]
    uploads_dir: PathBuf,

    /// kindlegen executable
    #[arg(long, default_value = "kindlegen")]
    kindlegen: PathBuf,

    /// kepubify executable
    #[arg(long, default_value = "kepubify")]
    kepubify: PathBuf,

    /// pdfcropmargins executable
    #[arg(long, default_value = "pdfcropmargins")]
    pdfcropmargins: PathBuf,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Could not listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let options = Options::parse();
    let prefix = options.prefix.unwrap_or_default();
    let addr = SocketAddr::from((options.address, options.port));

    // Files left over from a previous run belong to sessions which are gone
    match tokio::fs::remove_dir_all(&options.uploads_dir).await {
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    tokio::fs::create_dir_all(&options.uploads_dir).await?;

    let config = Config {
        expire_delay: options.expire_delay.into(),
        max_expire_duration: options.max_expire_duration.into(),
        max_bytes: usize::try_from(options.max_bytes.as_u64()).unwrap_or(usize::MAX),
        uploads_dir: options.uploads_dir,
        converters: Converters {
            kindlegen: options.kindlegen,
            kepubify: options.kepubify,
            pdfcropmargins: options.pdfcropmargins,
        },
    };

    tracing::info!("Listening on http://{addr}");
    tracing::info!(
        "Key expiry: {expire_delay} after last access, {max_expire_duration} at most, maximum upload size: {max_bytes}",
        expire_delay = options.expire_delay,
        max_expire_duration = options.max_expire_duration,
        max_bytes = options.max_bytes,
    );

    let sessions = Sessions::from_config(&config);
    let service = ereader_relay::router(&prefix, sessions.clone(), config);

    let result = hyper::Server::bind(&addr)
        .serve(service.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sessions.shutdown().await;
    result.map_err(|e| std::io::Error::new(ErrorKind::Other, e))
}
