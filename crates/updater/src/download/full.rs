//! Plain streaming download of a whole file.

use super::session::{DownloadSession, IO_CHUNK};
use super::{next_chunk, pause, DownloadOptions};
use crate::error::{Result, UpdaterError};
use crate::manifest::FileDescriptor;
use crate::transport::{HttpRequest, HttpTransport};
use bytes::BytesMut;
use tracing::warn;

/// Stream `file` into `session` and verify it.
///
/// Transient failures restart the request from the first byte, up to
/// `max_range_retries` times. A checksum mismatch is returned as is.
pub(crate) async fn download_full(
    transport: &dyn HttpTransport,
    file: &FileDescriptor,
    options: &DownloadOptions,
    session: &DownloadSession,
) -> Result<u64> {
    let mut attempt = 0;
    let received = loop {
        session.check_cancelled()?;
        attempt += 1;
        session.reset_transferred();
        match fetch_once(transport, file, options, session).await {
            Ok(received) => break received,
            Err(err) if err.is_retryable() && attempt <= options.max_range_retries => {
                warn!("download of {} failed, restarting: {}", file.url, err);
                pause(session.cancel_token(), options.retry_delay).await?;
            }
            Err(err) => return Err(err),
        }
    };
    session.sync().await?;
    session.verify(&file.checksum).await?;
    Ok(received)
}

async fn fetch_once(
    transport: &dyn HttpTransport,
    file: &FileDescriptor,
    options: &DownloadOptions,
    session: &DownloadSession,
) -> Result<u64> {
    let request = HttpRequest::get(file.url.clone()).headers(options.headers.clone());
    let cancel = session.cancel_token();
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(UpdaterError::Cancelled),
        response = transport.get(request) => response?,
    };
    let response = response.error_for_status()?;
    if response.status != 200 {
        return Err(UpdaterError::protocol(
            &response.url,
            format!("status {} for a plain request", response.status),
        ));
    }

    let url = response.url.clone();
    let mut body = response.body;
    let mut offset = 0u64;
    let mut pending = BytesMut::new();
    while let Some(chunk) = next_chunk(&mut body, cancel).await? {
        if let Some(size) = file.size {
            if offset + (pending.len() + chunk.len()) as u64 > size {
                return Err(UpdaterError::protocol(
                    &url,
                    format!("body exceeds the declared {size} bytes"),
                ));
            }
        }
        pending.extend_from_slice(&chunk);
        if pending.len() >= IO_CHUNK {
            let data = pending.split().freeze();
            let written = data.len() as u64;
            session.write_at(offset, data).await?;
            offset += written;
            session.advance(written);
        }
    }
    if !pending.is_empty() {
        let data = pending.freeze();
        let written = data.len() as u64;
        session.write_at(offset, data).await?;
        offset += written;
        session.advance(written);
    }

    match file.size {
        Some(size) if offset != size => Err(UpdaterError::protocol(
            &url,
            format!("received {offset} of {size} bytes"),
        )),
        Some(_) => Ok(offset),
        None => {
            session.truncate(offset).await?;
            Ok(offset)
        }
    }
}
