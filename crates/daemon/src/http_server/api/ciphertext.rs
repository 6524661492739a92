use axum::body::Body;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, StatusCode};

use common::models::flatten;

use crate::ciphertext::{FileId, Zone};
use crate::http_server::context::caller_from_headers;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

/// Peer-to-peer ciphertext fetch.
///
/// Restricted to callers presenting the peer signifier identity; peers
/// accept the inbound request without normal user authorization. `204`
/// means "not present here" so the requesting peer can move on.
pub async fn get_ciphertext(
    State(state): State<ServiceState>,
    Path((zone, file_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let caller = caller_from_headers(&headers);
    if caller.distinguished_name.is_empty()
        || flatten(&caller.distinguished_name) != flatten(state.peer_signifier())
    {
        return Err(AppError::forbidden(
            "Forbidden - ciphertext fetch is restricted to peers",
        ));
    }

    let zone = Zone::new(zone);
    let id = FileId::parse(&file_id)
        .map_err(|e| AppError::with_cause(StatusCode::BAD_REQUEST, "Invalid file id", e))?;
    let Some(cache) = state.cache_for_zone(&zone) else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    let offset = parse_range_offset(&headers);

    // Serve only what is locally present; peers exist to cover blobs that
    // have not reached durable storage yet.
    match cache.open_local(&id, offset).await {
        Ok(Some(file)) => {
            let stream = tokio_file_stream(file);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from_stream(stream))
                .expect("response builds"))
        }
        Ok(None) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(e) => Err(AppError::from_cache(e, "unable to open local ciphertext")),
    }
}

/// Start offset encoded by the requesting peer as `Range: bytes=<start>-`
fn parse_range_offset(headers: &HeaderMap) -> u64 {
    headers
        .get(http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split('-').next())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn tokio_file_stream(
    file: tokio::fs::File,
) -> impl futures::Stream<Item = Result<bytes::Bytes, std::io::Error>> {
    use tokio::io::AsyncReadExt;
    futures::stream::try_unfold(file, |mut file| async move {
        let mut buffer = vec![0u8; 64 * 1024];
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            Ok(None)
        } else {
            buffer.truncate(n);
            Ok(Some((bytes::Bytes::from(buffer), file)))
        }
    })
}
