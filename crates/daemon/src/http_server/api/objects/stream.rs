use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use bytes::Bytes;
use http::{header, HeaderMap, StatusCode};
use serde::Deserialize;

use common::crypto::{adjust_iv, ByteRange, ContentCipher, RangeWindow};

use crate::ciphertext::{FileId, Puller};
use crate::http_server::context::RequestContext;
use crate::http_server::error::AppError;
use crate::state::ServiceState;

use super::{fetch_object, parse_object_id, require_caps, Caps};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StreamQuery {
    /// Overrides the default `inline` disposition
    pub disposition: Option<String>,
}

/// Everything the streaming path needs to serve one content version
pub(super) struct ContentMeta {
    pub connector: String,
    pub size: i64,
    pub hash: Option<Vec<u8>>,
    pub iv: [u8; 16],
    pub content_type: Option<String>,
    pub name: String,
    pub description: String,
    pub banner: Option<String>,
}

/// Read object content, honoring byte ranges and `If-None-Match`
pub async fn get_stream(
    State(state): State<ServiceState>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let id = parse_object_id(&id)?;
    let object = fetch_object(&state, id).await?;

    if object.is_deleted {
        if object.is_expunged {
            return Err(AppError::gone("The object no longer exists."));
        }
        if object.is_ancestor_deleted {
            return Err(AppError::method_not_allowed(
                "The object cannot be read because an ancestor is deleted.",
            ));
        }
        return Err(AppError::method_not_allowed(
            "The object is currently in the trash. Restore it before reading it.",
        ));
    }

    let permission = require_caps(
        &state,
        &ctx,
        &object,
        Caps::read_only(),
        "read this object",
    )?;
    let file_key = permission.file_key(state.master()).map_err(|e| {
        AppError::with_cause(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to derive file key from permission",
            e,
        )
    })?;

    state
        .access()
        .check_access(ctx.dn(), &object.raw_acm)
        .await
        .map_err(AppError::from_access)?;

    let meta = ContentMeta {
        connector: object.content_connector.clone().unwrap_or_default(),
        size: object.content_size,
        hash: object.content_hash.clone(),
        iv: object.encrypt_iv.unwrap_or_default(),
        content_type: object.content_type.clone(),
        name: object.name.clone(),
        description: object.description.clone(),
        banner: object.raw_acm.banner(),
    };
    stream_response(&state, meta, file_key, &headers, query.disposition).await
}

/// Parse the Range header. Absent means "whole object, status 200".
fn parse_range(headers: &HeaderMap) -> Result<Option<ByteRange>, AppError> {
    let Some(raw) = headers.get(header::RANGE) else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|e| AppError::with_cause(StatusCode::BAD_REQUEST, "Unable to parse byte range", e))?;
    let spec = raw
        .strip_prefix("bytes=")
        .ok_or_else(|| AppError::bad_request("Unable to parse byte range"))?;
    let (start, stop) = spec
        .split_once('-')
        .ok_or_else(|| AppError::bad_request("Unable to parse byte range"))?;
    let start: u64 = start
        .parse()
        .map_err(|e| AppError::with_cause(StatusCode::BAD_REQUEST, "Unable to parse byte range", e))?;
    let stop = if stop.is_empty() {
        None
    } else {
        Some(stop.parse::<u64>().map_err(|e| {
            AppError::with_cause(StatusCode::BAD_REQUEST, "Unable to parse byte range", e)
        })?)
    };
    Ok(Some(ByteRange::new(start, stop)))
}

/// Serve one content version: headers, conditional request handling, then
/// the decrypted byte stream faulted in through the cache.
pub(super) async fn stream_response(
    state: &ServiceState,
    meta: ContentMeta,
    file_key: [u8; 32],
    headers: &HeaderMap,
    disposition_override: Option<String>,
) -> Result<Response, AppError> {
    if meta.size <= 0 || meta.connector.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let full_length = meta.size as u64;

    let range = parse_range(headers)?;
    let disposition = disposition_override.unwrap_or_else(|| "inline".to_string());

    let mut response = Response::builder().status(match range {
        Some(_) => StatusCode::PARTIAL_CONTENT,
        None => StatusCode::OK,
    });
    {
        let response_headers = response.headers_mut().expect("fresh builder");
        if let Some(banner) = &meta.banner {
            if let Ok(value) = banner.parse() {
                response_headers.insert("Classification-Banner", value);
            }
        }
        if let Some(content_type) = &meta.content_type {
            if let Ok(value) = content_type.parse() {
                response_headers.insert(header::CONTENT_TYPE, value);
            }
        }
        response_headers.insert(header::ACCEPT_RANGES, "bytes".parse().expect("static"));
        let file_name: String = meta
            .name
            .chars()
            .map(|c| if c == '"' || c == '\\' { '_' } else { c })
            .collect();
        if let Ok(value) = format!("{}; filename=\"{}\"", disposition, file_name).parse() {
            response_headers.insert(header::CONTENT_DISPOSITION, value);
        }
        if !meta.description.is_empty() {
            if let Ok(value) = meta.description.parse() {
                response_headers.insert("Content-Description", value);
            }
        }

        let reported = match &range {
            Some(range) => {
                if range.start >= full_length {
                    return Err(AppError::bad_request("Byte range begins past end of content"));
                }
                range.reported_length(full_length)
            }
            None => full_length,
        };
        response_headers.insert(header::CONTENT_LENGTH, reported.into());
        if let Some(range) = &range {
            let stop = range
                .stop
                .map(|s| s.min(full_length - 1))
                .unwrap_or(full_length - 1);
            let value = format!("bytes {}-{}/{}", range.start, stop, full_length);
            response_headers.insert(header::CONTENT_RANGE, value.parse().expect("ascii"));
        }

        // Absence of a content hash means no Etag and no 304
        if let Some(hash) = &meta.hash {
            let etag = format!("\"{}\"", hex::encode(hash));
            response_headers.insert(header::ETAG, etag.parse().expect("ascii"));
            let client_etag = headers
                .get(header::IF_NONE_MATCH)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if client_etag == etag {
                return Ok(StatusCode::NOT_MODIFIED.into_response());
            }
        }
    }

    // Align the read to the cipher block, then bias the window back
    let mut cipher_range = range.unwrap_or(ByteRange::new(0, None));
    let cipher_start = cipher_range.cipher_start();
    let iv = adjust_iv(&meta.iv, &mut cipher_range);
    let cipher = ContentCipher::new(&file_key, &iv).map_err(|e| {
        AppError::with_cause(StatusCode::INTERNAL_SERVER_ERROR, "Unable to initialize cipher", e)
    })?;
    let window = RangeWindow::new(&cipher_range);

    let file_id = FileId::parse(&meta.connector)
        .map_err(|e| AppError::with_cause(StatusCode::INTERNAL_SERVER_ERROR, "Corrupt content connector", e))?;
    let cache = std::sync::Arc::clone(state.cache());
    let puller = Puller::new(
        std::sync::Arc::clone(&cache),
        file_id.clone(),
        full_length,
        cipher_start,
    )
    .await
    .map_err(|e| AppError::from_cache(e, "unable to open ciphertext"))?;

    if !puller.is_local {
        // Cache miss; fault the whole blob back for the next reader
        cache.background_recache(file_id);
    }

    let stream = decrypt_stream(puller, cipher, window);
    let body = Body::from_stream(stream);
    Ok(response.body(body).expect("response builds"))
}

struct DecryptState {
    puller: Puller,
    cipher: ContentCipher,
    window: RangeWindow,
}

fn decrypt_stream(
    puller: Puller,
    cipher: ContentCipher,
    window: RangeWindow,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    let state = DecryptState {
        puller,
        cipher,
        window,
    };
    futures::stream::try_unfold(state, |mut s| async move {
        loop {
            if s.window.done() {
                return Ok(None);
            }
            match s.puller.next_chunk().await? {
                None => return Ok(None),
                Some(chunk) => {
                    let mut buffer = chunk.to_vec();
                    s.cipher.decrypt_chunk(&mut buffer);
                    if let Some(out) = s.window.apply(&buffer) {
                        if !out.is_empty() {
                            return Ok(Some((Bytes::from(out), s)));
                        }
                    }
                }
            }
        }
    })
}
