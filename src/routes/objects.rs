use anyhow::anyhow;
use archiver::{ArchiveSession, ARCHIVE_EXTENSION};
use axum::{
    body::Body,
    extract::{Query, State},
    http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    response::Response,
};
use blob_store::{is_folder_key, FOLDER_SEPARATOR};
use bucket_utils::GuardStreamExt;
use tokio_util::io::ReaderStream;
use tracing::info;

use super::RouteState;
use crate::http_objects::{ApiError, DownloadParams};

const ARCHIVE_CONTENT_TYPE: &str = "application/zstd";
const OBJECT_CONTENT_TYPE: &str = "application/octet-stream";
const ROOT_ARCHIVE_NAME: &str = "archive";

/// Download an object, or a whole folder as a `.tar.zst` archive
#[utoipa::path(
    get,
    path = "/objects",
    tag = "retrieve",
    params(DownloadParams),
    responses(
        (status = 200, description = "Object content, or a zstd compressed tar archive for folder keys"),
        (status = BAD_REQUEST, description = "Missing or empty key"),
        (status = NOT_FOUND, description = "Object or folder not found"),
        (status = CONFLICT, description = "Two keys in the folder map to the same archive entry"),
        (status = INTERNAL_SERVER_ERROR, description = "Internal Server Error")
    ),
)]
#[tracing::instrument(skip(state))]
pub async fn get_object(
    State(state): State<RouteState>,
    Query(params): Query<DownloadParams>,
) -> Result<Response<Body>, ApiError> {
    let key = params
        .key
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing object key"))?;

    if is_folder_key(&key) {
        download_archive(state, key).await
    } else {
        download_object(state, key).await
    }
}

async fn download_object(state: RouteState, key: String) -> Result<Response<Body>, ApiError> {
    let object = state.blob_store.get_object_stream(&key).await?;

    Response::builder()
        .header(CONTENT_TYPE, OBJECT_CONTENT_TYPE)
        .header(CONTENT_LENGTH, object.size)
        .header(CONTENT_DISPOSITION, content_disposition(object_file_name(&key)))
        .body(Body::from_stream(object.body))
        .map_err(|e| ApiError::internal_error(anyhow!(e)))
}

async fn download_archive(state: RouteState, key: String) -> Result<Response<Body>, ApiError> {
    let artifact = ArchiveSession::new(state.blob_store.clone(), state.archive.clone())
        .run(&key)
        .await?;
    let file = tokio::fs::File::open(artifact.path())
        .await
        .map_err(|e| ApiError::internal_error(anyhow!(e).context("unable to open archive")))?;
    info!(
        key = %key,
        entries = artifact.entry_count(),
        size = artifact.size(),
        "serving archive"
    );
    let size = artifact.size();
    let file_name = format!("{}.{ARCHIVE_EXTENSION}", archive_base_name(&key));

    // The archive file goes away with the body, whether it was fully sent or
    // the client disconnected.
    let body = ReaderStream::new(file).guard(move || drop(artifact));

    Response::builder()
        .header(CONTENT_TYPE, ARCHIVE_CONTENT_TYPE)
        .header(CONTENT_LENGTH, size)
        .header(CONTENT_DISPOSITION, content_disposition(&file_name))
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::internal_error(anyhow!(e)))
}

fn object_file_name(key: &str) -> &str {
    key.rsplit(FOLDER_SEPARATOR).next().unwrap_or(key)
}

fn archive_base_name(folder_key: &str) -> &str {
    folder_key
        .trim_end_matches(FOLDER_SEPARATOR)
        .rsplit(FOLDER_SEPARATOR)
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(ROOT_ARCHIVE_NAME)
}

/// `attachment` disposition with a quoted ASCII fallback name and, for
/// non-ASCII names, the exact name in `filename*`.
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    if file_name.is_ascii() && !file_name.chars().any(|c| c.is_ascii_control()) {
        return format!("attachment; filename=\"{fallback}\"");
    }
    let encoded: String = file_name
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect();
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
