use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE},
        HeaderMap, HeaderName, HeaderValue, StatusCode,
    },
    response::Response,
    Json,
};
use futures_util::StreamExt;
use object_store::{path::Path as ObjectPath, ObjectStoreExt};
use parley_core::{AttachmentKind, UPLOAD_URL_PREFIX};
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::server::{
    auth::{authenticate, now_unix},
    core::{AppState, MAX_MIME_SNIFF_BYTES},
    errors::ApiFailure,
    storage::{repository, ChatPersistence, UploadRecord},
    types::{UploadQuery, UploadResponse},
};

pub(crate) const ALLOWED_UPLOAD_MIME_TYPES: [&str; 6] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "application/pdf",
    "text/plain",
];
const TEXT_PLAIN: &str = "text/plain";
const MAX_UPLOAD_FILENAME_CHARS: usize = 255;

fn object_path(upload_id: &str) -> ObjectPath {
    ObjectPath::from(format!("uploads/{upload_id}"))
}

fn validate_upload_filename(filename: Option<&str>) -> Result<(), ApiFailure> {
    let Some(filename) = filename else {
        return Ok(());
    };
    if filename.is_empty()
        || filename.chars().count() > MAX_UPLOAD_FILENAME_CHARS
        || filename.contains(['/', '\\', '\0'])
    {
        return Err(ApiFailure::Validation("filename"));
    }
    Ok(())
}

fn declared_mime(headers: &HeaderMap) -> Result<&'static str, ApiFailure> {
    let declared = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiFailure::UnsupportedMediaType)?
        .parse::<mime::Mime>()
        .map_err(|_| ApiFailure::UnsupportedMediaType)?;
    ALLOWED_UPLOAD_MIME_TYPES
        .iter()
        .copied()
        .find(|allowed| *allowed == declared.essence_str())
        .ok_or(ApiFailure::UnsupportedMediaType)
}

/// Validates UTF-8 across chunk boundaries. A multi-byte sequence split
/// between chunks is carried over until the next one arrives.
struct Utf8Check {
    pending: Vec<u8>,
    valid: bool,
}

impl Utf8Check {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            valid: true,
        }
    }

    fn feed(&mut self, chunk: &[u8]) {
        if !self.valid {
            return;
        }
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.clear(),
            Err(error) if error.error_len().is_none() => {
                let tail = self.pending.split_off(error.valid_up_to());
                self.pending = tail;
            }
            Err(_) => self.valid = false,
        }
    }

    fn finish(self) -> bool {
        self.valid && self.pending.is_empty()
    }
}

/// Checks sniffed content against the declared type. Binary types must carry
/// a matching signature; plain text must have none and decode as UTF-8.
fn content_matches(declared: &str, sniff_buffer: &[u8], utf8: Utf8Check) -> bool {
    let sniffed = infer::get(sniff_buffer).map(|kind| kind.mime_type());
    if declared == TEXT_PLAIN {
        return sniffed.is_none() && utf8.finish();
    }
    sniffed == Some(declared)
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{byte:02x}"));
    }
    out
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> Result<(StatusCode, Json<UploadResponse>), ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let declared = declared_mime(&headers)?;
    validate_upload_filename(query.filename.as_deref())?;
    let max_upload_bytes =
        u64::try_from(state.runtime.max_upload_bytes).map_err(|_| ApiFailure::Internal)?;

    let upload_id = Ulid::new().to_string();
    let path = object_path(&upload_id);
    let mut upload = state
        .upload_store
        .put_multipart(&path)
        .await
        .map_err(|_| ApiFailure::Internal)?;
    let mut stream = body.into_data_stream();
    let mut sniff_buffer = Vec::new();
    let mut utf8 = Utf8Check::new();
    let mut hasher = Sha256::new();
    let mut total_size: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else {
            let _ = upload.abort().await;
            return Err(ApiFailure::InvalidRequest);
        };
        if chunk.is_empty() {
            continue;
        }
        let chunk_len = u64::try_from(chunk.len()).map_err(|_| ApiFailure::InvalidRequest)?;
        total_size = total_size
            .checked_add(chunk_len)
            .ok_or(ApiFailure::PayloadTooLarge)?;
        if total_size > max_upload_bytes {
            let _ = upload.abort().await;
            return Err(ApiFailure::PayloadTooLarge);
        }

        if sniff_buffer.len() < MAX_MIME_SNIFF_BYTES {
            let remaining = MAX_MIME_SNIFF_BYTES - sniff_buffer.len();
            let copy_len = remaining.min(chunk.len());
            sniff_buffer.extend_from_slice(&chunk[..copy_len]);
        }
        if declared == TEXT_PLAIN {
            utf8.feed(&chunk);
        }
        hasher.update(chunk.as_ref());
        if upload.put_part(chunk.into()).await.is_err() {
            let _ = upload.abort().await;
            return Err(ApiFailure::Internal);
        }
    }

    if total_size == 0 {
        let _ = upload.abort().await;
        return Err(ApiFailure::InvalidRequest);
    }
    if !content_matches(declared, &sniff_buffer, utf8) {
        let _ = upload.abort().await;
        tracing::warn!(event = "uploads.create", outcome = "content_mismatch", declared, user_id = %auth.user_id);
        return Err(ApiFailure::UnsupportedMediaType);
    }
    upload.complete().await.map_err(|_| ApiFailure::Internal)?;

    let record = UploadRecord {
        upload_id: upload_id.clone(),
        owner_id: auth.user_id,
        mime_type: String::from(declared),
        size_bytes: total_size,
        sha256_hex: hex_digest(hasher),
        created_at_unix: now_unix(),
    };
    let persisted = match repository(&state).await {
        Ok(repo) => repo.insert_upload(&record).await,
        Err(error) => Err(error),
    };
    if let Err(error) = persisted {
        tracing::error!(event = "uploads.persist_failed", upload_id = %upload_id, user_id = %auth.user_id, error = %error);
        let _ = state.upload_store.delete(&path).await;
        return Err(ApiFailure::Internal);
    }

    tracing::info!(
        event = "uploads.create",
        outcome = "stored",
        upload_id = %upload_id,
        user_id = %auth.user_id,
        size_bytes = total_size
    );
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            url: format!("{UPLOAD_URL_PREFIX}{upload_id}"),
            upload_id,
            kind: AttachmentKind::from_mime(declared),
            mime_type: record.mime_type,
            size_bytes: record.size_bytes,
            sha256_hex: record.sha256_hex,
        }),
    ))
}

/// Serves a stored blob. Upload URLs are embedded in messages and avatars, so
/// reads need no credential.
pub(crate) async fn download_file(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Response, ApiFailure> {
    if Ulid::from_string(&upload_id).is_err() {
        return Err(ApiFailure::NotFound);
    }
    let record = repository(&state)
        .await?
        .find_upload(&upload_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    let get_result = state
        .upload_store
        .get(&object_path(&record.upload_id))
        .await
        .map_err(|_| ApiFailure::NotFound)?;
    let stream = get_result.into_stream();

    let mut response = Response::new(Body::from_stream(stream));
    let content_type =
        HeaderValue::from_str(&record.mime_type).map_err(|_| ApiFailure::Internal)?;
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(record.size_bytes));
    response.headers_mut().insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    response.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=31536000, immutable"),
    );
    Ok(response)
}
