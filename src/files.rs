//! `/f/` 公共下载：按文件名读取存储目录，不提供目录列表。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::{fmt_http_date, parse_http_date};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::etag::{etag_from_metadata, is_not_modified};
use crate::storage::{Storage, StorageError};

/// 单段字节区间，`end` 包含在内。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    /// 解析 `Range` 头。
    ///
    /// 语法错误或多段请求返回 `Ok(None)`，按普通请求发送整个文件；
    /// 区间落在文件之外返回 416。
    fn from_header(value: &HeaderValue, size: u64) -> Result<Option<Self>, ApiError> {
        let Some(spec) = value.to_str().ok().and_then(|v| v.strip_prefix("bytes=")) else {
            return Ok(None);
        };
        if spec.contains(',') {
            return Ok(None);
        }
        let Some((first, last)) = spec.split_once('-') else {
            return Ok(None);
        };
        let (first, last) = (first.trim(), last.trim());

        let range = match (first.parse::<u64>(), last.parse::<u64>()) {
            // bytes=-N：最后 N 个字节
            (Err(_), Ok(suffix)) if first.is_empty() => {
                if suffix == 0 || size == 0 {
                    return Err(ApiError::RangeNotSatisfiable(size));
                }
                Self {
                    start: size.saturating_sub(suffix),
                    end: size - 1,
                }
            }
            (Ok(start), Err(_)) if last.is_empty() => {
                if start >= size {
                    return Err(ApiError::RangeNotSatisfiable(size));
                }
                Self {
                    start,
                    end: size - 1,
                }
            }
            (Ok(start), Ok(end)) if start <= end => {
                if start >= size {
                    return Err(ApiError::RangeNotSatisfiable(size));
                }
                Self {
                    start,
                    end: end.min(size - 1),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(range))
    }

    fn len(self) -> u64 {
        self.end - self.start + 1
    }

    fn content_range(self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

/// 下载已上传的文件，支持 Range 与 If-None-Match。
pub async fn serve_file(
    Path(path): Path<String>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = storage
        .resolve_path_checked(&path)
        .await
        .map_err(hide_invalid_path)?;
    let metadata = fs::metadata(&target).await.map_err(StorageError::Io)?;
    if metadata.is_dir() {
        debug!(path, "directory listing suppressed");
        return Err(not_found());
    }

    let size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(&metadata);
    let mut headers = validator_headers(&etag, modified)?;
    if is_not_modified(&request_headers, &etag) {
        return Err(ApiError::NotModified(headers));
    }

    let mime = mime_guess::from_path(&target).first_or_octet_stream();
    headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let range = match request_headers.get(header::RANGE) {
        Some(value) if if_range_allows(&request_headers, modified) => {
            ByteRange::from_header(value, size)?
        }
        _ => None,
    };

    let mut file = File::open(&target).await.map_err(internal)?;
    let Some(range) = range else {
        headers.insert(header::CONTENT_LENGTH, header_value(&size.to_string())?);
        info!(path, size, "serve file");
        let body = AxumBody::from_stream(ReaderStream::new(file));
        return Ok((StatusCode::OK, headers, body).into_response());
    };

    file.seek(SeekFrom::Start(range.start))
        .await
        .map_err(internal)?;
    headers.insert(header::CONTENT_RANGE, header_value(&range.content_range(size))?);
    headers.insert(header::CONTENT_LENGTH, header_value(&range.len().to_string())?);
    debug!(path, start = range.start, end = range.end, "serve byte range");
    let body = AxumBody::from_stream(ReaderStream::new(file.take(range.len())));
    Ok((StatusCode::PARTIAL_CONTENT, headers, body).into_response())
}

/// `/f` 与 `/f/` 本身：永远不列出目录内容。
pub async fn deny_listing() -> ApiError {
    not_found()
}

fn validator_headers(etag: &str, modified: Option<SystemTime>) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ETAG, header_value(etag)?);
    if let Some(modified) = modified {
        headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }
    Ok(headers)
}

/// `If-Range` 只有在文件未变化时才允许返回部分内容。
///
/// 本服务的 ETag 都是弱校验值，不能参与 `If-Range` 的强比较，因此只接受日期，
/// 并按 HTTP 日期的秒级精度比较。
fn if_range_allows(headers: &HeaderMap, modified: Option<SystemTime>) -> bool {
    let Some(value) = headers.get(header::IF_RANGE) else {
        return true;
    };
    let Ok(date) = value.to_str().map(parse_http_date) else {
        return false;
    };
    match (date, modified) {
        (Ok(date), Some(modified)) => unix_seconds(modified) <= unix_seconds(date),
        _ => false,
    }
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value)
        .map_err(|_| ApiError::Internal("failed to build response headers".into()))
}

fn internal(err: std::io::Error) -> ApiError {
    ApiError::Internal(err.to_string())
}

fn not_found() -> ApiError {
    ApiError::NotFound("404 page not found".into())
}

// 越界或经过符号链接的路径与不存在的文件同样处理。
fn hide_invalid_path(err: StorageError) -> ApiError {
    match err {
        StorageError::InvalidPath => not_found(),
        other => ApiError::from(other),
    }
}
