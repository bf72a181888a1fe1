//! `/upload` 处理器：解析 multipart，分配不冲突的文件名并写入存储目录。
//!
//! 访问控制由 [`crate::access::require_allowed_client`] 在进入本处理器之前完成。

use axum::body::Body as AxumBody;
use axum::extract::multipart::Field;
use axum::extract::{Extension, FromRequest, Multipart};
use axum::http::{Method, Request};
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::{PUBLIC_PREFIX, UPLOAD_FIELD_NAME};
use crate::error::ApiError;
use crate::storage::{AllocatedFile, Storage, sanitize_file_name};

/// 上传成功后的响应体。
#[derive(Debug, Serialize)]
pub struct UploadStatus {
    pub path: String,
}

impl UploadStatus {
    /// `f/` 加上 URL 编码后的文件名。
    pub fn for_file(name: &str) -> Self {
        Self {
            path: format!("{PUBLIC_PREFIX}{}", urlencoding::encode(name)),
        }
    }
}

/// 接收 `uploadfile` 字段中的文件。
pub async fn upload_file(
    Extension(storage): Extension<Arc<Storage>>,
    req: Request<AxumBody>,
) -> Result<JsonResponse<UploadStatus>, ApiError> {
    if req.method() != Method::POST {
        return Err(ApiError::MethodNotAllowed);
    }

    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|err| ApiError::Internal(err.body_text()))?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::Internal(err.body_text()))?
    {
        if field.name() != Some(UPLOAD_FIELD_NAME) {
            continue;
        }
        let Some(submitted) = field.file_name().map(str::to_string) else {
            continue;
        };
        let stored = store_field(&storage, &submitted, field).await?;
        return Ok(JsonResponse(UploadStatus::for_file(&stored)));
    }

    Err(ApiError::Internal(format!(
        "no such file: {UPLOAD_FIELD_NAME}"
    )))
}

async fn store_field(
    storage: &Storage,
    submitted: &str,
    mut field: Field<'_>,
) -> Result<String, ApiError> {
    let desired = sanitize_file_name(submitted)?;
    let AllocatedFile {
        name,
        path,
        mut file,
    } = storage.create_unique(&desired).await?;
    info!(name = %name, submitted, "uploading");

    let write_result: Result<u64, ApiError> = async {
        let mut written: u64 = 0;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|err| ApiError::Internal(err.body_text()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        Ok(written)
    }
    .await;

    match write_result {
        Ok(bytes) => {
            info!(name = %name, bytes, "upload stored");
            Ok(name)
        }
        Err(err) => {
            drop(file);
            if let Err(remove_err) = fs::remove_file(&path).await {
                warn!(path = ?path, error = %remove_err, "failed to remove partial upload");
            }
            warn!(name = %name, "upload aborted");
            Err(err)
        }
    }
}
