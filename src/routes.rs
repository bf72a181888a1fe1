//! 路由表与中间件装配。

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{any, get};
use axum::{Router, middleware};
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::access::{self, AccessPolicy};
use crate::files;
use crate::http::{add_security_headers, build_cors_layer, client_ip_for_log};
use crate::storage::Storage;
use crate::upload;

pub struct RouterSettings {
    pub storage: Arc<Storage>,
    pub access: Arc<AccessPolicy>,
    pub upload_max_size: usize,
    pub cors_origins: Option<String>,
}

/// `/upload` 经过白名单校验；`/f/` 下的文件对所有人公开。
pub fn build_router(settings: RouterSettings) -> Router {
    let proxy_header = settings.access.proxy_header.clone();

    let upload_route = any(upload::upload_file)
        .layer(DefaultBodyLimit::max(settings.upload_max_size))
        .layer(middleware::from_fn(access::require_allowed_client));

    let mut app = Router::new()
        .route("/upload", upload_route)
        .route("/f", get(files::deny_listing))
        .route("/f/", get(files::deny_listing))
        .route("/f/{*path}", get(files::serve_file))
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let client_ip = client_ip_for_log(request, &proxy_header);
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(settings.storage))
        .layer(Extension(settings.access));

    if let Some(cors_layer) = build_cors_layer(settings.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    app
}
