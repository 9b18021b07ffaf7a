//! Plugin-defined HTTP endpoints.
//!
//! Everything under `/plugins/{plugin}` is routed to the plugin's
//! controllers by the dynamic router. The caller identity is taken from
//! headers set by the upstream authentication layer.

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::host::CallerIdentity;
use crate::router::PluginRequest;
use crate::state::AppState;

pub const CALLER_ID_HEADER: &str = "x-caller-id";
pub const CALLER_ROLES_HEADER: &str = "x-caller-roles";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/plugins/{plugin}", any(plugin_root))
        .route("/plugins/{plugin}/{*path}", any(plugin_path))
}

fn caller_from(headers: &HeaderMap) -> CallerIdentity {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    CallerIdentity {
        id: header(CALLER_ID_HEADER).map(str::to_string),
        roles: header(CALLER_ROLES_HEADER)
            .map(|roles| {
                roles
                    .split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// The request path below `/plugins/{plugin}`, still percent-encoded. The
/// route pattern decodes each segment itself, so `%2F` stays inside one
/// parameter and `%2540` decodes to `%40`, not `@`.
fn raw_subpath(uri: &Uri) -> String {
    let rest = uri.path().strip_prefix("/plugins/").unwrap_or_default();
    match rest.split_once('/') {
        Some((_, sub)) => format!("/{sub}"),
        None => "/".to_string(),
    }
}

fn parse_body(body: &Bytes) -> AppResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("invalid JSON body: {e}")))
}

async fn dispatch(
    state: AppState,
    plugin: String,
    path: String,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let request = PluginRequest {
        plugin,
        method: method.as_str().to_string(),
        path,
        body: parse_body(&body)?,
        caller: caller_from(&headers),
    };

    let response = state.router().handle(request).await?;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(response.body)).into_response())
}

async fn plugin_root(
    State(state): State<AppState>,
    Path(plugin): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    dispatch(state, plugin, "/".to_string(), method, headers, body).await
}

async fn plugin_path(
    State(state): State<AppState>,
    Path((plugin, _)): Path<(String, String)>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    dispatch(state, plugin, raw_subpath(&uri), method, headers, body).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn caller_is_anonymous_without_headers() {
        assert_eq!(caller_from(&HeaderMap::new()), CallerIdentity::anonymous());
    }

    #[test]
    fn caller_roles_are_split() {
        let mut headers = HeaderMap::new();
        headers.insert(CALLER_ID_HEADER, HeaderValue::from_static("u-1"));
        headers.insert(CALLER_ROLES_HEADER, HeaderValue::from_static("admin, editor,"));
        let caller = caller_from(&headers);
        assert_eq!(caller.id.as_deref(), Some("u-1"));
        assert_eq!(caller.roles, ["admin", "editor"]);
    }

    #[test]
    fn subpath_keeps_percent_encoding() {
        let uri: Uri = "/plugins/shop/emails/a%2Fb?x=1".parse().unwrap();
        assert_eq!(raw_subpath(&uri), "/emails/a%2Fb");
        let uri: Uri = "/plugins/shop".parse().unwrap();
        assert_eq!(raw_subpath(&uri), "/");
    }

    #[test]
    fn empty_body_is_null() {
        assert_eq!(parse_body(&Bytes::from_static(b"  ")).unwrap(), Value::Null);
        assert!(parse_body(&Bytes::from_static(b"{")).is_err());
    }
}
