use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use tracklist_core::request::{parse_count, parse_index, parse_item_list};
use tracklist_core::{
    EntityRef, LoopHandle, LoopState, Operation, Request, RequestError, Response,
};

const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
const SERVER_NAME: &str = concat!("tracklist-server/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct AppState {
    loop_handle: LoopHandle,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(loop_handle: LoopHandle, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            loop_handle,
            metrics,
        }
    }

    /// The link is checked before anything else about the request, so a bad
    /// link wins over a bad parameter.
    async fn dispatch(
        &self,
        uri: &str,
        operation: impl FnOnce() -> Result<Operation, RequestError>,
    ) -> ApiResponse {
        let operation = EntityRef::parse(uri)
            .map_err(RequestError::from)
            .and_then(|_| operation());
        match operation {
            Ok(operation) => ApiResponse(self.loop_handle.call(Request::new(uri, operation)).await),
            Err(err) => {
                counter!("tracklist_http_rejected_total", 1, "kind" => err.kind());
                ApiResponse(Response::from_error(&err))
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/playlist",
            get(bad_request).put(not_implemented).post(not_implemented),
        )
        .route("/playlist/:uri", get(get_playlist))
        .route(
            "/playlist/:uri/:action",
            get(get_field).put(mutate).post(mutate),
        )
        .fallback(bad_request)
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(SERVER_NAME),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

struct ApiResponse(Response);

impl IntoResponse for ApiResponse {
    fn into_response(self) -> axum::response::Response {
        let response = self.0;
        let status = StatusCode::from_u16(response.status.code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match serde_json::to_vec(&response.body) {
            Ok(body) => (status, [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)], body).into_response(),
            Err(err) => {
                warn!(error = %err, "failed to encode response body");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let loop_state = state.loop_handle.state();
    let status = match loop_state {
        LoopState::Running => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = serde_json::json!({ "status": format!("{loop_state:?}").to_lowercase() });
    (
        status,
        [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
        body.to_string(),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn bad_request() -> ApiResponse {
    ApiResponse(Response::from_error(&RequestError::BadRoute))
}

async fn not_implemented() -> ApiResponse {
    ApiResponse(Response::from_error(&RequestError::NotImplemented))
}

async fn get_playlist(State(state): State<AppState>, Path(uri): Path<String>) -> ApiResponse {
    state.dispatch(&uri, || Ok(Operation::Get)).await
}

async fn get_field(
    State(state): State<AppState>,
    Path((uri, field)): Path<(String, String)>,
) -> ApiResponse {
    state
        .dispatch(&uri, || field.parse().map(Operation::GetField))
        .await
}

async fn mutate(
    State(state): State<AppState>,
    Path((uri, action)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> ApiResponse {
    let param = |name: &str| params.get(name).map(String::as_str);
    state
        .dispatch(&uri, || match action.as_str() {
            "add" => {
                let index = parse_index(param("index"))?;
                let items = parse_item_list(&body)?;
                Ok(Operation::AddItems { index, items })
            }
            "remove" => {
                let index = parse_index(param("index"))?;
                let count = parse_count(param("count"))?;
                Ok(Operation::RemoveItems { index, count })
            }
            "patch" => Ok(Operation::Patch {
                desired: parse_item_list(&body)?,
            }),
            _ => Err(RequestError::NotImplemented),
        })
        .await
}
