//! HTTP routes: the MJPEG stream, single-frame capture, sensor settings and restart.
//!
//! Every route answers GET. Unmatched paths get the plain-text diagnostic page. The
//! stream route hands admission a [`BodySender`] and returns the matching body, so
//! from then on the client is served by the dispatcher like any other transport.

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::registry::ClientConnection;
use crate::sensor::{SensorDriver, SharedSensor};
use crate::settings::{SensorSettings, Setting, SettingsStore};
use crate::stream::Admission;
use crate::stream::body::{self, BodySender};
use crate::stream::multipart::{JPEG_CONTENT_TYPE, SNAPSHOT_DISPOSITION, STREAM_CONTENT_TYPE};
use crate::{Result, StreamError};

/// Pipeline pieces the handlers work with.
pub struct AppState<S> {
    pub sensor: SharedSensor<S>,
    pub admission: Admission<BodySender>,
    pub store: SettingsStore,
    /// Boot counter shown on the diagnostic page
    pub boot_count: u32,
    pub write_timeout: Option<Duration>,
    /// Restart requests for the server loop
    pub restart: mpsc::UnboundedSender<String>,
}

/// Query of `/set`. Both arguments are checked by the handler so that a missing one is
/// reported the same way as a bad one.
#[derive(Debug, Default, Deserialize)]
pub struct SetQuery {
    pub var: Option<String>,
    pub val: Option<String>,
}

/// Build the camera's router.
pub fn router<S: SensorDriver>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/mjpeg/1", get(stream::<S>))
        .route("/jpg", get(snapshot::<S>))
        .route("/get", get(settings::<S>))
        .route("/set", get(set_setting::<S>))
        .route("/restart", get(restart::<S>))
        .route("/reset", get(reset::<S>))
        .fallback(diagnostic::<S>)
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::debug_span!("request", method = %request.method(), uri = %request.uri())
        }))
}

async fn stream<S: SensorDriver>(State(state): State<Arc<AppState<S>>>) -> Response {
    let (sender, body) = body::channel();
    let connection = ClientConnection::new(sender).with_write_timeout(state.write_timeout);
    match state.admission.admit(connection).await {
        Ok(_) => ([(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)], body).into_response(),
        // Refused without enrollment and without a body
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// One frame captured directly, outside the double buffer.
async fn snapshot<S: SensorDriver>(State(state): State<Arc<AppState<S>>>) -> Response {
    let captured = {
        let mut sensor = state.sensor.lock().await;
        sensor.capture().await.map(<[u8]>::to_vec)
    };
    match captured {
        Ok(frame) => (
            [(header::CONTENT_DISPOSITION, SNAPSHOT_DISPOSITION), (header::CONTENT_TYPE, JPEG_CONTENT_TYPE)],
            frame,
        )
            .into_response(),
        Err(e) => {
            warn!("Snapshot failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Capture failed").into_response()
        }
    }
}

async fn settings<S: SensorDriver>(State(state): State<Arc<AppState<S>>>) -> Json<SensorSettings> {
    Json(state.sensor.lock().await.settings())
}

async fn set_setting<S: SensorDriver>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<SetQuery>,
) -> Response {
    match apply_setting(&state, &query).await {
        Ok((setting, value)) => {
            info!("Setting {} changed to {}", setting, value);
            "OK".into_response()
        }
        Err(
            e @ (StreamError::Request { .. }
            | StreamError::UnknownSetting { .. }
            | StreamError::InvalidSetting { .. }),
        ) => {
            debug!("Rejected setting change: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e) => {
            warn!("Setting change failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn apply_setting<S: SensorDriver>(state: &AppState<S>, query: &SetQuery) -> Result<(Setting, i32)> {
    let key = query.var.as_deref().ok_or_else(|| StreamError::bad_request("missing 'var'"))?;
    let raw = query.val.as_deref().ok_or_else(|| StreamError::bad_request("missing 'val'"))?;
    let setting: Setting = key.parse()?;
    let value: i32 = raw
        .trim()
        .parse()
        .map_err(|_| StreamError::bad_request(format!("'{raw}' is not an integer")))?;
    let value = setting.validate(value)?;

    // Held until stored, so the file always matches the sensor
    let mut sensor = state.sensor.lock().await;
    sensor.apply(setting, value)?;
    state.store.store_setting(setting, value)?;
    Ok((setting, value))
}

async fn restart<S: SensorDriver>(State(state): State<Arc<AppState<S>>>) -> &'static str {
    request_restart(&state, "restart requested over HTTP");
    "OK"
}

async fn reset<S: SensorDriver>(State(state): State<Arc<AppState<S>>>) -> &'static str {
    if let Err(e) = state.store.clear() {
        warn!("Could not clear stored settings: {}", e);
    }
    request_restart(&state, "settings reset over HTTP");
    "OK"
}

/// The server loop stops accepting requests but lets this response finish.
fn request_restart<S>(state: &AppState<S>, reason: &str) {
    if state.restart.send(reason.to_string()).is_err() {
        debug!("Server loop already stopped, restart request ignored");
    }
}

async fn diagnostic<S: SensorDriver>(
    State(state): State<Arc<AppState<S>>>,
    method: Method,
    uri: Uri,
    Query(args): Query<Vec<(String, String)>>,
) -> String {
    diagnostic_page(uri.path(), &method, args.len(), state.boot_count)
}

/// Body of the fallback page. Any method other than GET is listed as POST.
pub fn diagnostic_page(path: &str, method: &Method, arguments: usize, boot_count: u32) -> String {
    let method = if *method == Method::GET { "GET" } else { "POST" };
    format!(
        "Server is running!\n\nURI: {path}\nMethod: {method}\nArguments: {arguments}\nVersion: 2\n\nCounter: {boot_count}\n"
    )
}
