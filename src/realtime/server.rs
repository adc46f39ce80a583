use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use futures_util::Stream;
use log::{info, warn};
use serde_json::{Value, json};
use std::{convert::Infallible, future::Future, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_stream::{
    StreamExt,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};

use super::{Hub, MESSAGE_EVENT, Result};
use crate::config::ChannelConfig;
use crate::normalize::normalize_channel_event;

/// State shared across axum handlers.
struct AppState {
    hub: Arc<Hub>,
    keep_alive: Duration,
    publish_token: Option<String>,
}

pub fn router(hub: Arc<Hub>, config: &ChannelConfig) -> Router {
    let state = Arc::new(AppState {
        hub,
        keep_alive: config.keep_alive(),
        publish_token: config.publish_token.clone(),
    });

    Router::new()
        .route("/channel/{organization}/events", get(events))
        .route("/channel/{organization}/publish", post(publish))
        .route("/channel/{organization}/echo", post(echo))
        .with_state(state)
}

/// Serve the hub until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Channel hub listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Channel hub stopped");
    Ok(())
}

/// Live stream of one organization's channel messages.
///
/// A subscriber that falls further behind than the hub buffers has its
/// stream ended; it reconnects and re-fetches instead of silently missing
/// messages.
async fn events(
    State(state): State<Arc<AppState>>,
    Path(organization): Path<String>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.hub.subscribe(&organization).await;
    info!("New subscriber for {organization}");

    let stream = BroadcastStream::new(rx).map_while(move |frame| match frame {
        Ok(frame) => Some(Ok(Event::default().event(MESSAGE_EVENT).data(&*frame))),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!("Subscriber of {organization} lagged by {skipped} messages, closing stream");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive).text("ping"))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), (StatusCode, String)> {
    let Some(token) = &state.publish_token else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(token.as_str()) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "Invalid publish token".to_string()))
    }
}

async fn publish(
    State(state): State<Arc<AppState>>,
    Path(organization): Path<String>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> std::result::Result<Json<Value>, (StatusCode, String)> {
    authorize(&state, &headers)?;

    let Some(event) = normalize_channel_event(&raw) else {
        warn!("Rejected unrecognized channel message for {organization}: {raw}");
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "Unrecognized channel message".to_string(),
        ));
    };

    let (seq, receivers) = state
        .hub
        .publish(&organization, &event)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({ "seq": seq, "receivers": receivers })))
}

/// Connectivity probe only; nothing is broadcast.
async fn echo(body: String) -> String {
    format!("Echo: {body}")
}
