//! WebSocket front door
//!
//! One listener serves every client. The last path segment decides the role:
//! `/dashboard` and `/scada` are operator channels, anything else is taken as
//! a charge point id (`ws://host:9000/ocpp/CP1` → `CP1`).

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, info, warn};

use crate::bridge::run_device_session;
use crate::error::GatewayError;
use crate::events::DashboardRequest;
use crate::gateway::GatewayContext;
use crate::sinks::{DeviceRecord, TagValue};

/// Role of a connection, taken from its request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Dashboard,
    Scada,
    Device(String),
}

/// Operator channel flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Dashboard,
    /// May also write supervisory tags
    Scada,
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientKind::Dashboard => f.write_str("dashboard"),
            ClientKind::Scada => f.write_str("scada"),
        }
    }
}

/// Classify a request path by its last non-empty segment
pub fn classify_path(path: &str) -> Option<Route> {
    let segment = path.split('/').filter(|s| !s.is_empty()).last()?;
    Some(match segment {
        "dashboard" => Route::Dashboard,
        "scada" => Route::Scada,
        id => Route::Device(id.to_string()),
    })
}

/// First subprotocol offered by the client that the gateway supports
pub fn select_subprotocol<'a>(offered: &'a str, supported: &[String]) -> Option<&'a str> {
    offered
        .split(',')
        .map(str::trim)
        .find(|p| supported.iter().any(|s| s == p))
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Upgrade a TCP connection and run it to completion
pub async fn handle_connection(ctx: Arc<GatewayContext>, stream: TcpStream, peer: SocketAddr) {
    let mut route = None;
    let supported = ctx.config.subprotocols.clone();

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let Some(classified) = classify_path(request.uri().path()) else {
            return Err(bad_request("missing charge point id in path"));
        };

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if let Some(offered) = offered {
            match select_subprotocol(offered, &supported).map(HeaderValue::from_str) {
                Some(Ok(value)) => {
                    response
                        .headers_mut()
                        .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
                }
                _ => debug!("{}: no supported subprotocol in {:?}", peer, offered),
            }
        }

        route = Some(classified);
        Ok(response)
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(ctx.config.max_message_size),
        ..Default::default()
    };

    let ws = match accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("{}: {}", peer, GatewayError::Handshake(e));
            return;
        }
    };

    match route {
        Some(Route::Device(id)) => {
            info!("{}: charge point {} connecting", peer, id);
            run_device_session(ctx, ws, id).await;
        }
        Some(Route::Dashboard) => run_operator_client(ctx, ws, ClientKind::Dashboard).await,
        Some(Route::Scada) => run_operator_client(ctx, ws, ClientKind::Scada).await,
        None => debug!("{}: handshake completed without a route", peer),
    }
}

/// Serve a dashboard or SCADA client: snapshot, then deltas, while
/// accepting commands
async fn run_operator_client(ctx: Arc<GatewayContext>, ws: WebSocketStream<TcpStream>, kind: ClientKind) {
    let persisted = match ctx.store.list_charge_points().await {
        Ok(rows) => rows.iter().map(DeviceRecord::to_state_record).collect(),
        Err(e) => {
            warn!("Snapshot without stored charge points: {}", GatewayError::from(e));
            Vec::new()
        }
    };

    let registry = ctx.registry.clone();
    let mut subscription = ctx
        .broadcaster
        .register_dashboard(persisted, || registry.snapshot());
    info!("{} client {} connected", kind, subscription.id);

    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            frame = subscription.frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = ws_tx.send(Message::Text(frame.to_string().into())).await {
                        debug!("{} client {}: send failed: {}", kind, subscription.id, e);
                        break;
                    }
                }
                None => break,
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_operator_message(&ctx, kind, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("{} client {}: {}", kind, subscription.id, e);
                    break;
                }
            },
        }
    }

    ctx.broadcaster.remove_dashboard(subscription.id);
    let _ = ws_tx.close().await;
    info!("{} client {} disconnected", kind, subscription.id);
}

async fn handle_operator_message(ctx: &GatewayContext, kind: ClientKind, text: &str) {
    let request = match serde_json::from_str::<DashboardRequest>(text) {
        Ok(request) => request,
        Err(e) => {
            warn!("Ignoring {} message: {}", kind, e);
            return;
        }
    };

    match request {
        DashboardRequest::RemoteCommand {
            command,
            charge_point_id,
            params,
        } => {
            // Failures are logged by the router
            let _ = ctx.router.route(&command, &charge_point_id, params).await;
        }
        DashboardRequest::WriteTag {
            charge_point_id,
            tag,
            value,
        } => {
            if kind != ClientKind::Scada {
                warn!("Tag write for {} refused on {} channel", charge_point_id, kind);
                return;
            }
            let Some(value) = TagValue::from_json(&value) else {
                warn!("Unsupported value {} for {}.{}", value, charge_point_id, tag);
                return;
            };
            match ctx.tags.write(&charge_point_id, &tag, value) {
                Ok(Some(action)) => {
                    let _ = ctx.router.dispatch_trigger(action).await;
                }
                Ok(None) => {}
                Err(e) => warn!("Tag write {}.{} failed: {}", charge_point_id, tag, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_path() {
        assert_eq!(classify_path("/dashboard"), Some(Route::Dashboard));
        assert_eq!(classify_path("/scada/"), Some(Route::Scada));
        assert_eq!(
            classify_path("/ocpp/CP1"),
            Some(Route::Device("CP1".to_string()))
        );
        assert_eq!(classify_path("/CP-02"), Some(Route::Device("CP-02".to_string())));
        assert_eq!(classify_path("/"), None);
        assert_eq!(classify_path(""), None);
    }

    #[test]
    fn test_select_subprotocol() {
        let supported = vec!["ocpp1.6".to_string()];
        assert_eq!(select_subprotocol("ocpp1.6", &supported), Some("ocpp1.6"));
        assert_eq!(
            select_subprotocol("ocpp2.0.1, ocpp1.6", &supported),
            Some("ocpp1.6")
        );
        assert_eq!(select_subprotocol("ocpp2.0.1", &supported), None);
    }
}
