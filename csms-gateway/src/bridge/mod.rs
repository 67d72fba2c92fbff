//! Protocol handler bridge
//!
//! Runs one device session: the WebSocket on one side, the decoder process
//! on the other. Every device frame goes to the decoder's stdin, every
//! decoder line goes back to the device, and both are inspected on the way.
//!
//! ```text
//!  device ──ws──► Inspector ──stdin──► decoder
//!  device ◄──ws── Inspector ◄─stdout── decoder
//!                    │
//!                    ▼
//!               Broadcaster ──► dashboards, tags, persistence
//! ```
//!
//! The session ends on socket close, decoder exit, takeover or gateway
//! shutdown. Teardown is the same in every case, except that a superseded
//! session leaves the registry and sinks to its successor.

pub mod decoder;
pub mod inspect;

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::events::Event;
use crate::gateway::GatewayContext;
use crate::session::SessionHandle;

pub use decoder::{DecoderOutput, DecoderProcess};
pub use inspect::{DecoderFrame, DeviceFrame, Inspector};

/// Frames queued by the command router ahead of the socket
const OUTBOUND_BUFFER: usize = 64;

async fn refuse(mut ws: WebSocketStream<TcpStream>, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!("close after refusal failed: {}", e);
    }
}

/// Publish the disconnect of a session that is no longer in the registry
fn announce_departure(ctx: &GatewayContext, session: &SessionHandle) {
    let id = session.charge_point_id().to_string();
    info!(
        "{}: session {} replaced by a connection that failed to start",
        id,
        session.session_id()
    );
    ctx.broadcaster.publish_with(|| {
        session.with_state(|s| s.disconnect());
        ctx.tags.release(&id);
        vec![Event::Disconnected { id: id.clone() }]
    });
}

/// Run a device session until it ends
pub async fn run_device_session(
    ctx: Arc<GatewayContext>,
    ws: WebSocketStream<TcpStream>,
    charge_point_id: String,
) {
    let admission = match ctx.registry.admit(&charge_point_id) {
        Ok(admission) => admission,
        Err(e @ GatewayError::ShuttingDown) => {
            refuse(ws, CloseCode::Away, &e.to_string()).await;
            return;
        }
        Err(e) => {
            refuse(ws, CloseCode::Policy, &e.to_string()).await;
            return;
        }
    };

    let (decoder, mut decoder_rx) = match DecoderProcess::spawn(&ctx.config.decoder, &charge_point_id) {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("{}", e);
            // Announce while the guard still keeps newer connections out
            if let Some(displaced) = admission.displaced() {
                announce_departure(&ctx, displaced);
            }
            drop(admission);
            refuse(ws, CloseCode::Error, "decoder unavailable").await;
            return;
        }
    };

    if let Err(e) = ctx.tags.bind(&charge_point_id) {
        warn!("{}: supervisory binding unavailable: {}", charge_point_id, e);
    }

    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let (handle, mut shutdown_rx) = SessionHandle::new(&charge_point_id, out_tx, decoder.clone());

    let superseded = admission.superseded();
    ctx.broadcaster.publish_with(|| {
        admission.install(handle.clone());
        vec![Event::Connected {
            id: charge_point_id.clone(),
            state: handle.state(),
        }]
    });
    info!(
        "{}: session {} connected{}",
        charge_point_id,
        handle.session_id(),
        if superseded { " (takeover)" } else { "" }
    );

    let mut inspector = Inspector::new(&charge_point_id);
    let (mut ws_tx, mut ws_rx) = ws.split();

    let reason: String = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break "terminated".into(),

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let mut forward = None;
                    ctx.broadcaster.publish_with(|| {
                        let frame = handle.with_state(|s| inspector.on_device_text(s, text.as_str()));
                        forward = frame.forward;
                        frame.events
                    });
                    if let Some(line) = forward {
                        if let Err(e) = decoder.write_line(&line).await {
                            warn!("{}", e);
                            break "decoder stdin closed".into();
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("{}: ignoring binary frame", charge_point_id);
                }
                Some(Ok(Message::Close(_))) | None => break "socket closed".into(),
                Some(Ok(_)) => {}
                Some(Err(source)) => {
                    let e = GatewayError::Transport {
                        charge_point_id: charge_point_id.clone(),
                        source,
                    };
                    warn!("{}", e);
                    break "transport error".into();
                }
            },

            output = decoder_rx.recv() => match output {
                Some(DecoderOutput::Line(line)) => {
                    let mut reply = None;
                    ctx.broadcaster.publish_with(|| {
                        let frame = handle.with_state(|s| inspector.on_decoder_line(s, &line));
                        reply = frame.reply;
                        frame.events
                    });
                    if let Some(reply) = reply {
                        if let Err(source) = ws_tx.send(Message::Text(reply.into())).await {
                            warn!("{}", GatewayError::Transport { charge_point_id: charge_point_id.clone(), source });
                            break "transport error".into();
                        }
                    }
                }
                Some(DecoderOutput::Exited) | None => {
                    let e = GatewayError::DecoderProcess {
                        charge_point_id: charge_point_id.clone(),
                        reason: match decoder.exit_code() {
                            Some(code) => format!("exited with code {}", code),
                            None => "exited".to_string(),
                        },
                    };
                    warn!("{}", e);
                    break "decoder exited".into();
                }
            },

            Some(frame) = out_rx.recv() => {
                if let Err(source) = ws_tx.send(Message::Text(frame.into())).await {
                    warn!("{}", GatewayError::Transport { charge_point_id: charge_point_id.clone(), source });
                    break "transport error".into();
                }
            }
        }
    };

    // Teardown: commands queued from here on fail instead of hanging
    handle.terminate();
    out_rx.close();
    if let Err(e) = ws_tx.close().await {
        debug!("{}: socket close: {}", charge_point_id, e);
    }

    let mut removed = false;
    ctx.broadcaster.publish_with(|| {
        if !ctx.registry.remove(&charge_point_id, &handle) {
            return Vec::new();
        }
        removed = true;
        handle.with_state(|s| s.disconnect());
        ctx.tags.release(&charge_point_id);
        vec![Event::Disconnected {
            id: charge_point_id.clone(),
        }]
    });

    if removed {
        info!("{}: session {} ended ({})", charge_point_id, handle.session_id(), reason);
    } else {
        info!(
            "{}: superseded session {} ended ({})",
            charge_point_id,
            handle.session_id(),
            reason
        );
    }
}
