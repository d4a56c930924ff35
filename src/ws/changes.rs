//! Per-subscriber device change feed.
//!
//! Each subscriber owns its own receiver on the store's change broadcast,
//! filtered through the subscriber's visibility predicate. A non-admin
//! never sees an event for a device outside their visibility, including
//! the insert frame. Provider secrets (`sources`) are only included for
//! admins.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

use crate::auth;
use crate::identity::Principal;
use crate::AppContext;

pub async fn run_subscriber(
    ws: WebSocketStream<TcpStream>,
    ctx: Arc<AppContext>,
    principal: Principal,
) -> Result<()> {
    let mut rx = ctx.store.subscribe();
    let (mut sink, mut stream) = ws.split();
    info!(user = %principal.email, "device change subscriber connected");

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "subscriber message ignored");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "subscriber ws error");
                        break;
                    }
                    _ => {}
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        if !auth::visible(&principal, &ev.new) {
                            continue;
                        }
                        let frame = serde_json::json!({
                            "event": if ev.old.is_none() { "insert" } else { "update" },
                            "data": ev.new.api_json(principal.admin),
                        });
                        if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
                            warn!(err = %e, "subscriber send error");
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(n)) => {
                        // The sender is never blocked on a slow subscriber;
                        // events are dropped for this client only.
                        warn!(skipped = n, "change feed lagged — slow subscriber skipped events");
                    }
                }
            }
        }
    }

    info!(user = %principal.email, "device change subscriber disconnected");
    Ok(())
}
