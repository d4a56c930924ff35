//! Per-provider heartbeat session.
//!
//! Each provider holds one persistent connection. Frames are JSON objects
//! tagged by `command`; the handshake is the mandatory first data frame
//! (a bare `ping` keepalive is allowed earlier). The session is
//! single-writer from the provider side; the core pushes `release` frames
//! asynchronously through the registry.
//!
//! Lost frames are never retransmitted — providers re-assert device state
//! on reconnect by re-sending `update`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::{Platform, Source};
use crate::AppContext;

/// Owner placeholder some provider builds send for "public".
const NOBODY_OWNER: &str = "nobody@nobody.io";

// ─── Wire frames ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
enum ProviderFrame {
    Ping,
    Handshake(HandshakeFrame),
    Update(UpdateFrame),
}

#[derive(Debug, Deserialize)]
struct HandshakeFrame {
    name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    secret: String,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateFrame {
    udid: String,
    #[serde(default)]
    platform: Option<Platform>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
    /// Endpoints for this session's Source. Absent or null removes the
    /// session's entry from the device.
    #[serde(default)]
    provider: Option<EndpointInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointInfo {
    #[serde(default)]
    device_address: Option<String>,
    #[serde(default)]
    remote_connect_address: Option<String>,
}

/// Frames pushed core → provider.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum OutboundCommand {
    Release { udid: String },
}

/// What the session caches after a successful handshake.
#[derive(Debug, Clone)]
struct SessionInfo {
    id: String,
    name: String,
    url: String,
    secret: String,
    priority: i64,
    owner: String,
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// The seam between the coordinator and the provider layer: the only
/// method the coordinator ever calls on it.
#[async_trait]
pub trait ReleaseChannel: Send + Sync {
    /// Push `release {udid}` to the live session `provider_id`.
    /// Returns `false` when the session is gone; the frame is not queued.
    async fn send_release(&self, provider_id: &str, udid: &str) -> bool;
}

/// Process-wide map of live provider sessions. Writers are session
/// open/close; the coordinator reads during release.
#[derive(Default)]
pub struct ProviderRegistry {
    sessions: RwLock<HashMap<String, mpsc::UnboundedSender<OutboundCommand>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, id: String, tx: mpsc::UnboundedSender<OutboundCommand>) {
        self.sessions.write().await.insert(id, tx);
    }

    async fn unregister(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ReleaseChannel for ProviderRegistry {
    async fn send_release(&self, provider_id: &str, udid: &str) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(provider_id) {
            Some(tx) => tx
                .send(OutboundCommand::Release {
                    udid: udid.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }
}

// ─── Session loop ────────────────────────────────────────────────────────────

pub async fn run_session(
    ws: WebSocketStream<TcpStream>,
    ctx: Arc<AppContext>,
    peer: SocketAddr,
) -> Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut session: Option<SessionInfo> = None;

    let result = session_loop(ws, &ctx, &tx, rx, &mut session).await;

    // Disconnect cleanup runs for orderly closes and protocol errors alike.
    if let Some(s) = &session {
        ctx.providers.unregister(&s.id).await;
        match ctx.store.remove_provider_sources(&s.id).await {
            Ok(changed) => info!(
                provider = %s.name,
                id = %s.id,
                devices = changed.len(),
                "provider disconnected — sources removed"
            ),
            Err(e) => error!(id = %s.id, err = %e, "disconnect cleanup failed"),
        }
    } else {
        debug!(peer = %peer, "provider connection closed before handshake");
    }

    result
}

async fn session_loop(
    ws: WebSocketStream<TcpStream>,
    ctx: &Arc<AppContext>,
    tx: &mpsc::UnboundedSender<OutboundCommand>,
    mut rx: mpsc::UnboundedReceiver<OutboundCommand>,
    session: &mut Option<SessionInfo>,
) -> Result<()> {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&text, ctx, tx, session, &mut sink).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(err = %e, "provider ws error");
                        break;
                    }
                    _ => {}
                }
            }
            cmd = rx.recv() => {
                // The local `tx` keeps the channel open for the whole session.
                if let Some(cmd) = cmd {
                    sink.send(Message::Text(serde_json::to_string(&cmd)?)).await?;
                }
            }
        }
    }
    Ok(())
}

async fn handle_frame(
    text: &str,
    ctx: &Arc<AppContext>,
    tx: &mpsc::UnboundedSender<OutboundCommand>,
    session: &mut Option<SessionInfo>,
    sink: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
) -> Result<()> {
    let frame: ProviderFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            error!(err = %e, "malformed provider frame — closing session");
            bail!("malformed provider frame: {e}");
        }
    };

    match frame {
        ProviderFrame::Ping => {
            sink.send(Message::Text("pong".to_string())).await?;
        }
        ProviderFrame::Handshake(h) => {
            if session.is_some() {
                bail!("duplicate handshake");
            }
            let id = Uuid::new_v4().to_string();
            let owner = match h.owner {
                Some(o) if o == NOBODY_OWNER => String::new(),
                Some(o) => o,
                None => String::new(),
            };
            info!(provider = %h.name, id = %id, priority = h.priority, "provider handshake");

            ctx.providers.register(id.clone(), tx.clone()).await;
            *session = Some(SessionInfo {
                id: id.clone(),
                name: h.name,
                url: h.url,
                secret: h.secret,
                priority: h.priority,
                owner,
            });
            sink.send(Message::Text(
                serde_json::json!({ "success": true, "id": id }).to_string(),
            ))
            .await?;
        }
        ProviderFrame::Update(u) => {
            let Some(s) = session.as_ref() else {
                bail!("update before handshake");
            };
            let source = u.provider.map(|p| Source {
                id: s.id.clone(),
                url: s.url.clone(),
                device_address: p.device_address,
                remote_connect_address: p.remote_connect_address,
                secret: s.secret.clone(),
                priority: s.priority,
            });
            debug!(udid = %u.udid, provider = %s.name, removing = source.is_none(), "device update");
            ctx.store
                .apply_provider_update(&u.udid, u.platform, u.properties, source, &s.owner, &s.id)
                .await?;
        }
    }
    Ok(())
}
