//! WebSocket listener for provider heartbeat sessions and device change
//! subscribers.
//!
//! Both endpoints share one listener; the upgrade request path picks the
//! handler. Auth headers are captured during the handshake callback because
//! principal resolution needs async store access, which the callback cannot
//! do.

pub mod changes;
pub mod provider;

use crate::{identity, AppContext};
use anyhow::Result;
use futures_util::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Message,
    },
};
use tracing::{debug, error, info, warn};

const HEARTBEAT_PATH: &str = "/websocket/heartbeat";
const CHANGES_PATH: &str = "/websocket/devicechanges";

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.ws_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "websocket server listening (provider heartbeat + device changes)");
    serve(listener, ctx).await
}

/// Accept loop on an already-bound listener.
pub async fn serve(listener: TcpListener, ctx: Arc<AppContext>) -> Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "accept error");
                continue;
            }
        };
        debug!(peer = %peer, "new websocket connection");
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx, peer).await {
                warn!(peer = %peer, err = %e, "websocket connection error");
            }
        });
    }
}

fn header_value(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn handle_connection(stream: TcpStream, ctx: Arc<AppContext>, peer: SocketAddr) -> Result<()> {
    let mut path = String::new();
    let mut authorization: Option<String> = None;
    let mut cookie: Option<String> = None;

    let callback = |req: &Request, resp: Response| {
        path = req.uri().path().to_string();
        authorization = header_value(req, "authorization");
        cookie = header_value(req, "cookie");
        if path == HEARTBEAT_PATH || path == CHANGES_PATH {
            Ok(resp)
        } else {
            let mut resp = ErrorResponse::new(Some("not found".to_string()));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            Err(resp)
        }
    };
    let mut ws = accept_hdr_async(stream, callback).await?;

    match path.as_str() {
        HEARTBEAT_PATH => provider::run_session(ws, ctx, peer).await,
        CHANGES_PATH => {
            let principal = identity::resolve(
                &ctx.store,
                &ctx.config,
                authorization.as_deref(),
                cookie.as_deref(),
            )
            .await;
            match principal {
                Ok(Some(p)) => changes::run_subscriber(ws, ctx, p).await,
                _ => {
                    // Same refusal the login-gated handlers give.
                    let _ = ws.send(Message::Text("need to login".to_string())).await;
                    let _ = ws.send(Message::Close(None)).await;
                    Ok(())
                }
            }
        }
        _ => Ok(()), // rejected during handshake
    }
}
