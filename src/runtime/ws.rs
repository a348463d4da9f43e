//! WebSocket mock handler.
//!
//! Unlike TCP, a connection stays open: every text message runs through the
//! pipeline and gets its own reply until the peer goes away.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::{bind_listener, build_engine, log_definition, spawn_accept_loop, ProtocolHandler, RunningListener};
use crate::config::{MockDefinition, Protocol, RuntimeSettings};
use crate::error::{PipelineError, StartError, StartResult};
use crate::matcher::MessagePipeline;

/// Serves a definition's `onMessage` rules over WebSocket.
pub struct WsHandler {
    settings: RuntimeSettings,
    running: Option<RunningListener>,
}

impl WsHandler {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            running: None,
        }
    }
}

#[async_trait]
impl ProtocolHandler for WsHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Ws
    }

    async fn start(&mut self, def: &MockDefinition) -> StartResult<()> {
        if self.running.is_some() {
            return Err(StartError::AlreadyRunning);
        }
        def.validate()?;
        log_definition(def);

        let engine = build_engine(def).await;
        let pipeline = Arc::new(MessagePipeline::new(def, engine));

        let listener = bind_listener(&self.settings, def.port).await?;
        let running = spawn_accept_loop(listener, Protocol::Ws, move |stream, peer| {
            handle_connection(stream, peer, Arc::clone(&pipeline))
        })?;

        info!(addr = %running.addr, name = %def.display_name(), "WebSocket mock listening");
        self.running = Some(running);
        Ok(())
    }

    async fn stop(&mut self) -> StartResult<()> {
        if let Some(running) = self.running.take() {
            running.shutdown().await;
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, pipeline: Arc<MessagePipeline>) {
    let mut ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket upgrade failed");
            return;
        }
    };
    info!(%peer, "WebSocket client connected");

    while let Some(frame) = ws.next().await {
        let input = match frame {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
            Ok(Message::Close(_)) => break,
            // Ping/pong are answered by the protocol layer
            Ok(_) => continue,
            Err(e) => {
                debug!(%peer, error = %e, "WebSocket read failed");
                break;
            }
        };
        debug!(%peer, input = %input, "Received WebSocket message");

        let reply = match pipeline.respond(&input) {
            Ok(Some(response)) => response,
            Ok(None) => {
                debug!(%peer, "No condition matched, nothing sent");
                continue;
            }
            Err(PipelineError::MissingRules) => {
                error!(%peer, "onMessage is not defined for WebSocket mock");
                format!("error: {}", PipelineError::MissingRules)
            }
            Err(e) => {
                error!(%peer, error = %e, "Failed to build response");
                continue;
            }
        };

        if let Err(e) = ws.send(Message::Text(reply.into())).await {
            warn!(%peer, error = %e, "Failed to send WebSocket message");
            break;
        }
    }

    info!(%peer, "WebSocket client disconnected");
}
