//! TCP mock handler.
//!
//! One read, one response, then the connection is closed.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::{bind_listener, build_engine, log_definition, spawn_accept_loop, ProtocolHandler, RunningListener};
use crate::config::{MockDefinition, Protocol, RuntimeSettings};
use crate::error::{PipelineError, StartError, StartResult};
use crate::matcher::MessagePipeline;

/// Largest message read from a connection.
pub const READ_BUFFER_SIZE: usize = 2048;

/// Serves a definition's `onMessage` rules over raw TCP.
pub struct TcpHandler {
    settings: RuntimeSettings,
    running: Option<RunningListener>,
}

impl TcpHandler {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            running: None,
        }
    }
}

#[async_trait]
impl ProtocolHandler for TcpHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
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
        let running = spawn_accept_loop(listener, Protocol::Tcp, move |stream, peer| {
            handle_connection(stream, peer, Arc::clone(&pipeline))
        })?;

        info!(addr = %running.addr, name = %def.display_name(), "TCP mock listening");
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

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, pipeline: Arc<MessagePipeline>) {
    if !pipeline.has_rules() {
        error!(%peer, "onMessage is not defined for TCP mock");
        let diagnostic = format!("error: {}\n", PipelineError::MissingRules);
        if let Err(e) = stream.write_all(diagnostic.as_bytes()).await {
            debug!(%peer, error = %e, "Failed to write diagnostic");
        }
        return;
    }

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let n = match stream.read(&mut buf).await {
        Ok(0) => {
            debug!(%peer, "Connection closed before any data");
            return;
        }
        Ok(n) => n,
        Err(e) => {
            warn!(%peer, error = %e, "Failed to read from connection");
            return;
        }
    };

    let input = String::from_utf8_lossy(&buf[..n]);
    info!(%peer, input = %input, "Received TCP message");

    match pipeline.respond(&input) {
        Ok(Some(mut response)) => {
            if !response.is_empty() && !response.ends_with('\n') {
                response.push('\n');
            }
            if let Err(e) = stream.write_all(response.as_bytes()).await {
                warn!(%peer, error = %e, "Failed to write response");
                return;
            }
            debug!(%peer, bytes = response.len(), "Sent TCP response");
        }
        Ok(None) => debug!(%peer, "No condition matched, closing without response"),
        Err(e) => error!(%peer, error = %e, "Failed to build response"),
    }

    if let Err(e) = stream.shutdown().await {
        debug!(%peer, error = %e, "Failed to shut down connection");
    }
}
