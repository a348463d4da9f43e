//! Protocol handlers.
//!
//! Each handler turns a validated [`MockDefinition`] into a live listener.
//! [`MockServer`] picks the handler for a definition's protocol.

pub mod http;
pub mod sftp;
pub mod tcp;
pub mod ws;

use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MockDefinition, Protocol, RuntimeSettings};
use crate::error::{StartError, StartResult};
use crate::extensions::Registry;
use crate::template::TemplateEngine;

pub use http::HttpHandler;
pub use sftp::SftpHandler;
pub use tcp::TcpHandler;
pub use ws::WsHandler;

/// Common start/stop contract for every protocol.
#[async_trait]
pub trait ProtocolHandler: Send {
    /// Protocol this handler serves.
    fn protocol(&self) -> Protocol;

    /// Bind the listener and start serving in the background.
    ///
    /// Returns once the listener is up; bind failures are returned here.
    async fn start(&mut self, def: &MockDefinition) -> StartResult<()>;

    /// Close the listener. Established connections are left to finish.
    async fn stop(&mut self) -> StartResult<()>;

    /// Address the listener is bound to while running.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// A handler for any protocol.
pub enum MockServer {
    Http(HttpHandler),
    Tcp(TcpHandler),
    Ws(WsHandler),
    Sftp(SftpHandler),
}

impl MockServer {
    /// Create the (stopped) handler for a protocol.
    pub fn for_protocol(protocol: Protocol, settings: RuntimeSettings) -> Self {
        match protocol {
            Protocol::Http => MockServer::Http(HttpHandler::new(settings)),
            Protocol::Tcp => MockServer::Tcp(TcpHandler::new(settings)),
            Protocol::Ws => MockServer::Ws(WsHandler::new(settings)),
            Protocol::Sftp => MockServer::Sftp(SftpHandler::new(settings)),
        }
    }

    /// Validate a definition, then start the matching handler.
    pub async fn launch(def: &MockDefinition, settings: RuntimeSettings) -> StartResult<Self> {
        def.validate()?;
        let mut server = Self::for_protocol(def.protocol, settings);
        server.start(def).await?;
        Ok(server)
    }

    fn handler(&self) -> &dyn ProtocolHandler {
        match self {
            MockServer::Http(h) => h,
            MockServer::Tcp(h) => h,
            MockServer::Ws(h) => h,
            MockServer::Sftp(h) => h,
        }
    }

    fn handler_mut(&mut self) -> &mut dyn ProtocolHandler {
        match self {
            MockServer::Http(h) => h,
            MockServer::Tcp(h) => h,
            MockServer::Ws(h) => h,
            MockServer::Sftp(h) => h,
        }
    }
}

#[async_trait]
impl ProtocolHandler for MockServer {
    fn protocol(&self) -> Protocol {
        self.handler().protocol()
    }

    async fn start(&mut self, def: &MockDefinition) -> StartResult<()> {
        self.handler_mut().start(def).await
    }

    async fn stop(&mut self) -> StartResult<()> {
        self.handler_mut().stop().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.handler().local_addr()
    }
}

/// Log what is about to start.
pub(crate) fn log_definition(def: &MockDefinition) {
    info!(
        name = %def.display_name(),
        protocol = %def.protocol,
        port = def.port,
        imports = def.import.len(),
        "Starting mock"
    );
    if let Some(timeout) = def.session.as_ref().and_then(|s| s.timeout.as_deref()) {
        debug!(timeout = %timeout, "Session timeout is advisory and not enforced");
    }
}

/// Load the definition's imports and compile the template engine for it.
pub(crate) async fn build_engine(def: &MockDefinition) -> Arc<TemplateEngine> {
    let registry = Registry::load_imports(&def.import).await;
    Arc::new(TemplateEngine::new(&registry))
}

/// Bind a TCP listener for a mock.
pub(crate) async fn bind_listener(settings: &RuntimeSettings, port: u16) -> StartResult<TcpListener> {
    TcpListener::bind(settings.bind_addr(port))
        .await
        .map_err(|source| StartError::Bind { port, source })
}

/// Pause after a failed `accept` (e.g. out of file descriptors).
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Wait out [`ACCEPT_BACKOFF`]. Returns `false` if cancelled first.
async fn accept_backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

/// A background accept loop and the token that ends it.
pub(crate) struct RunningListener {
    pub(crate) addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningListener {
    /// Stop accepting. Dropping the listener closes the socket.
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(addr = %self.addr, "Accept loop panicked");
            }
        }
    }
}

/// Run `on_conn` for every accepted connection, each in its own task.
///
/// A panic inside one connection is logged and ends only that connection.
/// Accept errors are logged and retried after a short pause; cancellation
/// ends the loop.
pub(crate) fn spawn_accept_loop<F, Fut>(
    listener: TcpListener,
    protocol: Protocol,
    on_conn: F,
) -> StartResult<RunningListener>
where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => {
                    info!(%protocol, %addr, "Listener closed");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%protocol, %peer, "Accepted connection");
                        let conn = tokio::spawn(on_conn(stream, peer));
                        tokio::spawn(async move {
                            if let Err(e) = conn.await {
                                if e.is_panic() {
                                    error!(%protocol, %peer, "Connection handler panicked");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!(%protocol, error = %e, "Failed to accept connection");
                        if !accept_backoff(&loop_cancel).await {
                            info!(%protocol, %addr, "Listener closed");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(RunningListener { addr, cancel, task })
}
