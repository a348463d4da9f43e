//! SFTP mock handler.
//!
//! The definition's files are written under a backing directory before the
//! listener opens; SFTP clients then see that directory as `/`. Uploads land
//! in the same tree and are visible to every later session.

use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::key::{KeyPair, PublicKey};
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{bind_listener, log_definition, spawn_accept_loop, ProtocolHandler, RunningListener};
use crate::config::{FileEntry, MockDefinition, Protocol, RuntimeSettings, SftpAuth};
use crate::error::{StartError, StartResult};

/// Largest chunk returned by a single read request.
const MAX_READ_LEN: u32 = 256 * 1024;

/// Serves a definition's `files` over SSH/SFTP.
pub struct SftpHandler {
    settings: RuntimeSettings,
    running: Option<RunningListener>,
}

impl SftpHandler {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            running: None,
        }
    }
}

#[async_trait]
impl ProtocolHandler for SftpHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Sftp
    }

    async fn start(&mut self, def: &MockDefinition) -> StartResult<()> {
        if self.running.is_some() {
            return Err(StartError::AlreadyRunning);
        }
        def.validate()?;
        log_definition(def);

        let root = Arc::new(VirtualRoot::new(&self.settings.sftp_root));
        root.materialize(&def.files).await?;
        debug!(root = %root.base().display(), files = def.files.len(), "Materialized SFTP files");

        let key = load_host_key(self.settings.host_key_path.as_deref())?;
        let config = Arc::new(server::Config {
            keys: vec![key],
            auth_rejection_time: Duration::from_millis(250),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let auth = Arc::new(def.sftp_auth.clone().unwrap_or_default());
        if !auth.enforce {
            warn!("SFTP authentication is permissive, any credentials are accepted");
        }

        let listener = bind_listener(&self.settings, def.port).await?;
        let running = spawn_accept_loop(listener, Protocol::Sftp, move |stream, peer| {
            let session = SshSession::new(Arc::clone(&root), Arc::clone(&auth), peer);
            serve_connection(Arc::clone(&config), stream, peer, session)
        })?;

        info!(
            addr = %running.addr,
            root = %self.settings.sftp_root.display(),
            name = %def.display_name(),
            "SFTP mock listening"
        );
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

/// Load the configured host key, or generate a throwaway one.
fn load_host_key(path: Option<&Path>) -> StartResult<KeyPair> {
    match path {
        Some(path) => russh_keys::load_secret_key(path, None)
            .map_err(|e| StartError::HostKey(format!("{}: {e}", path.display()))),
        None => {
            warn!("No host key configured, generating an ephemeral ed25519 key");
            KeyPair::generate_ed25519()
                .ok_or_else(|| StartError::HostKey("failed to generate ed25519 key".to_string()))
        }
    }
}

async fn serve_connection(
    config: Arc<server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    session: SshSession,
) {
    let running = match server::run_stream(config, stream, session).await {
        Ok(running) => running,
        Err(e) => {
            warn!(%peer, error = %e, "SSH handshake failed");
            return;
        }
    };

    match running.await {
        Ok(()) => info!(%peer, "SSH session closed"),
        Err(e) => debug!(%peer, error = %e, "SSH session ended with error"),
    }
}

/// Backing directory presented to clients as `/`.
#[derive(Debug, Clone)]
pub struct VirtualRoot {
    base: PathBuf,
}

impl VirtualRoot {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Canonical `/a/b` form of a client path. `..` never climbs above `/`.
    pub fn normalize(path: &str) -> String {
        format!("/{}", components(path).join("/"))
    }

    /// Real location of a client path. Always inside the base directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        components(path)
            .into_iter()
            .fold(self.base.clone(), |acc, part| acc.join(part))
    }

    /// Write every entry into the tree, creating parents as needed.
    ///
    /// Failing to create the base directory is an error; a single entry that
    /// cannot be written is logged and skipped.
    pub async fn materialize(&self, files: &[FileEntry]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.base).await?;

        for entry in files {
            let target = self.resolve(&entry.path);
            if target == self.base {
                warn!(path = %entry.path, "File entry has no name, skipping");
                continue;
            }
            if let Some(parent) = target.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    warn!(path = %entry.path, error = %e, "Failed to create parent directory");
                    continue;
                }
            }
            match tokio::fs::write(&target, entry.content.as_bytes()).await {
                Ok(()) => debug!(path = %entry.path, bytes = entry.content.len(), "Materialized file"),
                Err(e) => warn!(path = %entry.path, error = %e, "Failed to write file"),
            }
        }
        Ok(())
    }
}

fn components(path: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    parts
}

/// SSH-level state for one connection.
struct SshSession {
    root: Arc<VirtualRoot>,
    auth: Arc<SftpAuth>,
    peer: SocketAddr,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl SshSession {
    fn new(root: Arc<VirtualRoot>, auth: Arc<SftpAuth>, peer: SocketAddr) -> Self {
        Self {
            root,
            auth,
            peer,
            channels: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }
}

#[async_trait]
impl server::Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.auth.enforce && (user != self.auth.username || password != self.auth.password) {
            warn!(peer = %self.peer, user, "Rejected SFTP password login");
            return Ok(Self::reject());
        }
        info!(peer = %self.peer, user, "Accepted SFTP password login");
        Ok(Auth::Accept)
    }

    async fn auth_publickey(&mut self, user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        if self.auth.enforce {
            warn!(peer = %self.peer, user, "Rejected SFTP public key login");
            return Ok(Self::reject());
        }
        info!(peer = %self.peer, user, "Accepted SFTP public key login");
        Ok(Auth::Accept)
    }

    // Other channel kinds (direct-tcpip, x11, ...) keep the default rejection
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, channel = ?channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            debug!(peer = %self.peer, subsystem = name, "Ignoring subsystem request");
            session.channel_failure(channel_id);
            return Ok(());
        }

        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id);
            return Ok(());
        };

        session.channel_success(channel_id);
        info!(peer = %self.peer, "SFTP subsystem started");
        russh_sftp::server::run(channel.into_stream(), SftpFs::new(Arc::clone(&self.root))).await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.close(channel);
        Ok(())
    }
}

enum OpenHandle {
    File(tokio::fs::File),
    /// Directory listing, taken by the first `readdir`
    Dir(Option<Vec<File>>),
}

/// SFTP operations backed by a [`VirtualRoot`].
pub struct SftpFs {
    root: Arc<VirtualRoot>,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpFs {
    pub fn new(root: Arc<VirtualRoot>) -> Self {
        Self {
            root,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn insert_handle(&mut self, handle: OpenHandle) -> String {
        self.next_handle += 1;
        let key = self.next_handle.to_string();
        self.handles.insert(key.clone(), handle);
        key
    }

    fn file_mut(&mut self, handle: &str) -> Result<&mut tokio::fs::File, StatusCode> {
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File(file)) => Ok(file),
            Some(OpenHandle::Dir(_)) => Err(StatusCode::Failure),
            None => Err(StatusCode::NoSuchFile),
        }
    }

    /// Resolve a path that must not be the root itself.
    fn resolve_entry(&self, path: &str) -> Result<PathBuf, StatusCode> {
        if VirtualRoot::normalize(path) == "/" {
            return Err(StatusCode::PermissionDenied);
        }
        Ok(self.root.resolve(path))
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn io_status(e: std::io::Error) -> StatusCode {
    debug!(error = %e, "SFTP operation failed");
    match e.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

impl russh_sftp::server::Handler for SftpFs {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, "SFTP init");
        Ok(Version::new())
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        Ok(Name {
            id,
            files: vec![File::dummy(VirtualRoot::normalize(&path))],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = tokio::fs::metadata(self.root.resolve(&path))
            .await
            .map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&meta),
        })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = tokio::fs::symlink_metadata(self.root.resolve(&path))
            .await
            .map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&meta),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let meta = self.file_mut(&handle)?.metadata().await.map_err(io_status)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&meta),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        _path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        Ok(ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        _handle: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        Ok(ok_status(id))
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = self.resolve_entry(&filename)?;
        let append = pflags.contains(OpenFlags::APPEND);
        let write = pflags.contains(OpenFlags::WRITE) || append;
        let read = pflags.contains(OpenFlags::READ) || !write;

        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(read)
            .write(write)
            .append(append)
            .truncate(pflags.contains(OpenFlags::TRUNCATE) && !append);
        if pflags.contains(OpenFlags::CREATE) {
            if pflags.contains(OpenFlags::EXCLUDE) {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }

        let file = options.open(&path).await.map_err(io_status)?;
        let handle = self.insert_handle(OpenHandle::File(file));
        debug!(path = %filename, handle = %handle, read, write, "Opened file");
        Ok(Handle { id, handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.file_mut(&handle)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_status)?;

        let mut data = vec![0u8; len.min(MAX_READ_LEN) as usize];
        let n = file.read(&mut data).await.map_err(io_status)?;
        if n == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(n);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.file_mut(&handle)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_status)?;
        file.write_all(&data).await.map_err(io_status)?;
        file.flush().await.map_err(io_status)?;
        Ok(ok_status(id))
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(OpenHandle::File(mut file)) => {
                file.flush().await.map_err(io_status)?;
                Ok(ok_status(id))
            }
            Some(OpenHandle::Dir(_)) => Ok(ok_status(id)),
            None => Err(StatusCode::NoSuchFile),
        }
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let mut dir = tokio::fs::read_dir(self.root.resolve(&path))
            .await
            .map_err(io_status)?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_status)? {
            let meta = entry.metadata().await.map_err(io_status)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            entries.push(File::new(name, FileAttributes::from(&meta)));
        }

        let handle = self.insert_handle(OpenHandle::Dir(Some(entries)));
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir(listing)) => match listing.take() {
                Some(files) => Ok(Name { id, files }),
                None => Err(StatusCode::Eof),
            },
            Some(OpenHandle::File(_)) => Err(StatusCode::Failure),
            None => Err(StatusCode::NoSuchFile),
        }
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let path = self.resolve_entry(&filename)?;
        tokio::fs::remove_file(path).await.map_err(io_status)?;
        Ok(ok_status(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let target = self.resolve_entry(&path)?;
        tokio::fs::create_dir(target).await.map_err(io_status)?;
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let target = self.resolve_entry(&path)?;
        tokio::fs::remove_dir(target).await.map_err(io_status)?;
        Ok(ok_status(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        let from = self.resolve_entry(&oldpath)?;
        let to = self.resolve_entry(&newpath)?;
        tokio::fs::rename(from, to).await.map_err(io_status)?;
        Ok(ok_status(id))
    }
}
