//! Mock definition model.
//!
//! Describes one mock (protocol, port and protocol-specific rules), how it is
//! loaded from YAML/JSON, and the structural validation every definition must
//! pass before a handler may start it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ValidationError};

/// Wire protocol a mock speaks. Selects the handler and which
/// protocol-specific fields are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Protocol {
    Http,
    Tcp,
    Ws,
    Sftp,
}

impl Protocol {
    /// Lower-case name as written in definitions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Ws => "ws",
            Protocol::Sftp => "sftp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "tcp" => Ok(Protocol::Tcp),
            "ws" => Ok(Protocol::Ws),
            "sftp" => Ok(Protocol::Sftp),
            other => Err(ValidationError::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Root of a mock definition. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockDefinition {
    /// Protocol served by this mock
    pub protocol: Protocol,

    /// Listen port
    pub port: u16,

    /// Display metadata
    #[serde(default)]
    pub meta: Meta,

    /// HTTP routes (protocol = http)
    #[serde(default)]
    pub routes: Vec<Route>,

    /// Message rules (protocol = tcp | ws)
    #[serde(default)]
    pub on_message: Option<OnMessage>,

    /// Virtual file tree (protocol = sftp)
    #[serde(default)]
    pub files: Vec<FileEntry>,

    /// SFTP credentials (protocol = sftp)
    #[serde(default)]
    pub sftp_auth: Option<SftpAuth>,

    /// Session hints, advisory only
    #[serde(default)]
    pub session: Option<SessionSettings>,

    /// Global variables visible to every template as `context.*`
    #[serde(default)]
    pub context: Option<ContextVariables>,

    /// Extension sources (local paths or URLs)
    #[serde(default)]
    pub import: Vec<String>,
}

impl MockDefinition {
    /// Load a definition from disk, picking JSON for `.json` files and YAML
    /// otherwise. The result is always validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: PathBuf::from(path),
            source,
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let def: Self = serde_yaml::from_str(yaml)?;
        def.validate()?;
        Ok(def)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let def: Self = serde_json::from_str(json)?;
        def.validate()?;
        Ok(def)
    }

    /// Check that the protocol-specific required fields are present.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort(self.port));
        }

        match self.protocol {
            Protocol::Http => {
                if self.routes.is_empty() {
                    return Err(ValidationError::MissingRoutes);
                }
            }
            Protocol::Tcp | Protocol::Ws => {
                if self.on_message.is_none() {
                    return Err(ValidationError::MissingOnMessage(self.protocol));
                }
            }
            Protocol::Sftp => {
                if self.files.is_empty() {
                    return Err(ValidationError::MissingFiles);
                }
                let auth = self
                    .sftp_auth
                    .as_ref()
                    .ok_or(ValidationError::MissingSftpAuth)?;
                if auth.username.is_empty() || auth.password.is_empty() {
                    return Err(ValidationError::IncompleteSftpAuth);
                }
            }
        }
        Ok(())
    }

    /// Global variables, empty when the definition has no `context` block.
    pub fn variables(&self) -> Map<String, Value> {
        self.context
            .as_ref()
            .map(|c| c.variables.clone())
            .unwrap_or_default()
    }

    /// Name used in diagnostics.
    pub fn display_name(&self) -> &str {
        if self.meta.name.is_empty() {
            self.protocol.as_str()
        } else {
            &self.meta.name
        }
    }
}

/// Display metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A single HTTP route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Request path; may contain template syntax resolved against `context`
    pub path: String,

    /// HTTP method (empty = any)
    #[serde(default)]
    pub method: String,

    /// Response to render
    #[serde(default)]
    pub response: ResponseDefinition,
}

impl Route {
    /// Whether this route answers the given method.
    pub fn accepts(&self, method: &str) -> bool {
        self.method.is_empty() || self.method.eq_ignore_ascii_case(method)
    }
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Header name to template string
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Body template
    #[serde(default)]
    pub body: String,
}

impl Default for ResponseDefinition {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: HashMap::new(),
            body: String::new(),
        }
    }
}

fn default_status() -> u16 {
    200
}

/// Message handling rules shared by TCP and WebSocket mocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnMessage {
    /// Regex with named groups; empty binds the whole input as `msg`
    #[serde(rename = "match", default)]
    pub pattern: String,

    /// Guards evaluated in declaration order
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Template rendered when no condition matches
    #[serde(rename = "else", default)]
    pub fallback: String,
}

/// One guarded response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Template expected to render exactly `true`
    #[serde(rename = "if")]
    pub guard: String,

    /// Template rendered when the guard holds
    #[serde(default)]
    pub respond: String,
}

/// A file in the SFTP virtual tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute, slash-delimited virtual path
    pub path: String,

    /// Literal file content
    #[serde(default)]
    pub content: String,
}

/// SFTP credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpAuth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Authorized public key file (informational)
    #[serde(default)]
    pub public_key_path: Option<String>,

    /// Check credentials instead of accepting every login
    #[serde(default)]
    pub enforce: bool,
}

/// Session hints. The timeout is advisory and not enforced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub timeout: Option<String>,
}

/// Global template variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextVariables {
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// Process-level settings that are not part of any definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSettings {
    /// Address every listener binds to
    #[serde(default = "default_host")]
    pub host: String,

    /// Backing directory for SFTP virtual files
    #[serde(default = "default_sftp_root")]
    pub sftp_root: PathBuf,

    /// SSH host private key; an ephemeral key is generated when unset
    #[serde(default)]
    pub host_key_path: Option<PathBuf>,

    /// Graceful shutdown window for HTTP mocks
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// How long `start` watches a freshly launched server for early exit
    #[serde(default = "default_bind_check_ms")]
    pub bind_check_ms: u64,
}

impl RuntimeSettings {
    /// `host:port` for a listener.
    pub fn bind_addr(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            sftp_root: default_sftp_root(),
            host_key_path: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
            bind_check_ms: default_bind_check_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_sftp_root() -> PathBuf {
    PathBuf::from("sftp_root")
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_bind_check_ms() -> u64 {
    100
}
