//! Kuro Mock
//!
//! A protocol mocking engine. A declarative definition turns into a live
//! HTTP, TCP, WebSocket or SFTP server whose responses are rendered from
//! Handlebars templates.
//!
//! # Features
//!
//! - **HTTP**: Routes grouped by path, templated headers and bodies, built-in health endpoints
//! - **TCP**: One message in, one templated response out
//! - **WebSocket**: Persistent message/response loop on the same rules as TCP
//! - **SFTP**: Seeded virtual filesystem over SSH with upload support
//! - **Extensions**: Reusable template fragments imported from files or URLs
//!
//! # Example Definition
//!
//! ```yaml
//! protocol: tcp
//! port: 9000
//! import:
//!   - ./toUpper.kurof
//! onMessage:
//!   match: "(?P<cmd>.+)"
//!   conditions:
//!     - if: '{{contains input.cmd "ping"}}'
//!       respond: "{{> toUpper input.cmd}}"
//!   else: "unknown command"
//! ```

pub mod config;
pub mod error;
pub mod extensions;
pub mod logging;
pub mod matcher;
pub mod runtime;
pub mod template;

pub use config::{MockDefinition, Protocol, RuntimeSettings};
pub use error::{ConfigError, StartError, ValidationError};
pub use runtime::{MockServer, ProtocolHandler};
