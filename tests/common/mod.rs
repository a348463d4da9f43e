//! Shared helpers for integration tests.

#![allow(dead_code)]

use kuro_mock::{MockDefinition, MockServer, RuntimeSettings};
use std::path::Path;
use std::time::Duration;

/// Upper bound for any single network step in a test.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Grab a port that is free right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Settings that keep every listener on loopback.
pub fn local_settings() -> RuntimeSettings {
    RuntimeSettings {
        host: "127.0.0.1".to_string(),
        shutdown_grace_ms: 500,
        ..Default::default()
    }
}

/// Write a file and return its path as a string.
pub fn write_file(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

/// Parse a YAML definition after substituting `PORT`.
pub fn definition(yaml: &str, port: u16) -> MockDefinition {
    MockDefinition::from_yaml(&yaml.replace("PORT", &port.to_string())).unwrap()
}

/// Start a definition on loopback.
pub async fn launch(def: &MockDefinition) -> MockServer {
    MockServer::launch(def, local_settings()).await.unwrap()
}

/// Extension used by the upper-casing scenarios.
pub const TO_UPPER: &str = r#"{{#*inline "toUpper"}}{{upper this}}{{/inline}}"#;
