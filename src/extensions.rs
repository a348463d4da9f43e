//! Extension registry.
//!
//! Extensions are named template fragments (`.kurof` files) imported by a
//! definition from local paths or remote URLs. The registry is built once per
//! mock start and is read-only afterwards.

use indexmap::IndexMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::ExtensionError;

/// A loaded template fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Registry key; also the partial name when the fragment has no inline blocks
    pub name: String,
    /// Origin path or URL
    pub source: String,
    /// Raw fragment text
    pub content: String,
}

/// Name to extension map. Registering an existing name replaces it.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    extensions: IndexMap<String, Extension>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fragment. Last writer wins, and a replaced fragment moves
    /// to the end of the registration order.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        content: impl Into<String>,
        source: impl Into<String>,
    ) {
        let name = name.into();
        self.extensions.shift_remove(&name);
        self.extensions.insert(
            name.clone(),
            Extension {
                name,
                source: source.into(),
                content: content.into(),
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn get(&self, name: &str) -> Option<&Extension> {
        self.extensions.get(name)
    }

    /// Iterate fragments in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Extension> {
        self.extensions.values()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Load every import in order. Failures are logged and skipped.
    pub async fn load_imports(imports: &[String]) -> Self {
        let mut registry = Self::new();
        for source in imports {
            match load_source(source).await {
                Ok(content) => {
                    let name = extension_name(source);
                    info!(file = %source, name = %name, "Loaded extension");
                    registry.register(name, content, source.as_str());
                }
                Err(e) => {
                    warn!(file = %source, error = %e, "Failed to load extension, skipping");
                }
            }
        }
        registry
    }
}

/// Fetch raw fragment text. `http://` and `https://` sources are fetched
/// remotely and must answer 200; anything else is read from disk.
pub async fn load_source(source: &str) -> Result<String, ExtensionError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::get(source)
            .await
            .map_err(|error| ExtensionError::Http {
                source_url: source.to_string(),
                error,
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ExtensionError::Status {
                source_url: source.to_string(),
                status: status.as_u16(),
            });
        }

        return response.text().await.map_err(|error| ExtensionError::Http {
            source_url: source.to_string(),
            error,
        });
    }

    tokio::fs::read_to_string(source)
        .await
        .map_err(|error| ExtensionError::Io {
            path: source.to_string(),
            error,
        })
}

/// Registry name for a source: the file stem of its last path segment.
pub fn extension_name(source: &str) -> String {
    let without_query = source.split(['?', '#']).next().unwrap_or(source);
    let last = without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(without_query);

    Path::new(last)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| source.to_string())
}
