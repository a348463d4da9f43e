//! Message matching pipeline.
//!
//! Shared by the TCP and WebSocket handlers: extract named values from the
//! raw message with a regex, merge them into the template context, evaluate
//! the guard expressions in order and render the first matching response.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{MockDefinition, OnMessage};
use crate::error::PipelineError;
use crate::template::{merge_context, TemplateEngine, TemplateRuntime};

/// Variable holding the whole message when there is nothing to extract.
pub const RAW_INPUT_VAR: &str = "msg";

/// How the `input` context is built from a raw message.
#[derive(Debug, Clone)]
pub enum Extractor {
    /// Bind the whole message as `msg`
    Whole,
    /// Bind each matched named group
    Pattern(Regex),
}

impl Extractor {
    /// Compile a `match` pattern. An empty pattern extracts nothing; an
    /// invalid one is logged and degrades to passing the raw text.
    pub fn compile(pattern: &str) -> Self {
        if pattern.is_empty() {
            return Extractor::Whole;
        }
        match Regex::new(pattern) {
            Ok(re) => Extractor::Pattern(re),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid match pattern, passing raw input");
                Extractor::Whole
            }
        }
    }

    /// Extract variables from one message.
    pub fn extract(&self, input: &str) -> Map<String, Value> {
        let mut vars = Map::new();
        match self {
            Extractor::Whole => {
                vars.insert(RAW_INPUT_VAR.to_string(), Value::String(input.to_string()));
            }
            Extractor::Pattern(re) => {
                if let Some(captures) = re.captures(input) {
                    for name in re.capture_names().flatten() {
                        if let Some(m) = captures.name(name) {
                            vars.insert(name.to_string(), Value::String(m.as_str().to_string()));
                        }
                    }
                }
            }
        }
        vars
    }
}

/// Immutable per-mock pipeline, shared by every connection.
pub struct MessagePipeline {
    rules: Option<OnMessage>,
    extractor: Extractor,
    engine: Arc<TemplateEngine>,
    globals: Map<String, Value>,
}

impl MessagePipeline {
    /// Build the pipeline for a definition.
    pub fn new(def: &MockDefinition, engine: Arc<TemplateEngine>) -> Self {
        Self::from_rules(def.on_message.clone(), def.variables(), engine)
    }

    pub fn from_rules(
        rules: Option<OnMessage>,
        globals: Map<String, Value>,
        engine: Arc<TemplateEngine>,
    ) -> Self {
        let extractor = rules
            .as_ref()
            .map(|r| Extractor::compile(&r.pattern))
            .unwrap_or(Extractor::Whole);

        Self {
            rules,
            extractor,
            engine,
            globals,
        }
    }

    /// Whether the definition had an `onMessage` block.
    pub fn has_rules(&self) -> bool {
        self.rules.is_some()
    }

    /// Produce the response for one message.
    ///
    /// `Ok(None)` means no condition matched and there is no `else`.
    pub fn respond(&self, input: &str) -> Result<Option<String>, PipelineError> {
        let rules = self.rules.as_ref().ok_or(PipelineError::MissingRules)?;

        let vars = self.extractor.extract(input);
        let ctx = merge_context(Some(vars), None, Some(self.globals.clone()));
        let tpl = TemplateRuntime::new(Arc::clone(&self.engine), ctx);

        for (i, cond) in rules.conditions.iter().enumerate() {
            let result = match tpl.render(&format!("cond_{i}"), &cond.guard) {
                Ok(result) => result,
                Err(e) => {
                    debug!(condition = i, error = %e, "Condition failed to render, skipping");
                    continue;
                }
            };
            debug!(condition = i, guard = %cond.guard, result = %result, "Evaluated condition");

            if result == "true" {
                let stage = format!("resp_{i}");
                return tpl
                    .render(&stage, &cond.respond)
                    .map(Some)
                    .map_err(|source| PipelineError::Render { stage, source });
            }
        }

        if rules.fallback.is_empty() {
            return Ok(None);
        }

        tpl.render("else", &rules.fallback)
            .map(Some)
            .map_err(|source| PipelineError::Render {
                stage: "else".to_string(),
                source,
            })
    }
}
