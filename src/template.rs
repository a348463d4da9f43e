//! Template engine for dynamic responses.
//!
//! Uses Handlebars for template rendering. Every render sees the same
//! three-part context: `input` (per request/message data), `session`
//! (reserved, always empty) and `context` (the definition's global variables).
//! Extension fragments are registered as named partials and invoked with
//! `{{> name some.value}}`.

use handlebars::{
    Context, Handlebars, Helper, HelperDef, RenderContext, RenderError, ScopedJson, Template,
    TemplateError,
};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};

use crate::extensions::{Extension, Registry};

/// Handlebars registry seeded with the function library and every
/// extension fragment of one mock. Built once per mock start.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl TemplateEngine {
    /// Create an engine from an extension registry snapshot.
    ///
    /// A fragment that does not parse is logged and left out; the rest of
    /// the registry is still registered.
    pub fn new(registry: &Registry) -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("now", Box::new(SafeHelper(now)));
        handlebars.register_helper("uuid", Box::new(SafeHelper(uuid_v4)));
        handlebars.register_helper("toJSON", Box::new(SafeHelper(to_json)));
        handlebars.register_helper("contains", Box::new(SafeHelper(contains)));
        handlebars.register_helper("regexMatch", Box::new(SafeHelper(regex_match)));
        handlebars.register_helper("upper", Box::new(SafeHelper(upper)));
        handlebars.register_helper("lower", Box::new(SafeHelper(lower)));
        handlebars.register_helper("title", Box::new(SafeHelper(title)));
        handlebars.register_helper("trim", Box::new(SafeHelper(trim)));
        handlebars.register_helper("split", Box::new(SafeHelper(split)));
        handlebars.register_helper("join", Box::new(SafeHelper(join)));
        handlebars.register_helper("replace", Box::new(SafeHelper(replace)));
        handlebars.register_helper("len", Box::new(SafeHelper(len)));
        handlebars.register_helper("default", Box::new(SafeHelper(default_value)));

        // Don't escape HTML by default (we're not rendering HTML)
        handlebars.register_escape_fn(handlebars::no_escape);

        for ext in registry.iter() {
            if let Err(e) = register_fragment(&mut handlebars, ext) {
                warn!(
                    extension = %ext.name,
                    file = %ext.source,
                    error = %e,
                    "Skipping extension that failed to compile"
                );
            }
        }

        Self { handlebars }
    }

    /// Engine with no extensions.
    pub fn without_extensions() -> Self {
        Self::new(&Registry::new())
    }

    /// Render a raw template string against a context.
    pub fn render(&self, name: &str, raw: &str, context: &Value) -> Result<String, RenderError> {
        let result = self.handlebars.render_template(raw, context);
        match &result {
            Ok(out) => trace!(template = name, output = %out, "Rendered template"),
            Err(e) => debug!(template = name, error = %e, "Template rendering failed"),
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn has_partial(&self, name: &str) -> bool {
        self.handlebars.get_template(name).is_some()
    }
}

/// One render session: a shared engine plus the context for a single
/// request or message.
#[derive(Clone)]
pub struct TemplateRuntime {
    engine: Arc<TemplateEngine>,
    context: Value,
}

impl TemplateRuntime {
    pub fn new(engine: Arc<TemplateEngine>, context: Value) -> Self {
        Self { engine, context }
    }

    /// Render `raw` under the diagnostic name `name`.
    pub fn render(&self, name: &str, raw: &str) -> Result<String, RenderError> {
        self.engine.render(name, raw, &self.context)
    }

    pub fn context(&self) -> &Value {
        &self.context
    }
}

/// Build the three-part template context. Missing parts become empty maps.
pub fn merge_context(
    input: Option<Map<String, Value>>,
    session: Option<Map<String, Value>>,
    global: Option<Map<String, Value>>,
) -> Value {
    json!({
        "input": input.unwrap_or_default(),
        "session": session.unwrap_or_default(),
        "context": global.unwrap_or_default(),
    })
}

fn inline_block_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"(?s)\{\{~?#\*inline\s+"([^"]+)"\s*~?\}\}(.*?)\{\{~?/inline\s*~?\}\}"#).ok()
        })
        .as_ref()
}

/// Register a fragment. Each `{{#*inline "name"}}` block becomes its own
/// partial; a fragment without inline blocks is registered under its name.
///
/// Every block is compiled before any is registered, so a fragment either
/// registers completely or not at all.
fn register_fragment(handlebars: &mut Handlebars<'static>, ext: &Extension) -> Result<(), TemplateError> {
    let mut compiled = Vec::new();
    let blocks = inline_block_pattern()
        .into_iter()
        .flat_map(|re| re.captures_iter(&ext.content));
    for caps in blocks {
        compiled.push((caps[1].to_string(), Template::compile(&caps[2])?));
    }
    if compiled.is_empty() {
        compiled.push((ext.name.clone(), Template::compile(&ext.content)?));
    }

    for (name, template) in compiled {
        debug!(extension = %ext.name, partial = %name, "Registered partial");
        handlebars.register_template(&name, template);
    }
    Ok(())
}

// Function library. Each helper takes its arguments as JSON values and
// pattern-matches their shape instead of failing the render.

type SafeFn = fn(&[&Value]) -> Value;

/// Adapts a plain function to a value-returning helper so it works both as
/// `{{fn a b}}` and inside subexpressions.
struct SafeHelper(SafeFn);

impl HelperDef for SafeHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> Result<ScopedJson<'rc>, RenderError> {
        let args: Vec<&Value> = h.params().iter().map(|p| p.value()).collect();
        Ok(ScopedJson::Derived((self.0)(&args)))
    }
}

fn arg<'a>(args: &[&'a Value], idx: usize) -> &'a Value {
    static NULL: Value = Value::Null;
    args.get(idx).copied().unwrap_or(&NULL)
}

/// Best-effort string conversion.
fn coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn now(args: &[&Value]) -> Value {
    use chrono::format::{Item, StrftimeItems};

    let now = chrono::Utc::now();
    match arg(args, 0) {
        Value::String(format) if !StrftimeItems::new(format).any(|i| matches!(i, Item::Error)) => {
            Value::String(now.format(format).to_string())
        }
        _ => Value::String(now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
    }
}

fn uuid_v4(_: &[&Value]) -> Value {
    Value::String(uuid::Uuid::new_v4().to_string())
}

fn to_json(args: &[&Value]) -> Value {
    match serde_json::to_string(arg(args, 0)) {
        Ok(s) => Value::String(s),
        Err(e) => Value::String(format!("\"error: {e}\"")),
    }
}

fn contains(args: &[&Value]) -> Value {
    let needle = coerce(arg(args, 1));
    let found = match arg(args, 0) {
        Value::Null => false,
        Value::Array(items) => items.iter().any(|item| coerce(item) == needle),
        haystack => coerce(haystack).contains(&needle),
    };
    Value::Bool(found)
}

fn regex_match(args: &[&Value]) -> Value {
    let pattern = coerce(arg(args, 0));
    let value = coerce(arg(args, 1));
    let matched = Regex::new(&pattern)
        .map(|re| re.is_match(&value))
        .unwrap_or(false);
    Value::Bool(matched)
}

fn upper(args: &[&Value]) -> Value {
    Value::String(coerce(arg(args, 0)).to_uppercase())
}

fn lower(args: &[&Value]) -> Value {
    match arg(args, 0) {
        Value::String(s) => Value::String(s.to_lowercase()),
        _ => Value::String("error: not a string".to_string()),
    }
}

fn title(args: &[&Value]) -> Value {
    match arg(args, 0) {
        Value::String(s) => {
            let mut out = String::with_capacity(s.len());
            let mut at_word_start = true;
            for ch in s.chars() {
                if at_word_start && ch.is_alphabetic() {
                    out.extend(ch.to_uppercase());
                } else {
                    out.push(ch);
                }
                at_word_start = !ch.is_alphanumeric();
            }
            Value::String(out)
        }
        _ => Value::String("error: not a string".to_string()),
    }
}

fn trim(args: &[&Value]) -> Value {
    match arg(args, 0) {
        Value::String(s) => Value::String(s.trim().to_string()),
        _ => Value::String("error: not a string".to_string()),
    }
}

fn split(args: &[&Value]) -> Value {
    match (arg(args, 0), arg(args, 1)) {
        (Value::String(s), Value::String(sep)) => Value::Array(
            s.split(sep.as_str())
                .map(|part| Value::String(part.to_string()))
                .collect(),
        ),
        _ => Value::Array(Vec::new()),
    }
}

fn join(args: &[&Value]) -> Value {
    let (Value::Array(items), Value::String(sep)) = (arg(args, 0), arg(args, 1)) else {
        return Value::String("error: expected array of strings".to_string());
    };

    let parts: Option<Vec<&str>> = items.iter().map(Value::as_str).collect();
    match parts {
        Some(parts) => Value::String(parts.join(sep)),
        None => Value::String("error: expected array of strings".to_string()),
    }
}

fn replace(args: &[&Value]) -> Value {
    match (arg(args, 0), arg(args, 1), arg(args, 2)) {
        (Value::String(s), Value::String(old), Value::String(new)) => {
            Value::String(s.replace(old.as_str(), new))
        }
        _ => Value::String("error: invalid args".to_string()),
    }
}

fn len(args: &[&Value]) -> Value {
    let n = match arg(args, 0) {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        _ => 0,
    };
    Value::from(n)
}

fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn default_value(args: &[&Value]) -> Value {
    let value = arg(args, 0);
    if is_zero(value) {
        arg(args, 1).clone()
    } else {
        value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(input: Value, global: Value, registry: &Registry) -> TemplateRuntime {
        let engine = Arc::new(TemplateEngine::new(registry));
        let ctx = merge_context(
            input.as_object().cloned(),
            None,
            global.as_object().cloned(),
        );
        TemplateRuntime::new(engine, ctx)
    }

    fn render(template: &str, input: Value) -> String {
        runtime(input, json!({}), &Registry::new())
            .render("test", template)
            .unwrap()
    }

    #[test]
    fn test_merge_context_always_has_three_keys() {
        let ctx = merge_context(None, None, None);
        assert_eq!(ctx, json!({"input": {}, "session": {}, "context": {}}));
    }

    #[test]
    fn test_context_variables() {
        let rt = runtime(json!({}), json!({"apiVersion": "v2"}), &Registry::new());
        assert_eq!(rt.context()["context"]["apiVersion"], "v2");
        assert_eq!(rt.render("t", "/api/{{context.apiVersion}}/users").unwrap(), "/api/v2/users");
    }

    #[test]
    fn test_extension_partial() {
        let mut reg = Registry::new();
        reg.register("toUpper", "{{upper this}}", "toUpper.kurof");

        let rt = runtime(json!({}), json!({"nombre": "gatito"}), &reg);
        assert_eq!(rt.render("body", "{{> toUpper context.nombre}}").unwrap(), "GATITO");
    }

    #[test]
    fn test_inline_blocks_define_named_partials() {
        let mut reg = Registry::new();
        reg.register(
            "helpers",
            r#"{{#*inline "shout"}}{{upper message}}{{/inline}}
{{#*inline "whisper"}}{{lower message}}{{/inline}}"#,
            "helpers.kurof",
        );

        let rt = runtime(json!({"message": "Hola Mundo"}), json!({}), &reg);
        assert_eq!(rt.render("t", "{{> shout input}}").unwrap(), "HOLA MUNDO");
        assert_eq!(rt.render("t", "{{> whisper input}}").unwrap(), "hola mundo");

        let engine = TemplateEngine::new(&reg);
        assert!(engine.has_partial("shout"));
        assert!(engine.has_partial("whisper"));
        assert!(!engine.has_partial("missing"));
    }

    #[test]
    fn test_extension_override_uses_last_fragment() {
        let mut reg = Registry::new();
        reg.register("same", "a", "a.kurof");
        reg.register("same", "b", "b.kurof");

        let rt = runtime(json!({}), json!({}), &reg);
        assert_eq!(rt.render("t", "{{> same}}").unwrap(), "b");
    }

    #[test]
    fn test_latest_import_defines_shared_inline_name() {
        let mut reg = Registry::new();
        reg.register("a", r#"{{#*inline "x"}}A{{/inline}}"#, "a.kurof");
        reg.register("b", r#"{{#*inline "x"}}B{{/inline}}"#, "b.kurof");
        reg.register("a", r#"{{#*inline "x"}}C{{/inline}}"#, "dir2/a.kurof");

        let rt = runtime(json!({}), json!({}), &reg);
        assert_eq!(rt.render("t", "{{> x}}").unwrap(), "C");
    }

    #[test]
    fn test_broken_fragment_is_skipped() {
        let mut reg = Registry::new();
        reg.register("bad", "{{#if}}", "bad.kurof");
        reg.register("toUpper", "{{upper this}}", "toUpper.kurof");

        let engine = TemplateEngine::new(&reg);
        assert!(!engine.has_partial("bad"));
        assert!(engine.has_partial("toUpper"));

        let rt = runtime(json!({}), json!({"nombre": "gatito"}), &reg);
        assert_eq!(rt.render("body", "{{> toUpper context.nombre}}").unwrap(), "GATITO");
        assert!(rt.render("body", "{{> bad}}").is_err());
    }

    #[test]
    fn test_fragment_with_broken_inline_block_registers_nothing() {
        let mut reg = Registry::new();
        reg.register(
            "mixed",
            r#"{{#*inline "fine"}}ok{{/inline}}{{#*inline "broken"}}{{#each}}{{/inline}}"#,
            "mixed.kurof",
        );

        let engine = TemplateEngine::new(&reg);
        assert!(!engine.has_partial("fine"));
        assert!(!engine.has_partial("broken"));
    }

    #[test]
    fn test_parse_error_is_render_error() {
        let rt = runtime(json!({}), json!({}), &Registry::new());
        assert!(rt.render("t", "{{#if input.x}}unclosed").is_err());
        assert!(rt.render("t", "{{> missingPartial}}").is_err());
    }

    #[test]
    fn test_uuid_and_now() {
        let id = render("{{uuid}}", json!({}));
        assert_eq!(id.len(), 36);
        assert_eq!(id.chars().nth(14), Some('4'));

        let ts = render("{{now}}", json!({}));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());

        let year = render("{{now \"%Y\"}}", json!({}));
        assert_eq!(year.len(), 4);
    }

    #[test]
    fn test_to_json() {
        let out = render("{{toJSON input.user}}", json!({"user": {"name": "ana", "age": 3}}));
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed, json!({"name": "ana", "age": 3}));
    }

    #[test]
    fn test_contains_and_regex_match() {
        assert_eq!(render("{{contains input.cmd \"ping\"}}", json!({"cmd": "ping test"})), "true");
        assert_eq!(render("{{contains input.cmd \"pong\"}}", json!({"cmd": "ping test"})), "false");
        assert_eq!(render("{{contains input.missing \"x\"}}", json!({})), "false");
        assert_eq!(render("{{contains input.n \"4\"}}", json!({"n": 42})), "true");
        assert_eq!(render("{{regexMatch \"^[0-9]+$\" input.id}}", json!({"id": "123"})), "true");
        assert_eq!(render("{{regexMatch \"(\" input.id}}", json!({"id": "123"})), "false");
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(render("{{upper input.n}}", json!({"n": 7})), "7");
        assert_eq!(render("{{lower input.s}}", json!({"s": "ABC"})), "abc");
        assert_eq!(render("{{lower input.n}}", json!({"n": 1})), "error: not a string");
        assert_eq!(render("{{title input.s}}", json!({"s": "hello big world"})), "Hello Big World");
        assert_eq!(render("{{trim input.s}}", json!({"s": "  x  "})), "x");
        assert_eq!(render("{{replace input.s \"a\" \"o\"}}", json!({"s": "banana"})), "bonono");
        assert_eq!(render("{{replace input.s 1 \"o\"}}", json!({"s": "banana"})), "error: invalid args");
    }

    #[test]
    fn test_split_join_len() {
        assert_eq!(render("{{join (split input.s \",\") \"-\"}}", json!({"s": "a,b,c"})), "a-b-c");
        assert_eq!(render("{{len (split input.s \",\")}}", json!({"s": "a,b,c"})), "3");
        assert_eq!(render("{{len (split input.n \",\")}}", json!({"n": 5})), "0");
        assert_eq!(render("{{join input.xs \",\"}}", json!({"xs": [1, 2]})), "error: expected array of strings");
        assert_eq!(render("{{len input.s}}", json!({"s": "hola"})), "4");
        assert_eq!(render("{{len input.m}}", json!({"m": {"a": 1}})), "1");
        assert_eq!(render("{{len input.n}}", json!({"n": 10})), "0");
    }

    #[test]
    fn test_default_helper() {
        assert_eq!(render("{{default input.missing \"anon\"}}", json!({})), "anon");
        assert_eq!(render("{{default input.name \"anon\"}}", json!({"name": ""})), "anon");
        assert_eq!(render("{{default input.name \"anon\"}}", json!({"name": "ana"})), "ana");
        assert_eq!(render("{{default input.count 5}}", json!({"count": 0})), "5");
    }

    #[test]
    fn test_builtin_comparison() {
        assert_eq!(render("{{eq input.cmd \"ping\"}}", json!({"cmd": "ping"})), "true");
        assert_eq!(render("{{eq input.cmd \"ping\"}}", json!({"cmd": "pong"})), "false");
    }

    #[test]
    fn test_rendering_is_idempotent() {
        let rt = runtime(json!({"a": [1, 2]}), json!({"b": "x"}), &Registry::new());
        let template = "{{toJSON input}} {{upper context.b}} {{len input.a}}";
        assert_eq!(rt.render("t", template).unwrap(), rt.render("t", template).unwrap());
    }

    #[test]
    fn test_no_html_escaping() {
        assert_eq!(render("{{input.s}}", json!({"s": "<a href=\"x\">&</a>"})), "<a href=\"x\">&</a>");
    }
}
