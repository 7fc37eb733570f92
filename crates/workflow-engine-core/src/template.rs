//! # Template Engine
//!
//! Jinja2-style resolution (`{{ expr }}` substitution, `{% if/for/set %}` control flow)
//! over a namespaced [`crate::context::Context`], implemented on top of `handlebars`.
//! Handlebars' block helpers (`{{#if}}` / `{{#each}}`) stand in for Jinja2's
//! `{% if %}` / `{% for %}` tokens; this engine implements Jinja2-like *semantics*,
//! not the literal Jinja2 syntax.
//!
//! Strict mode is always on: an undefined variable is a [`TemplateError`], never a
//! silently-empty string, and the error enumerates every namespace's available keys.

use handlebars::Handlebars;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::TemplateError;

static TEMPLATE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_.]*)").unwrap());

/// Returns true if `s` contains anything that looks like a template marker
/// (`{{` or `{%`, including handlebars' own `{{#`/`{{/` block syntax).
pub fn looks_like_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

#[derive(Debug)]
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        register_filters(&mut handlebars);
        Self { handlebars }
    }

    /// Renders a single template string against `root`. `root` is normally
    /// [`crate::context::Context::to_render_root`].
    pub fn render(&self, template: &str, root: &Value) -> Result<String, TemplateError> {
        self.handlebars
            .render_template(template, root)
            .map_err(|e| self.enrich_error(template, root, e))
    }

    /// Walks `value` structurally: strings
    /// containing template markers are rendered, other scalars pass through
    /// unchanged, and mappings/sequences are recursed into.
    pub fn process_value(&self, value: &Value, root: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) if looks_like_template(s) => {
                Ok(Value::String(self.render(s, root)?))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.process_value(item, root)?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.process_value(v, root)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn enrich_error(&self, template: &str, root: &Value, e: handlebars::RenderError) -> TemplateError {
        let message = e.to_string();
        if message.contains("not found") || message.contains("Variable") {
            let expr = TEMPLATE_TOKEN
                .captures(template)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| template.to_string());
            TemplateError::Undefined {
                expr,
                available: available_namespaces(root),
            }
        } else {
            TemplateError::RenderError { message }
        }
    }
}

fn available_namespaces(root: &Value) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    if let Value::Object(top) = root {
        for (namespace, value) in top {
            let keys = match value {
                Value::Object(inner) => {
                    let mut keys: Vec<String> = inner.keys().cloned().collect();
                    keys.sort();
                    keys
                }
                _ => Vec::new(),
            };
            map.insert(namespace.clone(), keys);
        }
    }
    map
}

/// Registers the stock filter set: `default`, `upper`, `lower`, `trim`,
/// `length`, `join`, `tojson`, `truncate`, `string`.
fn register_filters(handlebars: &mut Handlebars) {
    handlebars.register_helper("default", Box::new(default_helper));
    handlebars.register_helper("upper", Box::new(upper_helper));
    handlebars.register_helper("lower", Box::new(lower_helper));
    handlebars.register_helper("trim", Box::new(trim_helper));
    handlebars.register_helper("length", Box::new(length_helper));
    handlebars.register_helper("join", Box::new(join_helper));
    handlebars.register_helper("tojson", Box::new(tojson_helper));
    handlebars.register_helper("truncate", Box::new(truncate_helper));
    handlebars.register_helper("string", Box::new(string_helper));
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

handlebars::handlebars_helper!(default_helper: |v: Value, fallback: Value| {
    if v.is_null() { fallback } else { v }
});

handlebars::handlebars_helper!(upper_helper: |v: Value| value_to_display(&v).to_uppercase());

handlebars::handlebars_helper!(lower_helper: |v: Value| value_to_display(&v).to_lowercase());

handlebars::handlebars_helper!(trim_helper: |v: Value| value_to_display(&v).trim().to_string());

handlebars::handlebars_helper!(length_helper: |v: Value| {
    match &v {
        Value::Array(a) => a.len() as i64,
        Value::Object(o) => o.len() as i64,
        Value::String(s) => s.chars().count() as i64,
        Value::Null => 0,
        _ => 1,
    }
});

handlebars::handlebars_helper!(join_helper: |v: Value, sep: String| {
    match &v {
        Value::Array(items) => items.iter().map(value_to_display).collect::<Vec<_>>().join(&sep),
        other => value_to_display(other),
    }
});

handlebars::handlebars_helper!(tojson_helper: |v: Value| {
    serde_json::to_string(&v).unwrap_or_default()
});

handlebars::handlebars_helper!(truncate_helper: |v: Value, max_len: i64| {
    let s = value_to_display(&v);
    let max_len = max_len.max(0) as usize;
    if s.chars().count() <= max_len {
        s
    } else {
        s.chars().take(max_len).collect::<String>()
    }
});

handlebars::handlebars_helper!(string_helper: |v: Value| value_to_display(&v));
