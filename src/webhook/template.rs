//! Webhook body templates.
//!
//! Bodies are written with field references such as `{{.Kind.Name}}` and are
//! evaluated against the event's JSON form. References are translated to
//! handlebars paths before rendering; output is never HTML-escaped.

use std::sync::OnceLock;

use handlebars::Handlebars;
use regex::Regex;
use serde_json::Value;

use crate::error::{Result, TsuruError};

fn field_ref() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{-?\s*\.([A-Za-z0-9_.]*)\s*-?\}\}").ok())
        .as_ref()
}

/// `{{.A.B}}` -> `{{A.B}}`, `{{.}}` -> `{{this}}`. Anything else is kept.
pub fn to_handlebars(body: &str) -> String {
    let Some(re) = field_ref() else {
        return body.to_string();
    };
    re.replace_all(body, |caps: &regex::Captures<'_>| {
        let path = caps.get(1).map_or("", |m| m.as_str()).trim_end_matches('.');
        if path.is_empty() {
            "{{this}}".to_string()
        } else {
            format!("{{{{{path}}}}}")
        }
    })
    .into_owned()
}

pub struct BodyRenderer {
    handlebars: Handlebars<'static>,
}

impl Default for BodyRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyRenderer {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        // A reference to a missing field fails instead of rendering "".
        handlebars.set_strict_mode(true);
        Self { handlebars }
    }

    pub fn render(&self, body: &str, data: &Value) -> Result<String> {
        self.handlebars
            .render_template(&to_handlebars(body), data)
            .map_err(|e| TsuruError::Template(e.to_string()))
    }

    /// Renders `body`, or returns it unchanged when it cannot be rendered.
    pub fn render_or_literal(&self, name: &str, body: &str, data: &Value) -> String {
        match self.render(body, data) {
            Ok(rendered) => rendered,
            Err(e) => {
                tracing::warn!(
                    webhook = %name,
                    error = %e,
                    "[webhooks] unable to render hook body as template, using raw string"
                );
                body.to_string()
            }
        }
    }
}
