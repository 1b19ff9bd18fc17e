//! Command template rendering.
//!
//! Runbook commands are Handlebars templates rendered against the alert.
//! Only values made of a conservative character set are exposed to the
//! templates; anything else is left out of the context so that strict mode
//! fails the render instead of interpolating it into a shell command.

use handlebars::Handlebars;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use thiserror::Error;

use crate::registry::RunbookDefinition;
use crate::types::Alert;

static SAFE_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_./:@=-]+$").unwrap());

/// Rendering errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("runbook {runbook}: failed to render {template:?}: {message}")]
    Render {
        runbook: String,
        template: String,
        message: String,
    },
}

/// Renders runbook commands for a specific alert.
pub struct CommandRenderer {
    handlebars: Handlebars<'static>,
}

impl Default for CommandRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRenderer {
    #[must_use]
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    /// Whether a value may be interpolated into a command.
    #[must_use]
    pub fn is_safe_value(value: &str) -> bool {
        SAFE_VALUE.is_match(value)
    }

    /// Template context: safe alert labels plus the alert's identifiers.
    fn context(alert: &Alert) -> Value {
        let mut map = Map::new();
        for (key, value) in &alert.labels {
            if Self::is_safe_value(value) {
                map.insert(key.clone(), Value::String(value.clone()));
            }
        }
        for (key, value) in [
            ("alert_id", &alert.id),
            ("host_id", &alert.host_id),
            ("metric", &alert.metric),
        ] {
            if Self::is_safe_value(value) {
                map.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        Value::Object(map)
    }

    /// Render every command of `runbook`, in order.
    pub fn render(
        &self,
        runbook: &RunbookDefinition,
        alert: &Alert,
    ) -> Result<Vec<String>, TemplateError> {
        let context = Self::context(alert);
        runbook
            .commands
            .iter()
            .map(|command| {
                self.handlebars
                    .render_template(&command.template, &context)
                    .map(|rendered| rendered.trim().to_string())
                    .map_err(|e| TemplateError::Render {
                        runbook: runbook.id.clone(),
                        template: command.template.clone(),
                        message: e.to_string(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RunbookRegistry;
    use crate::types::{AlertStatus, Comparison};
    use chrono::Utc;
    use std::collections::HashMap;

    fn service_alert(service: &str) -> Alert {
        Alert {
            id: "a-7".to_string(),
            host_id: "web-01".to_string(),
            metric: "service_down".to_string(),
            severity: "critical".to_string(),
            status: AlertStatus::Firing,
            value: Some(1.0),
            threshold: Some(1.0),
            comparison: Comparison::Above,
            message: String::new(),
            labels: HashMap::from([("service".to_string(), service.to_string())]),
            fired_at: Utc::now(),
        }
    }

    #[test]
    fn test_renders_label_values() {
        let registry = RunbookRegistry::builtin().unwrap();
        let runbook = registry.lookup("service_restart").unwrap();
        let commands = CommandRenderer::new()
            .render(&runbook, &service_alert("nginx.service"))
            .unwrap();
        assert_eq!(
            commands,
            vec!["systemctl restart nginx.service", "systemctl is-active nginx.service"]
        );
    }

    #[test]
    fn test_unsafe_label_fails_render() {
        let registry = RunbookRegistry::builtin().unwrap();
        let runbook = registry.lookup("service_restart").unwrap();
        let err = CommandRenderer::new()
            .render(&runbook, &service_alert("nginx; rm -rf /"))
            .unwrap_err();
        assert!(matches!(err, TemplateError::Render { .. }));
    }

    #[test]
    fn test_missing_label_fails_render() {
        let registry = RunbookRegistry::builtin().unwrap();
        let runbook = registry.lookup("service_restart").unwrap();
        let mut alert = service_alert("nginx");
        alert.labels.clear();
        assert!(CommandRenderer::new().render(&runbook, &alert).is_err());
    }

    #[test]
    fn test_plain_commands_pass_through() {
        let registry = RunbookRegistry::builtin().unwrap();
        let runbook = registry.lookup("disk_cleanup").unwrap();
        let commands = CommandRenderer::new()
            .render(&runbook, &service_alert("x"))
            .unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[2], "apt-get clean");
    }

    #[test]
    fn test_safe_value_charset() {
        assert!(CommandRenderer::is_safe_value("postgresql@14-main"));
        assert!(!CommandRenderer::is_safe_value("a b"));
        assert!(!CommandRenderer::is_safe_value("$(id)"));
        assert!(!CommandRenderer::is_safe_value(""));
    }
}
