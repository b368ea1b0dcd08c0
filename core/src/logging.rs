//! Ambient logging setup (C10): turns `general_logging_config` and
//! `api_logging_config` into a `tracing` subscriber.
//!
//! Grounded on `logs/__init__.py`'s dual general/API logger split (the API
//! logger is scoped to the `mock_requests.*` target emitted by
//! [`crate::logs::ApiLogProcessor`]) and on `config.rs`'s `format_line`
//! placeholder convention (`%(key)s`), reimplemented as a `tracing_subscriber`
//! `Layer` instead of stdlib `logging.Formatter`.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{Config, LoggingConfig, LoggingFormat};
use crate::error::{MockServerError, Result};

const API_LOG_TARGET_PREFIX: &str = "mock_requests";

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldCollector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}").trim_matches('"').to_string();
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.insert(field.name().to_string(), rendered);
        }
    }
}

/// Renders one event through `format_line`, substituting `%(key)s`
/// placeholders. Unrecognized placeholders are left verbatim; they are
/// rejected earlier, at config load time, by `LoggingConfig::validate`.
fn render_text(format_line: &str, level: &Level, target: &str, collected: &FieldCollector) -> String {
    let mut out = format_line.to_string();
    out = out.replace("%(levelname)s", &level.to_string());
    out = out.replace("%(name)s", target);
    out = out.replace("%(asctime)s", &chrono::Local::now().to_rfc3339());
    out = out.replace("%(message)s", &collected.message);
    for (key, value) in &collected.fields {
        out = out.replace(&format!("%({key})s"), value);
    }
    out
}

fn render_yaml(level: &Level, target: &str, collected: &FieldCollector) -> String {
    let mut map = serde_yaml::Mapping::new();
    map.insert("levelname".into(), level.to_string().into());
    map.insert("name".into(), target.into());
    map.insert("message".into(), collected.message.clone().into());
    for (key, value) in &collected.fields {
        map.insert(key.clone().into(), value.clone().into());
    }
    serde_yaml::to_string(&serde_yaml::Value::Mapping(map)).unwrap_or_default()
}

enum Sink {
    Console,
    File(Mutex<std::fs::File>),
}

impl Sink {
    fn write(&self, line: &str) {
        match self {
            Sink::Console => eprintln!("{line}"),
            Sink::File(file) => {
                use std::io::Write;
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{line}");
                }
            }
        }
    }
}

/// One `tracing_subscriber::Layer` per `LoggingConfig`: renders matching
/// events through `format_line`/`format` and writes them to every configured
/// sink (console and/or files).
struct ConfiguredLayer {
    config: LoggingConfig,
    target_prefix: Option<&'static str>,
    sinks: Vec<Sink>,
}

impl ConfiguredLayer {
    fn new(config: LoggingConfig, target_prefix: Option<&'static str>) -> Result<Self> {
        let mut sinks = Vec::new();
        if config.console {
            sinks.push(Sink::Console);
        }
        for path in &config.files {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(MockServerError::Io)?;
            sinks.push(Sink::File(Mutex::new(file)));
        }
        Ok(ConfiguredLayer { config, target_prefix, sinks })
    }
}

impl<S> Layer<S> for ConfiguredLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let target = event.metadata().target();
        match self.target_prefix {
            Some(prefix) if !target.starts_with(prefix) => return,
            None if target.starts_with(API_LOG_TARGET_PREFIX) => return,
            _ => {}
        }
        if *event.metadata().level() > self.config.level.to_tracing_level() {
            return;
        }

        let mut collected = FieldCollector::default();
        event.record(&mut collected);

        let line = match self.config.format {
            LoggingFormat::Text => render_text(&self.config.format_line, event.metadata().level(), target, &collected),
            LoggingFormat::Yaml => render_yaml(event.metadata().level(), target, &collected),
        };
        for sink in &self.sinks {
            sink.write(&line);
        }
    }
}

/// Installs the global `tracing` subscriber from a loaded [`Config`]. Must be
/// called once, before any other part of the process emits through `tracing`.
pub fn init(config: &Config) -> Result<()> {
    let general = ConfiguredLayer::new(config.general_logging_config.clone(), None)?;
    let api = ConfiguredLayer::new(config.api_logging_config.clone(), Some(API_LOG_TARGET_PREFIX))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let general_level = config.general_logging_config.level.to_tracing_level();
        let api_level = config.api_logging_config.level.to_tracing_level();
        let max = general_level.max(api_level);
        EnvFilter::new(max.to_string())
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(general)
        .with(api)
        .try_init()
        .map_err(|e| MockServerError::ConfigLoad(format!("logging setup failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_render_substitutes_known_placeholders() {
        let mut collected = FieldCollector::default();
        collected.message = "hello".to_string();
        collected.fields.insert("alias".to_string(), "Book API".to_string());
        let line = render_text("%(levelname)s: %(message)s (%(alias)s)", &Level::INFO, "mock_requests", &collected);
        assert_eq!(line, "INFO: hello (Book API)");
    }

    #[test]
    fn yaml_render_includes_message_and_fields() {
        let mut collected = FieldCollector::default();
        collected.message = "input message".to_string();
        collected.fields.insert("service".to_string(), "book.BookService".to_string());
        let rendered = render_yaml(&Level::INFO, "mock_requests.book.BookService.GetBook", &collected);
        assert!(rendered.contains("service: book.BookService"));
        assert!(rendered.contains("message: input message"));
    }
}
