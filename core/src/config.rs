//! Process configuration model: the YAML shape accepted via `-c <config.yml>`.
//!
//! Grounded on the original tool's `config/model.py` / `config/validators.py`.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static RPC_HEADER_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9\-_.]{1,256}$").expect("header key regex is valid"));
static RPC_HEADER_VALUE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9\-_.]{0,8192}$").expect("header value regex is valid"));

/// Placeholders a `format_line` is allowed to reference, beyond the standard
/// log record attributes (`levelname`, `name`, `asctime`, ...).
pub const ALLOWED_LOGGING_KEYS: &[&str] = &[
    "alias",
    "code",
    "error_details",
    "message",
    "metadata",
    "method",
    "request_message",
    "response_message",
    "service",
    "timestamp",
];

pub fn validate_metadata_key(key: &str) -> std::result::Result<(), String> {
    if RPC_HEADER_KEY_PATTERN.is_match(key) {
        Ok(())
    } else {
        Err(format!(
            "gRPC metadata key '{key}' should contain only lowercase latin symbols, \
             numbers and symbols -_. with length 1-256"
        ))
    }
}

pub fn validate_metadata_value(value: &str) -> std::result::Result<(), String> {
    if RPC_HEADER_VALUE_PATTERN.is_match(value) {
        Ok(())
    } else {
        Err(format!(
            "gRPC metadata value '{value}' should contain only lowercase latin symbols, \
             numbers and symbols -_. with length 0-8192"
        ))
    }
}

pub fn validate_error_status_code(value: i32) -> std::result::Result<(), String> {
    if (1..=16).contains(&value) {
        Ok(())
    } else {
        Err(format!(
            "gRPC error status code should be from 1 to 16, got {value}"
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CertificatesConfig {
    pub certificate: String,
    pub key_file: String,
    pub root_certificate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SocketConfig {
    pub socket: String,
    #[serde(default)]
    pub certificates: Option<CertificatesConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoggingLevel {
    Critical,
    Fatal,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl LoggingLevel {
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            LoggingLevel::Critical | LoggingLevel::Fatal | LoggingLevel::Error => {
                tracing::Level::ERROR
            }
            LoggingLevel::Warning => tracing::Level::WARN,
            LoggingLevel::Info => tracing::Level::INFO,
            LoggingLevel::Debug => tracing::Level::DEBUG,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFormat {
    #[default]
    Text,
    Yaml,
}

fn default_format_line() -> String {
    "%(message)s".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub console: bool,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub level: LoggingLevel,
    #[serde(default)]
    pub format: LoggingFormat,
    #[serde(default = "default_format_line")]
    pub format_line: String,
}

impl LoggingConfig {
    pub fn general_default() -> Self {
        LoggingConfig {
            console: true,
            files: vec![],
            level: LoggingLevel::Info,
            format: LoggingFormat::Text,
            format_line: "%(levelname)s: %(message)s".to_string(),
        }
    }

    pub fn api_default() -> Self {
        LoggingConfig {
            console: true,
            files: vec![],
            level: LoggingLevel::Info,
            format: LoggingFormat::Yaml,
            format_line: "%(message)s %(request_message)s %(response_message)s %(method)s \
                          %(service)s %(code)s %(error_details)s %(metadata)s %(alias)s \
                          %(timestamp)s"
                .to_string(),
        }
    }

    /// Placeholders referenced by `format_line`, e.g. `["message", "alias"]`.
    pub fn referenced_keys(&self) -> Vec<String> {
        static PATTERN: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"%\(([^)]+)\)s").expect("format line regex is valid"));
        PATTERN
            .captures_iter(&self.format_line)
            .map(|c| c[1].to_string())
            .collect()
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        let standard_keys = ["levelname", "name", "asctime", "created", "msg"];
        for key in self.referenced_keys() {
            if !ALLOWED_LOGGING_KEYS.contains(&key.as_str()) && !standard_keys.contains(&key.as_str())
            {
                return Err(format!(
                    "logging key '{key}' is not allowed. Allowed keys: {}",
                    ALLOWED_LOGGING_KEYS.join(", ")
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorConfig {
    /// Integer status code (1..16) or a template string rendering to one.
    #[serde(default = "default_error_code")]
    pub code: serde_json::Value,
    #[serde(default)]
    pub details: String,
}

fn default_error_code() -> serde_json::Value {
    serde_json::Value::from(2) // StatusCode.UNKNOWN
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub socket: String,
    #[serde(default)]
    pub seconds_timeout: Option<serde_json::Value>,
}

/// The raw, possibly-templated mock configuration for one method.
///
/// Every field may be the raw structure or a string that renders to YAML of
/// that structure (see the mock materializer, §4.4 of the specification).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResponseMockConfig {
    #[serde(default)]
    pub messages: serde_json::Value,
    #[serde(default)]
    pub trailing_meta: serde_json::Value,
    #[serde(default)]
    pub error: Option<ErrorConfig>,
    #[serde(default)]
    pub seconds_delay: Option<serde_json::Value>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

/// Value accepted under `mocks.<service>.<method>`: a structured config, a
/// bare template string (rendering to the config's YAML), or null/absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MockTarget {
    Structured(ResponseMockConfig),
    Templated(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    pub alias: String,
    pub sockets: Vec<SocketConfig>,
    #[serde(default = "default_true")]
    pub reflection_enabled: bool,
    pub proto_files: ProtoFilesEntry,
    #[serde(default)]
    pub proto_files_base_dir: Option<String>,
    #[serde(default)]
    pub mocks: HashMap<String, HashMap<String, Option<MockTarget>>>,
}

fn default_true() -> bool {
    true
}

/// `proto_files` accepts either a bare string or a list of strings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum ProtoFilesEntry {
    #[default]
    Empty,
    Single(String),
    Many(Vec<String>),
}

impl ProtoFilesEntry {
    pub fn as_patterns(&self) -> Vec<String> {
        match self {
            ProtoFilesEntry::Empty => vec![],
            ProtoFilesEntry::Single(s) => vec![s.clone()],
            ProtoFilesEntry::Many(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
    #[serde(default = "LoggingConfig::general_default")]
    pub general_logging_config: LoggingConfig,
    #[serde(default = "LoggingConfig::api_default")]
    pub api_logging_config: LoggingConfig,
}

impl Config {
    pub fn from_yaml(raw: &str) -> crate::error::Result<Config> {
        let config: Config = serde_yaml::from_str(raw)
            .map_err(|e| crate::error::MockServerError::ConfigLoad(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        use crate::error::MockServerError;

        self.general_logging_config
            .validate()
            .map_err(MockServerError::ConfigLoad)?;
        self.api_logging_config
            .validate()
            .map_err(MockServerError::ConfigLoad)?;

        for server in &self.servers {
            for (_service, methods) in &server.mocks {
                for (_method, target) in methods {
                    if let Some(MockTarget::Structured(cfg)) = target {
                        for (key, value) in json_object_entries(&cfg.trailing_meta) {
                            validate_metadata_key(&key).map_err(MockServerError::ConfigLoad)?;
                            if let Some(s) = value.as_str() {
                                validate_metadata_value(s).map_err(MockServerError::ConfigLoad)?;
                            }
                        }
                        if let Some(err) = &cfg.error {
                            if let Some(code) = err.code.as_i64() {
                                validate_error_status_code(code as i32)
                                    .map_err(MockServerError::ConfigLoad)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn json_object_entries(value: &serde_json::Value) -> Vec<(String, serde_json::Value)> {
    match value.as_object() {
        Some(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        None => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_key_validation() {
        assert!(validate_metadata_key("custom-header.1").is_ok());
        assert!(validate_metadata_key("Custom-Header").is_err());
        assert!(validate_metadata_key("").is_err());
    }

    #[test]
    fn error_code_range() {
        assert!(validate_error_status_code(1).is_ok());
        assert!(validate_error_status_code(16).is_ok());
        assert!(validate_error_status_code(0).is_err());
        assert!(validate_error_status_code(17).is_err());
    }

    #[test]
    fn logging_config_rejects_unknown_placeholder() {
        let mut cfg = LoggingConfig::general_default();
        cfg.format_line = "%(totally_unknown)s".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn logging_config_accepts_closed_set() {
        let cfg = LoggingConfig::api_default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn proto_files_entry_accepts_string_or_list() {
        let single: ProtoFilesEntry = serde_yaml::from_str("\"a.proto\"").unwrap();
        assert_eq!(single.as_patterns(), vec!["a.proto".to_string()]);

        let many: ProtoFilesEntry = serde_yaml::from_str("[\"a.proto\", \"b.proto\"]").unwrap();
        assert_eq!(
            many.as_patterns(),
            vec!["a.proto".to_string(), "b.proto".to_string()]
        );
    }

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
servers:
  - alias: "Book API"
    sockets:
      - socket: "localhost:8100"
    proto_files: "book.proto"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].alias, "Book API");
        assert!(config.servers[0].reflection_enabled);
    }
}
