//! API Log Processor (C8): structured, per-call request/response logging.
//!
//! Grounded on `server/processors/logs.py`'s `APILogProcessor` and
//! `logs/__init__.py`'s logger-naming convention, reimplemented on top of
//! `tracing` spans/events instead of the stdlib `logging` module.

use std::collections::HashMap;

use tonic::metadata::MetadataMap;
use tonic::Status;

const REQUESTS_MOCK_LOG_TARGET: &str = "mock_requests";

fn logger_name(service_full_name: &str, method_name: &str) -> String {
    format!("{REQUESTS_MOCK_LOG_TARGET}.{service_full_name}.{method_name}")
}

/// Flattens a metadata map into `key -> value | [values]`, matching
/// `extract_invocation_metadata`'s merge-repeated-keys behaviour.
pub fn flatten_metadata(metadata: &MetadataMap) -> HashMap<String, serde_json::Value> {
    let mut result: HashMap<String, serde_json::Value> = HashMap::new();
    for key_and_value in metadata.iter() {
        let (key, value) = match key_and_value {
            tonic::metadata::KeyAndValueRef::Ascii(k, v) => {
                (k.as_str().to_string(), v.to_str().unwrap_or("").to_string())
            }
            tonic::metadata::KeyAndValueRef::Binary(k, v) => {
                (k.as_str().to_string(), format!("{v:?}"))
            }
        };
        result
            .entry(key)
            .and_modify(|existing| match existing {
                serde_json::Value::Array(items) => items.push(serde_json::Value::String(value.clone())),
                other => {
                    let prev = other.clone();
                    *other = serde_json::Value::Array(vec![prev, serde_json::Value::String(value.clone())]);
                }
            })
            .or_insert_with(|| serde_json::Value::String(value));
    }
    result
}

/// Emits structured logs for one method invocation, tagged with the
/// service/method/server alias throughout (§4's "alias" field).
pub struct ApiLogProcessor {
    alias: String,
}

impl ApiLogProcessor {
    pub fn new(alias: impl Into<String>) -> Self {
        ApiLogProcessor { alias: alias.into() }
    }

    pub fn log_request_message(&self, service: &str, method: &str, request: &serde_json::Value) {
        tracing::info!(
            target: "mock_requests",
            logger = %logger_name(service, method),
            service,
            method,
            alias = %self.alias,
            request_message = %request,
            "input message",
        );
    }

    pub fn log_invocation_metadata(&self, service: &str, method: &str, metadata: &MetadataMap) {
        let flattened = flatten_metadata(metadata);
        if flattened.is_empty() {
            return;
        }
        tracing::info!(
            target: "mock_requests",
            logger = %logger_name(service, method),
            service,
            method,
            alias = %self.alias,
            metadata = %serde_json::to_string(&flattened).unwrap_or_default(),
            "invocation metadata",
        );
    }

    /// Logs a successfully produced response message. Pass `tonic::Code::Ok`
    /// for the ordinary case; there is no error detail to report.
    pub fn log_response_message(
        &self,
        service: &str,
        method: &str,
        response: Option<&serde_json::Value>,
        code: tonic::Code,
    ) {
        let response_str = response.map(|r| r.to_string()).unwrap_or_default();
        tracing::info!(
            target: "mock_requests",
            logger = %logger_name(service, method),
            service,
            method,
            alias = %self.alias,
            response_message = %response_str,
            code = %format!("{}: {code:?}", code as i32),
            "output message",
        );
    }

    /// Logs an erroring call outcome, mirroring `log_res_error`.
    pub fn log_response_error(&self, service: &str, method: &str, status: &Status) {
        let code = format!("{}: {:?}", status.code() as i32, status.code());
        tracing::info!(
            target: "mock_requests",
            logger = %logger_name(service, method),
            service,
            method,
            alias = %self.alias,
            error_details = %status.message(),
            code = %code,
            "output error",
        );
    }

    pub fn log_trailing_metadata(&self, service: &str, method: &str, metadata: &MetadataMap) {
        let flattened = flatten_metadata(metadata);
        if flattened.is_empty() {
            return;
        }
        tracing::info!(
            target: "mock_requests",
            logger = %logger_name(service, method),
            service,
            method,
            alias = %self.alias,
            metadata = %serde_json::to_string(&flattened).unwrap_or_default(),
            "trailing metadata",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_name_joins_with_prefix() {
        assert_eq!(
            logger_name("book.BookService", "GetBook"),
            "mock_requests.book.BookService.GetBook"
        );
    }

    #[test]
    fn flatten_metadata_merges_repeated_keys() {
        let mut map = MetadataMap::new();
        map.append("x-trace", "a".parse().unwrap());
        map.append("x-trace", "b".parse().unwrap());
        let flattened = flatten_metadata(&map);
        assert_eq!(
            flattened.get("x-trace"),
            Some(&serde_json::json!(["a", "b"]))
        );
    }
}
