//! Request Pipeline (C7): per-call orchestration wiring the template engine,
//! mock materializer, proxy cache, and API log processor together.
//!
//! Grounded on `server/processors/__init__.py`'s `ResponseProcessor`
//! (`process_request`, `process_unary_response`, `process_stream_response`)
//! and `server/processors/templates.py`'s `TemplateProcessor.render_mock_config`.

use std::sync::Arc;
use std::time::Duration;

use prost_reflect::DynamicMessage;
use serde_json::Value as JsonValue;
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::config::{MockTarget, ProxyConfig, ResponseMockConfig};
use crate::logs::{flatten_metadata, ApiLogProcessor};
use crate::mock::{build_trailing_metadata, materialize_service_message, merge_response_values};
use crate::proto::{MethodData, ServiceData};
use crate::proxy::ProxyCache;
use crate::registry::{grpc_status_code, TypeRegistry};
use crate::template::{MethodState, TemplateEngine};

fn message_to_json(message: &DynamicMessage) -> JsonValue {
    serde_json::to_value(message).unwrap_or(JsonValue::Null)
}

fn default_mock_config(method: &MethodData) -> MockTarget {
    let messages = if method.output_message.streaming {
        JsonValue::Array(vec![])
    } else {
        JsonValue::Object(Default::default())
    };
    MockTarget::Structured(ResponseMockConfig {
        messages,
        ..Default::default()
    })
}

/// A rendered, fully-resolved mock for one call. Identical shape to
/// `ResponseMockConfig` but with every template string already evaluated.
struct RenderedMock {
    messages: JsonValue,
    trailing_meta: JsonValue,
    error: Option<(i32, String)>,
    seconds_delay: Option<f64>,
    proxy: Option<ProxyConfig>,
}

/// Owns everything needed to answer calls for one method: the shared
/// descriptor registry, template engine, proxy cache and log processor, plus
/// this method's own mock configuration and persistent state slot.
pub struct MethodPipeline {
    registry: Arc<TypeRegistry>,
    templates: Arc<TemplateEngine>,
    proxy: Arc<ProxyCache>,
    logs: Arc<ApiLogProcessor>,
    service: ServiceData,
    method: MethodData,
    mock_config: MockTarget,
    state: MethodState,
}

impl MethodPipeline {
    pub fn new(
        registry: Arc<TypeRegistry>,
        templates: Arc<TemplateEngine>,
        proxy: Arc<ProxyCache>,
        logs: Arc<ApiLogProcessor>,
        service: ServiceData,
        method: MethodData,
        mock_config: Option<MockTarget>,
    ) -> Self {
        let mock_config = mock_config.unwrap_or_else(|| default_mock_config(&method));
        MethodPipeline {
            registry,
            templates,
            proxy,
            logs,
            service,
            method,
            mock_config,
            state: MethodState::default(),
        }
    }

    fn service_name(&self) -> &str {
        &self.service.full_name
    }

    fn method_name(&self) -> &str {
        &self.method.name
    }

    fn base_context(&self, invocation_metadata: &MetadataMap, requests: &[JsonValue]) -> JsonValue {
        serde_json::json!({
            "metadata": flatten_metadata(invocation_metadata),
            "messages": requests,
            "message": requests.first().cloned().unwrap_or(JsonValue::Null),
        })
    }

    fn render_scalar_number(&self, value: &JsonValue, context: &JsonValue) -> Option<f64> {
        match value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => self
                .templates
                .render_scalar_str(s, context, &self.state)
                .ok()
                .and_then(|rendered| rendered.parse::<f64>().ok()),
            _ => None,
        }
    }

    fn render_mock(&self, context: &JsonValue) -> RenderedMock {
        match &self.mock_config {
            MockTarget::Templated(src) => {
                let parsed = self
                    .templates
                    .render_yaml_str(src, context, &self.state)
                    .unwrap_or(JsonValue::Null);
                RenderedMock {
                    messages: parsed.get("messages").cloned().unwrap_or(JsonValue::Null),
                    trailing_meta: parsed
                        .get("trailing_meta")
                        .cloned()
                        .unwrap_or(JsonValue::Null),
                    error: parsed.get("error").and_then(|e| {
                        let code = e.get("code").and_then(JsonValue::as_i64).unwrap_or(2) as i32;
                        let details = e
                            .get("details")
                            .and_then(JsonValue::as_str)
                            .unwrap_or("")
                            .to_string();
                        Some((code, details))
                    }),
                    seconds_delay: parsed.get("seconds_delay").and_then(JsonValue::as_f64),
                    proxy: parsed.get("proxy").and_then(|p| {
                        Some(ProxyConfig {
                            socket: p.get("socket")?.as_str()?.to_string(),
                            seconds_timeout: p.get("seconds_timeout").cloned(),
                        })
                    }),
                }
            }
            MockTarget::Structured(cfg) => {
                let messages = match &cfg.messages {
                    JsonValue::String(s) => self
                        .templates
                        .render_yaml_str(s, context, &self.state)
                        .unwrap_or(JsonValue::Null),
                    other => self
                        .templates
                        .render_json(other, context, &self.state)
                        .unwrap_or_else(|_| other.clone()),
                };

                let trailing_meta = match &cfg.trailing_meta {
                    JsonValue::String(s) => self
                        .templates
                        .render_yaml_str(s, context, &self.state)
                        .unwrap_or(JsonValue::Null),
                    other => self
                        .templates
                        .render_json(other, context, &self.state)
                        .unwrap_or_else(|_| other.clone()),
                };

                let error = cfg.error.as_ref().map(|e| {
                    let code = self
                        .render_scalar_number(&e.code, context)
                        .unwrap_or(2.0) as i32;
                    let details = self
                        .templates
                        .render_scalar_str(&e.details, context, &self.state)
                        .unwrap_or_default();
                    (code, details)
                });

                let seconds_delay = cfg
                    .seconds_delay
                    .as_ref()
                    .and_then(|v| self.render_scalar_number(v, context));

                let proxy = cfg.proxy.as_ref().map(|p| ProxyConfig {
                    socket: self
                        .templates
                        .render_scalar_str(&p.socket, context, &self.state)
                        .unwrap_or_else(|_| p.socket.clone()),
                    seconds_timeout: p.seconds_timeout.as_ref().map(|v| {
                        self.render_scalar_number(v, context)
                            .map(JsonValue::from)
                            .unwrap_or_else(|| v.clone())
                    }),
                });

                RenderedMock {
                    messages,
                    trailing_meta,
                    error,
                    seconds_delay,
                    proxy,
                }
            }
        }
    }

    fn log_requests(&self, requests: &[JsonValue]) {
        for request in requests {
            self.logs
                .log_request_message(self.service_name(), self.method_name(), request);
        }
    }

    async fn apply_delay(&self, rendered: &RenderedMock) {
        if let Some(seconds) = rendered.seconds_delay {
            if seconds > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            }
        }
    }

    /// Handles a call whose output is a single message. `requests` has
    /// already been fully collected (client-streaming input is consumed
    /// ahead of time by the caller).
    pub async fn process_unary(
        &self,
        requests: Vec<DynamicMessage>,
        invocation_metadata: MetadataMap,
    ) -> Result<(DynamicMessage, MetadataMap), Status> {
        self.logs
            .log_invocation_metadata(self.service_name(), self.method_name(), &invocation_metadata);
        let request_jsons: Vec<JsonValue> = requests.iter().map(message_to_json).collect();
        self.log_requests(&request_jsons);

        let context = self.base_context(&invocation_metadata, &request_jsons);
        let rendered = self.render_mock(&context);
        self.apply_delay(&rendered).await;

        let mock_value = if rendered.messages.is_null() {
            None
        } else {
            Some(rendered.messages.clone())
        };

        let (response_value, mut trailing) = if let Some(proxy) = &rendered.proxy {
            let request = requests.into_iter().next();
            match request {
                None => (mock_value, MetadataMap::new()),
                Some(request) => {
                    match self
                        .proxy
                        .call_unary(
                            &self.registry,
                            proxy,
                            self.service_name(),
                            self.method_name(),
                            &self.method.input_message.name,
                            &self.method.output_message.name,
                            request,
                            invocation_metadata,
                        )
                        .await
                    {
                        Ok((proxied, proxy_trailing)) => {
                            let proxied_json = message_to_json(&proxied);
                            let merged =
                                merge_response_values(mock_value.as_ref(), Some(&proxied_json));
                            (merged, proxy_trailing)
                        }
                        Err(status) => {
                            self.logs.log_trailing_metadata(
                                self.service_name(),
                                self.method_name(),
                                status.metadata(),
                            );
                            self.logs
                                .log_response_error(self.service_name(), self.method_name(), &status);
                            return Err(status);
                        }
                    }
                }
            }
        } else {
            (mock_value, MetadataMap::new())
        };

        if let Ok(rendered_trailing) = build_trailing_metadata(&rendered.trailing_meta) {
            for kv in rendered_trailing.iter() {
                append_metadata_entry(&mut trailing, kv);
            }
        }

        if let Some((code, details)) = &rendered.error {
            self.logs
                .log_trailing_metadata(self.service_name(), self.method_name(), &trailing);
            let mut status = Status::new(grpc_status_code(*code), details.clone());
            *status.metadata_mut() = trailing;
            self.logs
                .log_response_error(self.service_name(), self.method_name(), &status);
            return Err(status);
        }

        let (raw, message) = materialize_service_message(
            &self.registry,
            &self.method.output_message.name,
            response_value.as_ref(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "failed to materialize mock response");
            self.logs
                .log_trailing_metadata(self.service_name(), self.method_name(), &trailing);
            Status::unknown("Mock API server internal error")
        })?;

        self.logs.log_response_message(
            self.service_name(),
            self.method_name(),
            Some(&raw),
            tonic::Code::Ok,
        );
        self.logs
            .log_trailing_metadata(self.service_name(), self.method_name(), &trailing);

        Ok((message, trailing))
    }

    /// Handles a call whose output is a stream of messages. `requests` has
    /// already been fully collected.
    pub async fn process_stream(
        &self,
        requests: Vec<DynamicMessage>,
        invocation_metadata: MetadataMap,
    ) -> Result<(Vec<DynamicMessage>, MetadataMap), Status> {
        self.logs
            .log_invocation_metadata(self.service_name(), self.method_name(), &invocation_metadata);
        let request_jsons: Vec<JsonValue> = requests.iter().map(message_to_json).collect();
        self.log_requests(&request_jsons);

        let context = self.base_context(&invocation_metadata, &request_jsons);
        let rendered = self.render_mock(&context);
        self.apply_delay(&rendered).await;

        if let Some((code, details)) = &rendered.error {
            let trailing = build_trailing_metadata(&rendered.trailing_meta).unwrap_or_default();
            self.logs
                .log_trailing_metadata(self.service_name(), self.method_name(), &trailing);
            let mut status = Status::new(grpc_status_code(*code), details.clone());
            *status.metadata_mut() = trailing;
            self.logs
                .log_response_error(self.service_name(), self.method_name(), &status);
            return Err(status);
        }

        let (response_values, mut trailing) = if let Some(proxy) = &rendered.proxy {
            let request = requests.into_iter().next();
            match request {
                None => (vec![], MetadataMap::new()),
                Some(request) => {
                    match self
                        .proxy
                        .call_server_streaming(
                            &self.registry,
                            proxy,
                            self.service_name(),
                            self.method_name(),
                            &self.method.input_message.name,
                            &self.method.output_message.name,
                            request,
                            invocation_metadata,
                        )
                        .await
                    {
                        Ok((proxied, proxy_trailing)) => {
                            let values = proxied.iter().map(message_to_json).collect();
                            (values, proxy_trailing)
                        }
                        Err(status) => {
                            self.logs.log_trailing_metadata(
                                self.service_name(),
                                self.method_name(),
                                status.metadata(),
                            );
                            self.logs
                                .log_response_error(self.service_name(), self.method_name(), &status);
                            return Err(status);
                        }
                    }
                }
            }
        } else {
            let values = match &rendered.messages {
                JsonValue::Array(items) => items.clone(),
                JsonValue::Null => vec![],
                other => vec![other.clone()],
            };
            (values, MetadataMap::new())
        };

        if let Ok(rendered_trailing) = build_trailing_metadata(&rendered.trailing_meta) {
            for kv in rendered_trailing.iter() {
                append_metadata_entry(&mut trailing, kv);
            }
        }

        let mut messages = Vec::with_capacity(response_values.len());
        for value in &response_values {
            let (raw, message) = materialize_service_message(
                &self.registry,
                &self.method.output_message.name,
                Some(value),
            )
            .map_err(|e| {
                tracing::error!(error = %e, "failed to materialize mock response");
                Status::unknown("Mock API server internal error")
            })?;
            self.logs.log_response_message(
                self.service_name(),
                self.method_name(),
                Some(&raw),
                tonic::Code::Ok,
            );
            messages.push(message);
        }

        self.logs
            .log_trailing_metadata(self.service_name(), self.method_name(), &trailing);
        Ok((messages, trailing))
    }
}

fn append_metadata_entry(dest: &mut MetadataMap, entry: tonic::metadata::KeyAndValueRef<'_>) {
    match entry {
        tonic::metadata::KeyAndValueRef::Ascii(k, v) => dest.append(k.clone(), v.clone()),
        tonic::metadata::KeyAndValueRef::Binary(k, v) => dest.append_bin(k.clone(), v.clone()),
    };
}
