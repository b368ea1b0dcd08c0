//! Proxy Channel Cache (C5): forwards calls to an upstream gRPC server over
//! a memoized plaintext HTTP/2 channel.
//!
//! Grounded on `server/processors/proxy.py`'s `ProxyProcessor` (channel and
//! method memoization, metadata passthrough, timeout application, upstream
//! error translation) and the teacher's `connection.rs`/`codec.rs` dynamic
//! invocation pattern (`commands/invoke.rs`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use http::uri::PathAndQuery;
use prost_reflect::DynamicMessage;
use tonic::client::Grpc;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

use crate::codec::DynamicCodec;
use crate::config::ProxyConfig;
use crate::registry::TypeRegistry;

/// Holds plaintext channels keyed by upstream socket, opened lazily and
/// reused across calls (mirrors `ProxyProcessor._channels_dict`).
#[derive(Default)]
pub struct ProxyCache {
    channels: Mutex<HashMap<String, Channel>>,
}

impl ProxyCache {
    pub fn new() -> Self {
        ProxyCache::default()
    }

    /// Drops every cached upstream channel. Mirrors `ProxyProcessor`'s
    /// `close_channels`, run once a server's listeners have stopped.
    pub fn close_channels(&self) {
        self.channels.lock().unwrap().clear();
    }

    async fn channel_for(&self, socket: &str) -> Result<Channel, Status> {
        if let Some(channel) = self.channels.lock().unwrap().get(socket).cloned() {
            return Ok(channel);
        }

        let uri = format!("http://{socket}");
        let endpoint: Endpoint = Channel::from_shared(uri)
            .map_err(|e| Status::internal(format!("invalid proxy socket '{socket}': {e}")))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Status::unavailable(format!("cannot reach proxy upstream '{socket}': {e}")))?;

        self.channels
            .lock()
            .unwrap()
            .insert(socket.to_string(), channel.clone());
        Ok(channel)
    }

    /// Forwards a single request/response call to the configured upstream,
    /// returning the decoded response message and any trailing metadata.
    /// Mirrors `_process_unary_proxying`.
    pub async fn call_unary(
        &self,
        registry: &TypeRegistry,
        proxy: &ProxyConfig,
        service_full_name: &str,
        method_name: &str,
        input_name: &str,
        output_name: &str,
        request: DynamicMessage,
        invocation_metadata: MetadataMap,
    ) -> Result<(DynamicMessage, MetadataMap), Status> {
        let channel = self.channel_for(&proxy.socket).await?;

        let request_desc = registry
            .message_descriptor(input_name)
            .map_err(|e| Status::internal(e.to_string()))?;
        let response_desc = registry
            .message_descriptor(output_name)
            .map_err(|e| Status::internal(e.to_string()))?;

        let path: PathAndQuery = format!("/{service_full_name}/{method_name}")
            .parse()
            .map_err(|e| Status::internal(format!("invalid proxy method path: {e}")))?;

        let codec = DynamicCodec::new_client(request_desc, response_desc);
        let mut client = Grpc::new(channel);
        client
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("proxy upstream not ready: {e}")))?;

        let mut req = tonic::Request::new(request);
        *req.metadata_mut() = invocation_metadata;
        if let Some(timeout) = proxy_timeout(proxy) {
            req.set_timeout(timeout);
        }

        let response = client.unary(req, path, codec).await?;
        let metadata = response.metadata().clone();
        Ok((response.into_inner(), metadata))
    }

    /// Forwards a call expecting a stream of responses. Mirrors
    /// `_process_stream_proxying`, collected eagerly since mock responses
    /// are always materialized as a finite list.
    pub async fn call_server_streaming(
        &self,
        registry: &TypeRegistry,
        proxy: &ProxyConfig,
        service_full_name: &str,
        method_name: &str,
        input_name: &str,
        output_name: &str,
        request: DynamicMessage,
        invocation_metadata: MetadataMap,
    ) -> Result<(Vec<DynamicMessage>, MetadataMap), Status> {
        let channel = self.channel_for(&proxy.socket).await?;

        let request_desc = registry
            .message_descriptor(input_name)
            .map_err(|e| Status::internal(e.to_string()))?;
        let response_desc = registry
            .message_descriptor(output_name)
            .map_err(|e| Status::internal(e.to_string()))?;

        let path: PathAndQuery = format!("/{service_full_name}/{method_name}")
            .parse()
            .map_err(|e| Status::internal(format!("invalid proxy method path: {e}")))?;

        let codec = DynamicCodec::new_client(request_desc, response_desc);
        let mut client = Grpc::new(channel);
        client
            .ready()
            .await
            .map_err(|e| Status::unavailable(format!("proxy upstream not ready: {e}")))?;

        let mut req = tonic::Request::new(request);
        *req.metadata_mut() = invocation_metadata;
        if let Some(timeout) = proxy_timeout(proxy) {
            req.set_timeout(timeout);
        }

        let response = client.server_streaming(req, path, codec).await?;
        let headers = response.metadata().clone();
        let mut stream = response.into_inner();

        let mut messages = Vec::new();
        while let Some(msg) = stream.message().await? {
            messages.push(msg);
        }
        let trailers = stream.trailers().await?.unwrap_or_default();
        let mut metadata = headers;
        for kv in trailers.iter() {
            match kv {
                tonic::metadata::KeyAndValueRef::Ascii(k, v) => metadata.append(k.clone(), v.clone()),
                tonic::metadata::KeyAndValueRef::Binary(k, v) => metadata.append_bin(k.clone(), v.clone()),
            }
        }

        Ok((messages, metadata))
    }
}

fn proxy_timeout(proxy: &ProxyConfig) -> Option<Duration> {
    proxy
        .seconds_timeout
        .as_ref()
        .and_then(|v| v.as_f64())
        .map(Duration::from_secs_f64)
}
