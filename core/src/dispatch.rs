//! Dispatch Layer (C6): routes incoming HTTP/2 requests to the method
//! pipeline for whichever service/method the path names.
//!
//! Proto services are discovered at startup from arbitrary user-supplied
//! `.proto` files, so the set of `/{service}/{method}` routes is only known
//! at runtime. `tonic::transport::Server`'s `add_service` requires each
//! registered service to implement `NamedService`, whose `NAME` is a
//! compile-time associated constant — one fixed Rust type cannot carry a
//! different `NAME` per server instance. Rather than fabricate one Rust type
//! per proto service (impossible, since service names aren't known until
//! the descriptor pool is built), this table is served directly over a
//! hand-rolled HTTP/2 connection (see `server.rs`), bypassing
//! `tonic::transport::Server`'s named-service routing entirely. The
//! per-request dispatch below mirrors the `match req.uri().path() { ... }`
//! shape tonic's own codegen produces, except the match arms are entries in
//! a runtime-built table instead of compiler-generated cases.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;

use http_body::Body as HttpBody;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use tokio_stream::{Stream, StreamExt};
use tonic::body::BoxBody;
use tonic::server::{ClientStreamingService, ServerStreamingService, StreamingService, UnaryService};
use tonic::Status;

use crate::codec::DynamicCodec;
use crate::pipeline::MethodPipeline;
use crate::proto::MethodData;

type BoxFuture<T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'static>>;
type DynStream = Pin<Box<dyn Stream<Item = Result<DynamicMessage, Status>> + Send + 'static>>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum StreamKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    Bidi,
}

impl StreamKind {
    fn of(method: &MethodData) -> Self {
        match (method.input_message.streaming, method.output_message.streaming) {
            (false, false) => StreamKind::Unary,
            (true, false) => StreamKind::ClientStreaming,
            (false, true) => StreamKind::ServerStreaming,
            (true, true) => StreamKind::Bidi,
        }
    }
}

/// One resolved route: the descriptors needed to decode/encode on the wire,
/// and the pipeline that actually produces responses.
struct Route {
    kind: StreamKind,
    request_desc: MessageDescriptor,
    response_desc: MessageDescriptor,
    pipeline: Arc<MethodPipeline>,
}

/// The full set of routes for one server instance, keyed by gRPC path
/// (`/{service.full_name}/{method_name}`).
#[derive(Clone, Default)]
pub struct DispatchTable {
    routes: Arc<HashMap<String, Route>>,
}

pub struct DispatchTableBuilder {
    routes: HashMap<String, Route>,
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        DispatchTableBuilder { routes: HashMap::new() }
    }

    pub fn insert(
        &mut self,
        service_full_name: &str,
        method: &MethodData,
        request_desc: MessageDescriptor,
        response_desc: MessageDescriptor,
        pipeline: Arc<MethodPipeline>,
    ) {
        let path = format!("/{service_full_name}/{}", method.name);
        self.routes.insert(
            path,
            Route {
                kind: StreamKind::of(method),
                request_desc,
                response_desc,
                pipeline,
            },
        );
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable { routes: Arc::new(self.routes) }
    }
}

struct UnaryAdapter {
    pipeline: Arc<MethodPipeline>,
}

impl UnaryService<DynamicMessage> for UnaryAdapter {
    type Response = DynamicMessage;
    type Future = BoxFuture<Result<tonic::Response<DynamicMessage>, Status>>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        Box::pin(async move {
            let metadata = request.metadata().clone();
            let (message, trailing) = pipeline
                .process_unary(vec![request.into_inner()], metadata)
                .await?;
            let mut response = tonic::Response::new(message);
            merge_into(response.metadata_mut(), &trailing);
            Ok(response)
        })
    }
}

struct ClientStreamingAdapter {
    pipeline: Arc<MethodPipeline>,
}

impl ClientStreamingService<DynamicMessage> for ClientStreamingAdapter {
    type Response = DynamicMessage;
    type Future = BoxFuture<Result<tonic::Response<DynamicMessage>, Status>>;

    fn call(&mut self, request: tonic::Request<tonic::Streaming<DynamicMessage>>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        Box::pin(async move {
            let metadata = request.metadata().clone();
            let mut stream = request.into_inner();
            let mut requests = Vec::new();
            while let Some(item) = stream.next().await {
                requests.push(item?);
            }
            let (message, trailing) = pipeline.process_unary(requests, metadata).await?;
            let mut response = tonic::Response::new(message);
            merge_into(response.metadata_mut(), &trailing);
            Ok(response)
        })
    }
}

struct ServerStreamingAdapter {
    pipeline: Arc<MethodPipeline>,
}

impl ServerStreamingService<DynamicMessage> for ServerStreamingAdapter {
    type Response = DynamicMessage;
    type ResponseStream = DynStream;
    type Future = BoxFuture<Result<tonic::Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        Box::pin(async move {
            let metadata = request.metadata().clone();
            let (messages, trailing) = pipeline
                .process_stream(vec![request.into_inner()], metadata)
                .await?;
            let body: DynStream = Box::pin(tokio_stream::iter(messages.into_iter().map(Ok)));
            let mut response = tonic::Response::new(body);
            merge_into(response.metadata_mut(), &trailing);
            Ok(response)
        })
    }
}

struct BidiAdapter {
    pipeline: Arc<MethodPipeline>,
}

impl StreamingService<DynamicMessage> for BidiAdapter {
    type Response = DynamicMessage;
    type ResponseStream = DynStream;
    type Future = BoxFuture<Result<tonic::Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: tonic::Request<tonic::Streaming<DynamicMessage>>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        Box::pin(async move {
            let metadata = request.metadata().clone();
            let mut stream = request.into_inner();
            let mut requests = Vec::new();
            while let Some(item) = stream.next().await {
                requests.push(item?);
            }
            let (messages, trailing) = pipeline.process_stream(requests, metadata).await?;
            let body: DynStream = Box::pin(tokio_stream::iter(messages.into_iter().map(Ok)));
            let mut response = tonic::Response::new(body);
            merge_into(response.metadata_mut(), &trailing);
            Ok(response)
        })
    }
}

/// Appends every entry of `src` onto `dest`, used to fold a pipeline's
/// computed trailing metadata into the response's metadata map. tonic's
/// generated-handler shape only exposes `Response::metadata_mut` (initial
/// metadata/headers) to a unary/streaming handler on the success path; true
/// HTTP/2 trailers aren't reachable from here, so configured `trailing_meta`
/// rides along as extra headers instead. Documented as a known
/// simplification.
fn merge_into(dest: &mut tonic::metadata::MetadataMap, src: &tonic::metadata::MetadataMap) {
    for kv in src.iter() {
        match kv {
            tonic::metadata::KeyAndValueRef::Ascii(k, v) => dest.append(k.clone(), v.clone()),
            tonic::metadata::KeyAndValueRef::Binary(k, v) => dest.append_bin(k.clone(), v.clone()),
        };
    }
}

pub(crate) fn unimplemented_response() -> http::Response<BoxBody> {
    http::Response::builder()
        .status(200)
        .header("grpc-status", "12")
        .header("content-type", "application/grpc")
        .body(BoxBody::empty())
        .unwrap()
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::new()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn has_route(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(|s| s.as_str())
    }

    /// Handles one HTTP/2 request, decoding/encoding via a per-route
    /// `DynamicCodec` and delegating to `tonic::server::Grpc`. Mirrors the
    /// `match req.uri().path() { "/pkg.Svc/Method" => { ... }, _ => ... }`
    /// shape of tonic's generated server code.
    pub async fn call<B>(&self, req: http::Request<B>) -> http::Response<BoxBody>
    where
        B: HttpBody<Data = bytes::Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>> + Send,
    {
        let route = match self.routes.get(req.uri().path()) {
            Some(route) => route,
            None => return unimplemented_response(),
        };

        let codec = DynamicCodec::new_server(route.request_desc.clone(), route.response_desc.clone());
        let mut grpc = tonic::server::Grpc::new(codec);

        match route.kind {
            StreamKind::Unary => {
                let method = UnaryAdapter { pipeline: route.pipeline.clone() };
                grpc.unary(method, req).await
            }
            StreamKind::ClientStreaming => {
                let method = ClientStreamingAdapter { pipeline: route.pipeline.clone() };
                grpc.client_streaming(method, req).await
            }
            StreamKind::ServerStreaming => {
                let method = ServerStreamingAdapter { pipeline: route.pipeline.clone() };
                grpc.server_streaming(method, req).await
            }
            StreamKind::Bidi => {
                let method = BidiAdapter { pipeline: route.pipeline.clone() };
                grpc.streaming(method, req).await
            }
        }
    }
}
