// Shared scaffolding for the end-to-end scenario tests (S1-S6). Follows the
// same shape as the teacher's own `tests/common/server.rs`: spawn something
// real on an ephemeral port, wait for it to come up, tear it down on drop.
#![allow(dead_code)]

use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use capgrpc_core::config::{Config, ServerConfig};
use capgrpc_core::proto::{compile, resolve_proto_files_paths};
use capgrpc_core::registry::TypeRegistry;
use capgrpc_core::MockGrpcServer;
use prost_reflect::{DynamicMessage, MessageDescriptor, Value as ProstValue};
use tonic::client::Grpc;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::Status;

/// The book-service IDL shared by every scenario test. Matches
/// `testing/upstream-fixture/proto/book.proto` field-for-field for
/// `GetBook`/`AddBook`/`GetBooksList`, plus a `ListBooks` server-streaming
/// method the fixture doesn't implement, used only for the streaming
/// scenario (S4) against the mock server directly.
pub const BOOK_PROTO: &str = r#"
syntax = "proto3";

package book;

enum BookType {
  UNKNOWN = 0;
  ENCYCLOPEDIA = 1;
  NOVEL = 2;
}

message Author {
  string first_name = 1;
  string last_name = 2;
}

message Book {
  int32 id = 1;
  string name = 2;
  BookType type = 3;
  Author author = 4;
}

message GetBookReq {
  int32 id = 1;
}

message AddBookReq {
  Book book = 1;
}

message AddBookResp {
  int32 id = 1;
}

message GetBooksListReq {
}

message GetBooksListResp {
  repeated Book books = 1;
}

service BookService {
  rpc GetBook(GetBookReq) returns (Book);
  rpc AddBook(AddBookReq) returns (AddBookResp);
  rpc GetBooksList(GetBooksListReq) returns (GetBooksListResp);
  rpc ListBooks(GetBooksListReq) returns (stream Book);
}
"#;

/// Bind to port 0 to get an ephemeral port from the OS, then drop the
/// listener so the mock server (or fixture) can bind it right after.
pub fn find_free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("failed to bind ephemeral port");
    listener.local_addr().unwrap().port()
}

fn wait_for_port(port: u16, timeout: Duration) {
    let start = Instant::now();
    loop {
        if std::net::TcpStream::connect_timeout(
            &format!("127.0.0.1:{port}").parse().unwrap(),
            Duration::from_millis(100),
        )
        .is_ok()
        {
            return;
        }
        if start.elapsed() > timeout {
            panic!("timed out waiting for port {port}");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// A running mock server plus a type registry built from the same proto,
/// used by the test's own client code to encode requests/decode responses.
pub struct RunningMockServer {
    pub port: u16,
    pub registry: TypeRegistry,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    join: Option<tokio::task::JoinHandle<capgrpc_core::Result<()>>>,
}

impl RunningMockServer {
    pub async fn channel(&self) -> Channel {
        Channel::from_shared(format!("http://127.0.0.1:{}", self.port))
            .unwrap()
            .connect()
            .await
            .expect("failed to connect to mock server")
    }
}

impl Drop for RunningMockServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

/// Writes `proto_src` into a temp dir, fills in `{{port}}` in
/// `config_template`, builds the mock server from it, spawns it on the
/// substituted port, and waits for the listener to come up. The returned
/// `TempDir` must be kept alive for as long as the server runs.
pub async fn start_mock_server(proto_src: &str, config_template: &str) -> (RunningMockServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("book.proto"), proto_src).unwrap();

    let port = find_free_port();
    let config_yaml = config_template.replace("{{port}}", &port.to_string());
    let config = Config::from_yaml(&config_yaml).expect("test config is valid");
    let server_config: ServerConfig = config.servers.into_iter().next().expect("one server");

    let built = MockGrpcServer::build(&server_config, dir.path())
        .await
        .expect("mock server builds");

    let paths = resolve_proto_files_paths(
        &server_config.proto_files.as_patterns(),
        server_config.proto_files_base_dir.as_deref(),
        dir.path(),
    )
    .unwrap();
    let (pool, structure) = compile(&paths).unwrap();
    let registry = TypeRegistry::new(pool, structure);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sockets = server_config.sockets.clone();
    let config_file_dir = dir.path().to_path_buf();
    let join = tokio::spawn(async move { built.serve(sockets, &config_file_dir, shutdown_rx).await });

    wait_for_port(port, Duration::from_secs(5));

    (
        RunningMockServer {
            port,
            registry,
            shutdown_tx,
            join: Some(join),
        },
        dir,
    )
}

/// A real upstream book-service process, spawned from the sibling
/// `upstream-fixture` binary built alongside `cap-grpc` in the shared
/// workspace target directory (teacher's `TestServer::testserver_bin`
/// pattern — see `examples/Shuozeli-grpcurl-rs/grpcurl-cli/tests/common/server.rs`).
pub struct UpstreamFixture {
    process: Child,
    pub port: u16,
}

impl UpstreamFixture {
    pub fn start() -> Self {
        let port = find_free_port();
        let bin = upstream_fixture_bin();
        let process = Command::new(&bin)
            .args(["-p", &port.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("failed to start upstream-fixture at {}: {e}", bin.display()));
        wait_for_port(port, Duration::from_secs(10));
        UpstreamFixture { process, port }
    }

    pub fn socket(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

impl Drop for UpstreamFixture {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

fn upstream_fixture_bin() -> PathBuf {
    let cap_grpc = PathBuf::from(env!("CARGO_BIN_EXE_cap-grpc"));
    let target_dir = cap_grpc.parent().expect("cap-grpc binary has no parent dir");
    target_dir.join("upstream-fixture")
}

/// Minimal dynamic gRPC client, mirroring `proxy.rs`'s own call pattern but
/// used here in the opposite direction: the test drives real RPCs against
/// the mock server instead of the mock server proxying to an upstream.
pub async fn call_unary(
    channel: Channel,
    registry: &TypeRegistry,
    service_full_name: &str,
    method_name: &str,
    input_name: &str,
    output_name: &str,
    request: DynamicMessage,
) -> Result<(DynamicMessage, MetadataMap), Status> {
    let request_desc = registry.message_descriptor(input_name).unwrap();
    let response_desc = registry.message_descriptor(output_name).unwrap();

    let path: http::uri::PathAndQuery = format!("/{service_full_name}/{method_name}").parse().unwrap();
    let codec = capgrpc_core::codec::DynamicCodec::new_client(request_desc, response_desc);

    let mut client = Grpc::new(channel);
    client.ready().await.map_err(|e| Status::unavailable(e.to_string()))?;

    let response = client.unary(tonic::Request::new(request), path, codec).await?;
    let metadata = response.metadata().clone();
    Ok((response.into_inner(), metadata))
}

pub async fn call_server_streaming(
    channel: Channel,
    registry: &TypeRegistry,
    service_full_name: &str,
    method_name: &str,
    input_name: &str,
    output_name: &str,
    request: DynamicMessage,
) -> Result<Vec<DynamicMessage>, Status> {
    let request_desc = registry.message_descriptor(input_name).unwrap();
    let response_desc = registry.message_descriptor(output_name).unwrap();

    let path: http::uri::PathAndQuery = format!("/{service_full_name}/{method_name}").parse().unwrap();
    let codec = capgrpc_core::codec::DynamicCodec::new_client(request_desc, response_desc);

    let mut client = Grpc::new(channel);
    client.ready().await.map_err(|e| Status::unavailable(e.to_string()))?;

    let response = client.server_streaming(tonic::Request::new(request), path, codec).await?;
    let mut stream = response.into_inner();
    let mut messages = Vec::new();
    while let Some(msg) = stream.message().await? {
        messages.push(msg);
    }
    Ok(messages)
}

/// Builds a `GetBookReq { id }`-shaped request (or any single-int32-field
/// message) without depending on a non-UTF8 decode path.
pub fn message_with_i32(descriptor: &MessageDescriptor, field: &str, value: i32) -> DynamicMessage {
    let mut message = DynamicMessage::new(descriptor.clone());
    message.set_field_by_name(field, ProstValue::I32(value));
    message
}

pub fn empty_message(descriptor: &MessageDescriptor) -> DynamicMessage {
    DynamicMessage::new(descriptor.clone())
}

pub fn proto_dir_marker() -> &'static Path {
    Path::new(".")
}
