//! Per-server orchestration (C1+C2 construction, dispatch table assembly,
//! reflection registration, socket binding and the HTTP/2 accept loop).
//!
//! Grounded on `main.py`'s `create_server` and `server/configurers.py`'s
//! `GRPCServerConfigurer.build_server`/`check_methods`. The accept loop
//! itself is hand-rolled on `hyper`/`hyper-util` rather than
//! `tonic::transport::Server` — see `dispatch.rs` for why.

use std::collections::HashSet;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use hyper_util::rt::{TokioExecutor, TokioIo};
use prost::Message;
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{RootCertStore, ServerConfig as RustlsServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::{CertificatesConfig, ServerConfig, SocketConfig};
use crate::dispatch::{unimplemented_response, DispatchTable};
use crate::error::{MockServerError, Result};
use crate::logs::ApiLogProcessor;
use crate::pipeline::MethodPipeline;
use crate::proto::compiler::{compile, resolve_proto_files_paths};
use crate::proxy::ProxyCache;
use crate::registry::TypeRegistry;
use crate::template::TemplateEngine;

type BoxFuture<T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'static>>;

/// Erases the concrete, compiler-generated reflection service type (and its
/// never-really-happens `Error` associated type) behind a plain async call,
/// so `MockGrpcServer` doesn't need to name it.
trait BoxedGrpcService: Send + Sync {
    fn call(&self, req: http::Request<hyper::body::Incoming>) -> BoxFuture<http::Response<tonic::body::BoxBody>>;
}

struct ServiceAdapter<S>(S);

impl<S> BoxedGrpcService for ServiceAdapter<S>
where
    S: tower::Service<http::Request<hyper::body::Incoming>, Response = http::Response<tonic::body::BoxBody>>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    S::Error: std::fmt::Debug,
{
    fn call(&self, req: http::Request<hyper::body::Incoming>) -> BoxFuture<http::Response<tonic::body::BoxBody>> {
        let mut svc = self.0.clone();
        Box::pin(async move {
            match tower::Service::call(&mut svc, req).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = ?e, "reflection service returned an error");
                    unimplemented_response()
                }
            }
        })
    }
}

type ReflectionService = Box<dyn BoxedGrpcService>;

fn resolve_relative(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Logs, once, any `mocks.<service>.<method>` entries that don't match
/// anything in the compiled proto structure. Mirrors `check_methods`.
fn warn_on_unknown_mocks(server_config: &ServerConfig, structure: &crate::proto::ProtoFileStructure) {
    let mut unknown_services = HashSet::new();
    let mut unknown_methods: Vec<(String, String)> = Vec::new();

    for (service_name, methods) in &server_config.mocks {
        match structure.services.get(service_name) {
            None => {
                unknown_services.insert(service_name.clone());
            }
            Some(service) => {
                for method_name in methods.keys() {
                    if !service.methods.contains_key(method_name) {
                        unknown_methods.push((service_name.clone(), method_name.clone()));
                    }
                }
            }
        }
    }

    if !unknown_services.is_empty() {
        tracing::warn!(
            alias = %server_config.alias,
            services = ?unknown_services,
            "services were not described in proto file(s)",
        );
    }
    if !unknown_methods.is_empty() {
        tracing::warn!(
            alias = %server_config.alias,
            methods = ?unknown_methods,
            "methods were not described in proto file(s)",
        );
    }
}

/// One running mock server: a dynamic dispatch table plus an optional
/// reflection service, ready to be served on one or more sockets.
pub struct MockGrpcServer {
    alias: String,
    dispatch: DispatchTable,
    reflection: Option<ReflectionService>,
    proxy: Arc<ProxyCache>,
}

impl MockGrpcServer {
    /// Compiles the server's proto files, builds the registry/template
    /// engine/proxy cache/log processor, and assembles the dispatch table
    /// from every service/method the descriptors define.
    pub async fn build(server_config: &ServerConfig, config_file_dir: &Path) -> Result<Self> {
        let patterns = server_config.proto_files.as_patterns();
        let paths = resolve_proto_files_paths(
            &patterns,
            server_config.proto_files_base_dir.as_deref(),
            config_file_dir,
        )?;
        let (pool, structure) = compile(&paths)?;
        warn_on_unknown_mocks(server_config, &structure);

        let registry = Arc::new(TypeRegistry::new(pool, structure));
        let templates = Arc::new(TemplateEngine::new(paths.base_dir_abs.clone()));
        let proxy = Arc::new(ProxyCache::new());
        let logs = Arc::new(ApiLogProcessor::new(server_config.alias.clone()));

        let mut builder = DispatchTable::builder();
        for service in registry.structure().services.values() {
            for method in service.methods.values() {
                let mock_config = server_config
                    .mocks
                    .get(&service.full_name)
                    .and_then(|methods| methods.get(&method.name))
                    .cloned()
                    .flatten();

                let request_desc = registry.message_descriptor(&method.input_message.name)?;
                let response_desc = registry.message_descriptor(&method.output_message.name)?;

                let pipeline = Arc::new(MethodPipeline::new(
                    registry.clone(),
                    templates.clone(),
                    proxy.clone(),
                    logs.clone(),
                    service.clone(),
                    method.clone(),
                    mock_config,
                ));

                builder.insert(&service.full_name, method, request_desc, response_desc, pipeline);
            }
        }
        let dispatch = builder.build();

        let reflection = if server_config.reflection_enabled {
            Some(build_reflection_service(&registry)?)
        } else {
            None
        };

        Ok(MockGrpcServer {
            alias: server_config.alias.clone(),
            dispatch,
            reflection,
            proxy,
        })
    }

    /// A handle to this server's proxy channel cache, used by the CLI
    /// entrypoint to close upstream channels once shutdown has been
    /// requested and every listener has stopped.
    pub fn proxy_cache(&self) -> Arc<ProxyCache> {
        self.proxy.clone()
    }

    /// Binds every configured socket and serves until `shutdown` reports
    /// true (no grace period: in-flight connections are not drained) or one
    /// listener fails outright.
    pub async fn serve(
        self,
        sockets: Vec<SocketConfig>,
        config_file_dir: &Path,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        let server = Arc::new(self);
        let mut listeners = Vec::with_capacity(sockets.len());
        for socket in &sockets {
            let tls = match &socket.certificates {
                Some(cert_config) => Some(build_tls_acceptor(cert_config, config_file_dir)?),
                None => None,
            };
            let listener = TcpListener::bind(&socket.socket)
                .await
                .map_err(|e| MockServerError::Transport(format!("bind '{}': {e}", socket.socket)))?;
            tracing::info!(alias = %server.alias, socket = %socket.socket, tls = tls.is_some(), "listening");
            listeners.push((listener, tls));
        }

        let mut tasks = Vec::with_capacity(listeners.len());
        for (listener, tls) in listeners {
            let server = server.clone();
            tasks.push(tokio::spawn(accept_loop(server, listener, tls, shutdown.clone())));
        }
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    async fn handle(&self, req: http::Request<hyper::body::Incoming>) -> http::Response<tonic::body::BoxBody> {
        if self.dispatch.has_route(req.uri().path()) {
            return self.dispatch.call(req).await;
        }
        if let Some(reflection) = &self.reflection {
            return reflection.call(req).await;
        }
        unimplemented_response()
    }
}

async fn accept_loop(
    server: Arc<MockGrpcServer>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        let (stream, _addr) = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let server = server.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| {
                let server = server.clone();
                async move { Ok::<_, std::convert::Infallible>(server.handle(req).await) }
            });

            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(tls_stream), service)
                            .await
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "TLS handshake failed");
                        return;
                    }
                },
                None => {
                    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                }
            };
            if let Err(e) = result {
                tracing::debug!(error = %e, "connection closed with error");
            }
        });
    }
}

/// Builds the reflection service from the compiled descriptor pool,
/// encoded as a `FileDescriptorSet` the way `descriptor.rs`'s symbol dump
/// already does for the client side.
fn build_reflection_service(registry: &TypeRegistry) -> Result<ReflectionService> {
    let fds = prost_types::FileDescriptorSet {
        file: registry.pool().file_descriptor_protos().cloned().collect(),
    };
    let encoded = fds.encode_to_vec();

    let service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(&encoded)
        .build_v1()
        .map_err(|e| MockServerError::Transport(format!("reflection service build failed: {e}")))?;

    Ok(Box::new(ServiceAdapter(service)))
}

fn read_relative(base: &Path, path: &str) -> Result<Vec<u8>> {
    let resolved = resolve_relative(base, path);
    std::fs::read(&resolved).map_err(MockServerError::Io)
}

/// Loads a certificate/key pair (and, if configured, a root CA used to
/// require client certificates) into a `TlsAcceptor`. Mirrors the
/// semantics of `grpc.ssl_server_credentials`.
fn build_tls_acceptor(cert_config: &CertificatesConfig, config_file_dir: &Path) -> Result<TlsAcceptor> {
    let cert_bytes = read_relative(config_file_dir, &cert_config.certificate)?;
    let key_bytes = read_relative(config_file_dir, &cert_config.key_file)?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_bytes.as_slice()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| MockServerError::Transport(format!("invalid certificate: {e}")))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_bytes.as_slice()))
        .map_err(|e| MockServerError::Transport(format!("invalid private key: {e}")))?
        .ok_or_else(|| MockServerError::Transport("no private key found in key file".into()))?;

    let builder = RustlsServerConfig::builder();
    let mut rustls_config = if let Some(root_cert_path) = &cert_config.root_certificate {
        let root_bytes = read_relative(config_file_dir, root_cert_path)?;
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut BufReader::new(root_bytes.as_slice())) {
            let cert = cert.map_err(|e| MockServerError::Transport(format!("invalid root certificate: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| MockServerError::Transport(format!("invalid root certificate: {e}")))?;
        }
        let verifier = tokio_rustls::rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| MockServerError::Transport(format!("client verifier setup failed: {e}")))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| MockServerError::Transport(format!("TLS config error: {e}")))?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| MockServerError::Transport(format!("TLS config error: {e}")))?
    };

    rustls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(rustls_config)))
}
