mod service;

use clap::Parser;
use tonic::transport::Server;

pub mod pb {
    tonic::include_proto!("book");
}

#[derive(Parser, Debug)]
#[command(name = "upstream-fixture", about = "Real book-service upstream used by proxy-fallback tests")]
struct Cli {
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let addr: std::net::SocketAddr = format!("127.0.0.1:{}", cli.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Listening on {}", listener.local_addr()?);

    let book_service = pb::book_service_server::BookServiceServer::new(service::BookServiceImpl::default());

    Server::builder()
        .add_service(book_service)
        .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
        .await?;

    Ok(())
}
