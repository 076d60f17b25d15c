//! Binary that connects to a module network and prints its topology.

mod cli;

use clap::Parser;
use modilink::{ModiError, Session, TransportError, TransportKind, transport::StreamTransport};
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> Result<(), ModiError> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    let stream = TcpStream::connect(&cli.tcp)
        .await
        .map_err(TransportError::from)?;
    let mut builder = Session::builder().transport(StreamTransport::new(stream, TransportKind::Tcp));
    if let Some(expected) = cli.expected {
        builder = builder.expected_modules(expected);
    }
    let session = builder.connect().await?;

    let modules = if cli.expected.is_some() {
        session.wait_for_topology(cli.timeout()).await?
    } else {
        tokio::time::sleep(cli.timeout()).await;
        session.ordered_modules()
    };
    for module in &modules {
        let position = module
            .position
            .map_or_else(|| "-".to_owned(), |p| format!("({}, {})", p.x, p.y));
        println!(
            "{} {:<10} v{} {}",
            module.id,
            module.kind.as_str(),
            module.version_string(),
            position
        );
    }
    session.close().await
}
