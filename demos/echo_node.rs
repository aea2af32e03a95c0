use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use clap::Parser;
use clap_derive::Parser;
use persistent_protocol::protocol::persistent::{PersistentProtocol, PersistentProtocolOptions};
use persistent_protocol::socket::stream::StreamSocket;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{info, warn, Level};

/// Runs either an echo server or a client that sends lines from stdin and prints the replies
#[derive(Parser)]
struct Args {
    /// address to accept connections on
    #[clap(long)]
    listen: Option<String>,

    /// address of an echo server to connect to
    #[clap(long)]
    connect: Option<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    match (args.listen, args.connect) {
        (Some(addr), None) => run_server(&addr).await,
        (None, Some(addr)) => run_client(&addr).await,
        _ => Err(anyhow!("exactly one of --listen and --connect is required")),
    }
}

async fn run_server(addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted connection from {}", peer);
        tokio::spawn(async move {
            let protocol = Arc::new(PersistentProtocol::new(StreamSocket::spawn(stream), PersistentProtocolOptions::default()).await);
            let mut messages = protocol.subscribe_messages().await;
            let mut did_dispose = protocol.subscribe_did_dispose().await;
            let mut socket_close = protocol.subscribe_socket_close().await;

            loop {
                select! {
                    Some(msg) = messages.recv() => {
                        protocol.send(msg).await;
                    }
                    _ = did_dispose.recv() => {
                        info!("{} disconnected", peer);
                        break;
                    }
                    Some(e) = socket_close.recv() => {
                        info!("connection from {} {}", peer, e);
                        break;
                    }
                    else => break,
                }
            }
            protocol.dispose().await;
        });
    }
}

async fn run_client(addr: &str) -> anyhow::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    let protocol = PersistentProtocol::new(StreamSocket::spawn(stream), PersistentProtocolOptions::default()).await;

    let mut messages = protocol.subscribe_messages().await;
    let mut socket_close = protocol.subscribe_socket_close().await;
    let mut socket_timeout = protocol.subscribe_socket_timeout().await;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => protocol.send(Bytes::from(line)).await,
                    None => break,
                }
            }
            Some(msg) = messages.recv() => {
                println!("{}", String::from_utf8_lossy(&msg));
            }
            Some(e) = socket_timeout.recv() => {
                warn!("server is not responding: {:?}", e);
            }
            Some(e) = socket_close.recv() => {
                return Err(anyhow!("connection {}", e));
            }
            else => break,
        }
    }

    protocol.send_disconnect().await;
    protocol.drain().await?;
    protocol.dispose().await;
    Ok(())
}
