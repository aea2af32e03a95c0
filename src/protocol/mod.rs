pub mod chunk_stream;
pub mod config;
pub mod events;
pub mod message;
pub mod persistent;
pub mod reader;
pub mod simple;
pub mod unacked_queue;
pub mod writer;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;


/// The part of the API that both protocols share, for code that passes messages and does not
///  care whether they survive a reconnect.
#[async_trait]
pub trait MessagePassingProtocol: Send + Sync {
    async fn send(&self, data: Bytes);

    async fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<Bytes>;

    async fn drain(&self) -> anyhow::Result<()>;
}
