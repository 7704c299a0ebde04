//! Connection to the commit-event source.
//!
//! The consumer only sees [`Transport`] and [`FrameStream`], so tests can
//! script frames without a socket.

use crate::{IndexerError, Result};
use arabica_protocol::Collection;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::debug;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

pub const DEFAULT_JETSTREAM_ENDPOINT: &str = "wss://jetstream2.us-east.bsky.network/subscribe";

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a stream positioned after `cursor`, or at the live edge when `None`.
    async fn connect(&self, cursor: Option<u64>) -> Result<Box<dyn FrameStream>>;
}

#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame. `None` means the remote closed the stream.
    async fn next_frame(&mut self) -> Option<Result<String>>;
}

/// Jetstream websocket subscription filtered to the recognized collections.
#[derive(Debug, Clone)]
pub struct JetstreamTransport {
    endpoint: Url,
    collections: Vec<Collection>,
}

impl JetstreamTransport {
    pub fn new(endpoint: &str, collections: impl IntoIterator<Item = Collection>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        match endpoint.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(IndexerError::Transport(format!(
                    "unsupported endpoint scheme '{other}'"
                )))
            }
        }
        Ok(Self {
            endpoint,
            collections: collections.into_iter().collect(),
        })
    }

    #[must_use]
    pub fn subscribe_url(&self, cursor: Option<u64>) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            for collection in &self.collections {
                query.append_pair("wantedCollections", collection.nsid());
            }
            if let Some(cursor) = cursor {
                query.append_pair("cursor", &cursor.to_string());
            }
        }
        url
    }
}

#[async_trait]
impl Transport for JetstreamTransport {
    async fn connect(&self, cursor: Option<u64>) -> Result<Box<dyn FrameStream>> {
        let url = self.subscribe_url(cursor);
        debug!("Connecting to {url}");
        let (ws, _response) = connect_async(url.as_str()).await?;
        Ok(Box::new(JetstreamStream { ws }))
    }
}

struct JetstreamStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameStream for JetstreamStream {
    async fn next_frame(&mut self) -> Option<Result<String>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes).map_err(|err| {
                        IndexerError::Transport(format!("non-UTF-8 binary frame: {err}"))
                    }))
                }
                Ok(Message::Close(frame)) => {
                    debug!("Server closed stream: {frame:?}");
                    return None;
                }
                // tungstenite answers pings itself.
                Ok(_) => continue,
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}
