//! Client connection to a single relay.

use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use url::Url;

use crate::protocol::{decode_frame, encode_req, Filter, Frame};

/// Outcome of waiting for the next frame on a connection.
#[derive(Debug)]
pub enum Received {
    /// A decoded protocol frame.
    Frame(Frame),
    /// The read deadline expired before a frame arrived.
    Timeout,
    /// The relay closed the connection.
    Closed,
}

/// One WebSocket connection to one relay endpoint.
///
/// The transport resource lives exactly as long as this value; callers close
/// it on every exit path rather than letting connections linger.
pub struct RelayConnection {
    ws: WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>,
}

impl RelayConnection {
    /// Open a connection, optionally via a SOCKS5 proxy.
    pub async fn open(endpoint: &str, socks: Option<&str>) -> Result<Self> {
        let url = Url::parse(endpoint)?;
        let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("missing port"))?;
        let req = endpoint.into_client_request()?;
        let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = socks {
            Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
        } else {
            Box::new(TcpStream::connect((host, port)).await?)
        };
        let (ws, _) = client_async(req, stream).await?;
        Ok(Self { ws })
    }

    /// Subscribe to `filter` under `sub_id`.
    pub async fn subscribe(&mut self, sub_id: &str, filter: &Filter) -> Result<()> {
        self.ws.send(Message::Text(encode_req(sub_id, filter))).await?;
        Ok(())
    }

    /// Wait for the next frame, bounding each read by `read_timeout`.
    ///
    /// The deadline rolls per read, so a relay that keeps sending stays
    /// alive indefinitely while one that stalls mid-stream is abandoned.
    /// Non-text messages are skipped.
    pub async fn next_frame(&mut self, read_timeout: Duration) -> Result<Received> {
        loop {
            match timeout(read_timeout, self.ws.next()).await {
                Err(_) => return Ok(Received::Timeout),
                Ok(None) => return Ok(Received::Closed),
                Ok(Some(Ok(Message::Text(txt)))) => {
                    return Ok(Received::Frame(decode_frame(&txt)))
                }
                Ok(Some(Ok(Message::Close(_)))) => return Ok(Received::Closed),
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(e.into()),
            }
        }
    }

    /// Close the connection, ignoring errors from an already-gone peer.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
