use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::AppError;

fn ws_error(e: tungstenite::Error) -> AppError {
    AppError::WebSocket(e.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    Text(String),
    /// Protocol-level traffic (ping, pong, binary). Proves liveness, carries no tick.
    Control,
}

/// One open connection to the market-data source.
pub trait FeedTransport: Send {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>>;

    /// Next inbound message. `None` once the peer has closed the stream.
    /// Must be cancel-safe: it is polled inside `select!`.
    fn next_message(&mut self) -> BoxFuture<'_, Option<Result<FeedMessage>>>;

    /// Best-effort close; never fails.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub trait FeedConnector: Send + Sync + 'static {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Box<dyn FeedTransport>>>;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl FeedConnector for WsConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Box<dyn FeedTransport>>> {
        async move {
            let (stream, _resp) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(ws_error)
                .with_context(|| format!("connect to {} failed", url))?;
            Ok(Box::new(WsTransport { stream }) as Box<dyn FeedTransport>)
        }
        .boxed()
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl FeedTransport for WsTransport {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>> {
        async move {
            self.stream
                .send(tungstenite::Message::Text(text))
                .await
                .map_err(ws_error)
                .context("send failed")
        }
        .boxed()
    }

    fn next_message(&mut self) -> BoxFuture<'_, Option<Result<FeedMessage>>> {
        async move {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => Some(Ok(FeedMessage::Text(text))),
                // tokio-tungstenite queues the pong reply for ping frames itself.
                Ok(tungstenite::Message::Close(_)) => None,
                Ok(_) => Some(Ok(FeedMessage::Control)),
                Err(e) => Some(Err(ws_error(e).into())),
            }
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        async move {
            if let Err(e) = self.stream.close(None).await {
                tracing::debug!(error = %e, "WebSocket close failed");
            }
        }
        .boxed()
    }
}
