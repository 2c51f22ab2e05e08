use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::domain::UserId;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Send(Vec<u8>),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Data(Vec<u8>),
    Closed(Option<CloseInfo>),
    Error(String),
}

/// An open byte pipe. Dropping `commands` closes the connection.
pub struct TransportConnection {
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: ConnectRequest) -> Result<TransportConnection, TransportError>;
}

/// Builds the websocket endpoint for `server_url` (`http(s)` becomes `ws(s)`).
pub fn ws_url_for(server_url: &str, user_id: UserId) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(server_url).map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{other}' in {server_url}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(format!("cannot use scheme {scheme}")))?;
    url.path_segments_mut()
        .map_err(|_| TransportError::InvalidUrl(format!("{server_url} cannot be a base")))?
        .pop_if_empty()
        .push("ws");
    url.query_pairs_mut()
        .append_pair("user_id", &user_id.0.to_string());
    Ok(url)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, request: ConnectRequest) -> Result<TransportConnection, TransportError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| TransportError::Connect(format!("invalid header name: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| TransportError::Connect(format!("invalid header value: {err}")))?;
            ws_request.headers_mut().insert(name, value);
        }

        let (ws_stream, _) = connect_async(ws_request)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        debug!(url = %request.url, "websocket connected");
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let writer_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    TransportCommand::Send(bytes) => {
                        let message = match String::from_utf8(bytes) {
                            Ok(text) => Message::Text(text),
                            Err(err) => Message::Binary(err.into_bytes()),
                        };
                        if let Err(err) = ws_writer.send(message).await {
                            warn!("websocket send failed: {err}");
                            let _ = writer_events.send(TransportEvent::Error(err.to_string()));
                            break;
                        }
                    }
                    TransportCommand::Close => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let _ = event_tx.send(TransportEvent::Data(text.into_bytes()));
                    }
                    Ok(Message::Binary(bytes)) => {
                        let _ = event_tx.send(TransportEvent::Data(bytes));
                    }
                    Ok(Message::Close(frame)) => {
                        let info = frame.map(|frame| CloseInfo {
                            code: u16::from(frame.code),
                            reason: frame.reason.to_string(),
                        });
                        let _ = event_tx.send(TransportEvent::Closed(info));
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = event_tx.send(TransportEvent::Error(err.to_string()));
                        return;
                    }
                }
            }
            let _ = event_tx.send(TransportEvent::Closed(None));
        });

        Ok(TransportConnection {
            commands: command_tx,
            events: event_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
