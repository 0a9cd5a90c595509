//! WebSocket connectors for the relay and the trust authority.

use anyhow::{bail, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_common::{
    decode_frame, encode_frame, AuthorityRequest, AuthorityResponse, Certificate, ClientFrame,
    RelayFrame,
};
use tokio::net::TcpStream;
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why no frame could be received.
#[derive(Debug, Error)]
pub enum RecvError {
    /// The peer closed the stream. Nothing more will arrive.
    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] tungstenite::Error),

    /// One bad frame; the connection is still usable.
    #[error(transparent)]
    InvalidFrame(#[from] tessera_common::Error),
}

impl RecvError {
    /// Whether the connection is gone.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidFrame(_))
    }
}

async fn send_json<T: Serialize>(sink: &mut SplitSink<Ws, Message>, value: &T) -> Result<()> {
    let text = encode_frame(value)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn recv_json<T: DeserializeOwned>(stream: &mut SplitStream<Ws>) -> Result<T, RecvError> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => return Ok(decode_frame(text.as_str())?),
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(RecvError::Closed)
}

/// Sending half of a relay connection.
pub struct RelaySender {
    sink: SplitSink<Ws, Message>,
}

impl RelaySender {
    pub async fn send(&mut self, frame: &ClientFrame) -> Result<()> {
        send_json(&mut self.sink, frame).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}

/// Receiving half of a relay connection.
pub struct RelayReceiver {
    stream: SplitStream<Ws>,
}

impl RelayReceiver {
    /// Next frame from the relay.
    ///
    /// A frame that fails to parse is [`RecvError::InvalidFrame`] and the
    /// receiver can keep going.
    pub async fn recv(&mut self) -> Result<RelayFrame, RecvError> {
        recv_json(&mut self.stream).await
    }
}

/// A connection to the relay.
pub struct RelayConnection {
    sender: RelaySender,
    receiver: RelayReceiver,
}

impl RelayConnection {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url).await?;
        let (sink, stream) = ws.split();
        Ok(Self {
            sender: RelaySender { sink },
            receiver: RelayReceiver { stream },
        })
    }

    pub async fn send(&mut self, frame: &ClientFrame) -> Result<()> {
        self.sender.send(frame).await
    }

    pub async fn recv(&mut self) -> Result<RelayFrame, RecvError> {
        self.receiver.recv().await
    }

    /// Split for use from separate tasks or `select!` branches.
    pub fn into_split(self) -> (RelaySender, RelayReceiver) {
        (self.sender, self.receiver)
    }
}

/// A request/response connection to the trust authority.
pub struct AuthorityClient {
    sink: SplitSink<Ws, Message>,
    stream: SplitStream<Ws>,
}

impl AuthorityClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url).await?;
        let (sink, stream) = ws.split();
        Ok(Self { sink, stream })
    }

    async fn call(&mut self, request: &AuthorityRequest) -> Result<AuthorityResponse> {
        send_json(&mut self.sink, request).await?;
        Ok(recv_json(&mut self.stream).await?)
    }

    /// The authority's root public key as SPKI PEM.
    pub async fn fetch_root_key(&mut self) -> Result<String> {
        match self.call(&AuthorityRequest::GetRootKey).await? {
            AuthorityResponse::RootKey { key } => Ok(key),
            AuthorityResponse::Error { message } => bail!("authority error: {message}"),
            other => bail!("unexpected authority response: {other:?}"),
        }
    }

    /// Send a `sign_request` and return the issued certificate.
    pub async fn request_certificate(&mut self, request: &AuthorityRequest) -> Result<Certificate> {
        match self.call(request).await? {
            AuthorityResponse::CertificateIssued { payload } => Ok(payload),
            AuthorityResponse::Error { message } => bail!("authority error: {message}"),
            other => bail!("unexpected authority response: {other:?}"),
        }
    }
}
