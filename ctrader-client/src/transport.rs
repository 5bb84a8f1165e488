//! Frame transport.
//!
//! A connected transport is a pair of channels carrying [`Frame`] values; the
//! wire details stay behind the [`Connector`] seam so tests can substitute an
//! in-process broker. The production connector speaks length-prefixed
//! MessagePack over TCP.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::messages::Frame;

pub const DEMO_HOST: &str = "demo.ctraderapi.com";
pub const LIVE_HOST: &str = "live.ctraderapi.com";
pub const API_PORT: u16 = 5035;

/// Upper bound on a single frame body; anything larger is a protocol error.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const CHANNEL_CAPACITY: usize = 256;

/// A live connection: `tx` carries outbound frames, `rx` inbound ones.
/// The connection is over once `rx` yields `None` or `tx` send fails.
pub struct Transport {
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<Frame>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Transport, ClientError>;
}

/// TCP connector framing MessagePack bodies with a 4-byte big-endian length.
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn demo() -> Self {
        Self::new(DEMO_HOST, API_PORT)
    }

    pub fn live() -> Self {
        Self::new(LIVE_HOST, API_PORT)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Transport, ClientError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| ClientError::Transport(format!("{}:{}: {}", self.host, self.port, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let (mut read_half, mut write_half) = stream.into_split();
        let (in_tx, in_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(CHANNEL_CAPACITY);

        // Writer: serialize outbound frames until the session drops its sender.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let body = match rmp_serde::to_vec_named(&frame) {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::error!("Failed to encode frame: {}", e);
                        continue;
                    }
                };
                let len = (body.len() as u32).to_be_bytes();
                if write_half.write_all(&len).await.is_err()
                    || write_half.write_all(&body).await.is_err()
                {
                    break;
                }
            }
        });

        // Reader: decode inbound frames until the peer closes or the session
        // drops its receiver.
        tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 4];
                if read_half.read_exact(&mut len_buf).await.is_err() {
                    break;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len > MAX_FRAME_BYTES {
                    tracing::error!("Inbound frame of {} bytes exceeds limit, closing", len);
                    break;
                }
                let mut body = vec![0u8; len];
                if read_half.read_exact(&mut body).await.is_err() {
                    break;
                }
                match rmp_serde::from_slice::<Frame>(&body) {
                    Ok(frame) => {
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Dropping undecodable frame: {}", e),
                }
            }
        });

        Ok(Transport {
            tx: out_tx,
            rx: in_rx,
        })
    }
}
