//! TCP server for the orchestration RPC
//!
//! Every connection is served on its own task. Requests on one connection are
//! answered in order, one response line per request line.

use super::protocol::{Response, RpcHandler};
use crate::error::{KeelError, Result};
use futures::StreamExt;
use serde_json::Value;
use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

/// Default listening address
pub const DEFAULT_BIND_ADDRESS: &str = "tcp://0.0.0.0:4242";

/// Longest request line accepted, in bytes
pub const MAX_REQUEST_LINE: usize = 8 * 1024 * 1024;

/// RPC server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: SocketAddr,
    /// Connections sending a longer line are answered with an error and closed
    pub max_line_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 4242)),
            max_line_length: MAX_REQUEST_LINE,
        }
    }
}

impl ServerConfig {
    pub fn from_address(address: &str) -> Result<Self> {
        Ok(Self {
            bind: parse_bind_address(address)?,
            ..Self::default()
        })
    }
}

/// Parse `tcp://host:port` (or a bare `host:port`)
pub fn parse_bind_address(address: &str) -> Result<SocketAddr> {
    let trimmed = address.strip_prefix("tcp://").unwrap_or(address);
    if trimmed.contains("://") {
        return Err(KeelError::InvalidParams(format!(
            "unsupported bind address: {}",
            address
        )));
    }
    trimmed
        .parse()
        .map_err(|e| KeelError::InvalidParams(format!("invalid bind address {}: {}", address, e)))
}

pub struct RpcServer {
    listener: TcpListener,
    handler: RpcHandler,
    max_line_length: usize,
}

impl RpcServer {
    pub async fn bind(config: &ServerConfig, handler: RpcHandler) -> Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        Ok(Self {
            listener,
            handler,
            max_line_length: config.max_line_length,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> Result<()> {
        info!("Listening on tcp://{}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Connection from {}", peer);
                    let handler = self.handler.clone();
                    let max_line_length = self.max_line_length;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler, max_line_length).await {
                            error!("Error handling connection from {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, handler: RpcHandler, max_line_length: usize) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_length));

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("Request line exceeds {} bytes, closing connection", max_line_length);
                let e = KeelError::InvalidParams(format!(
                    "request line exceeds {} bytes",
                    max_line_length
                ));
                write_response(&mut writer, &Response::error(Value::Null, &e)).await?;
                return Ok(());
            }
            Err(LinesCodecError::Io(e)) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = handler.handle_line(&line).await;
        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
    let mut body = serde_json::to_vec(response)?;
    body.push(b'\n');
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
