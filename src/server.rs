//! Bundled MLLP server.
//!
//! A small target for the probe: accepts connections, pulls MLLP frames off
//! each one, echoes messages that carry an `MSH` header and answers anything
//! else with a rejection frame. Runs until SIGTERM or ctrl-c.

use crate::mllp::{self, ParseResult};
use crate::shutdown;
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 1024;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Largest frame accepted before the connection is dropped
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Server instance
pub struct Server {
    listen: String,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(listen: impl Into<String>) -> Self {
        Self::with_max_connections(listen, MAX_CONNECTIONS)
    }

    /// Create a server that holds at most `max_connections` open at once
    pub fn with_max_connections(listen: impl Into<String>, max_connections: usize) -> Self {
        Server {
            listen: listen.into(),
            connection_limit: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Serve until SIGTERM or ctrl-c
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.listen).await?;
        info!(address = %self.listen, "MLLP server listening");
        self.serve(listener, shutdown::requested()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves
    pub async fn serve<F>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot; shutdown still wins while all are taken
            let permit = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, MLLP server exiting");
                    return Ok(());
                }
                permit = self.connection_limit.clone().acquire_owned() => permit?,
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, MLLP server exiting");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(peer = %addr, "New connection");
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream).await {
                                debug!(peer = %addr, error = %e, "Connection error");
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(
    mut stream: TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            // Connection closed
            trace!("Connection closed by client");
            return Ok(());
        }

        loop {
            // Skip anything before the next start block
            match buffer.iter().position(|&b| b == mllp::codec::START_BLOCK) {
                Some(0) => {}
                Some(pos) => {
                    debug!(skipped = pos, "Discarding bytes before start block");
                    buffer.advance(pos);
                }
                None => {
                    buffer.clear();
                    break;
                }
            }

            match mllp::try_extract(&buffer) {
                ParseResult::Complete(payload, consumed) => {
                    buffer.advance(consumed);
                    trace!(bytes = payload.len(), "Received frame");
                    let reply = respond(&payload);
                    stream.write_all(&mllp::encode(&reply)).await?;
                }
                ParseResult::Incomplete if buffer.len() > MAX_FRAME_SIZE => {
                    warn!(buffered = buffer.len(), "Frame too large, closing connection");
                    return Ok(());
                }
                ParseResult::Incomplete => break,
                // Cannot happen after the resync above
                ParseResult::Malformed => {
                    buffer.clear();
                    break;
                }
            }
        }
    }
}

/// Build the reply payload for one received message
fn respond(payload: &[u8]) -> Vec<u8> {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Received non-UTF-8 message");
            return rejection("UNKNOWN", "message is not valid UTF-8").into_bytes();
        }
    };

    if text.starts_with("MSH|") {
        info!(bytes = payload.len(), control_id = control_id(text), "Echoing message");
        payload.to_vec()
    } else {
        let header = text.get(..3).unwrap_or(text);
        warn!(header, "Rejecting message without MSH header");
        rejection(control_id(text), "first segment is not MSH").into_bytes()
    }
}

/// Message control id (tenth field of the first segment)
fn control_id(message: &str) -> &str {
    message
        .split(['\r', '\n'])
        .next()
        .and_then(|segment| segment.split('|').nth(9))
        .filter(|id| !id.is_empty())
        .unwrap_or("UNKNOWN")
}

/// Rejection message for `control_id`
fn rejection(control_id: &str, reason: &str) -> String {
    let now = chrono::Local::now().format("%Y%m%d%H%M%S");
    format!(
        "MSH|^~\\&|RECEIVING_APP|RECEIVING_FACILITY|SENDING_APP|SENDING_FACILITY|{now}||ACK|{control_id}|P|2.5\r\
         MSA|AR|{control_id}|{reason}"
    )
}
