//! MLLP transport client.
//!
//! Each exchange opens its own TCP connection, sends one framed payload, and
//! reads until a complete frame arrives, the peer closes, or the read window
//! runs out. No state is shared between exchanges.

use crate::mllp::{self, ParseResult};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

/// Read chunk size
const READ_CHUNK_SIZE: usize = 4096;

/// Outcome of one send/receive cycle
#[derive(Debug)]
pub enum ExchangeResult {
    /// A well-formed frame came back
    Complete { payload: Bytes },
    /// Bytes came back but they do not form a frame
    Malformed { raw: Bytes },
    /// The peer closed without sending anything
    NoResponse,
    /// No complete frame inside the read window
    Timeout { received: Bytes },
    /// The connection could not be established or broke mid-exchange
    ConnectionFailure { cause: std::io::Error },
}

impl ExchangeResult {
    /// Stable label for reports and logs
    pub fn category(&self) -> &'static str {
        match self {
            ExchangeResult::Complete { .. } => "complete",
            ExchangeResult::Malformed { .. } => "malformed-frame",
            ExchangeResult::NoResponse => "no-response",
            ExchangeResult::Timeout { .. } => "timeout",
            ExchangeResult::ConnectionFailure { .. } => "connection-failure",
        }
    }

    /// Payload of a complete frame decoded as UTF-8.
    ///
    /// Returns `None` for every other outcome. A decoding failure is only a
    /// display concern; the raw payload stays authoritative.
    pub fn text(&self) -> Option<Result<&str, std::str::Utf8Error>> {
        match self {
            ExchangeResult::Complete { payload } => Some(std::str::from_utf8(payload)),
            _ => None,
        }
    }
}

impl fmt::Display for ExchangeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeResult::Complete { payload } => {
                write!(f, "complete frame ({} bytes)", payload.len())
            }
            ExchangeResult::Malformed { raw } => {
                write!(f, "malformed frame ({} bytes): {:?}", raw.len(), raw)
            }
            ExchangeResult::NoResponse => write!(f, "no response received"),
            ExchangeResult::Timeout { received } => {
                write!(f, "timed out after {} bytes without a complete frame", received.len())
            }
            ExchangeResult::ConnectionFailure { cause } => {
                write!(f, "connection failure: {cause}")
            }
        }
    }
}

/// Client settings shared by every exchange
#[derive(Debug, Clone)]
pub struct Client {
    host: String,
    port: u16,
    read_timeout: Duration,
    max_response_bytes: usize,
}

impl Client {
    /// Create a client targeting `host:port`
    pub fn new(host: impl Into<String>, port: u16, read_timeout: Duration) -> Self {
        Client {
            host: host.into(),
            port,
            read_timeout,
            max_response_bytes: usize::MAX,
        }
    }

    /// Cap on buffered response bytes before giving up on finding a frame
    pub fn with_max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }

    /// Send one payload on a fresh connection and collect the reply.
    ///
    /// Connecting, writing and reading all share one deadline of
    /// `read_timeout`. The connection is dropped on every return path.
    pub async fn exchange(&self, payload: &[u8]) -> ExchangeResult {
        let deadline = Instant::now() + self.read_timeout;
        let addr = (self.host.as_str(), self.port);

        let stream = match timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(cause)) => {
                debug!(host = %self.host, port = self.port, error = %cause, "Connect failed");
                return ExchangeResult::ConnectionFailure { cause };
            }
            Err(_) => {
                return ExchangeResult::ConnectionFailure {
                    cause: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ),
                }
            }
        };

        debug!(host = %self.host, port = self.port, "Connected");
        exchange_on(stream, payload, deadline, self.max_response_bytes).await
    }
}

/// Run one exchange over an established stream.
///
/// Takes ownership of the stream so it is closed when this returns.
pub async fn exchange_on<S>(
    mut stream: S,
    payload: &[u8],
    deadline: Instant,
    max_response_bytes: usize,
) -> ExchangeResult
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = mllp::encode(payload);
    match timeout_at(deadline, stream.write_all(&frame)).await {
        Ok(Ok(())) => trace!(bytes = frame.len(), "Sent frame"),
        Ok(Err(cause)) => return ExchangeResult::ConnectionFailure { cause },
        Err(_) => {
            return ExchangeResult::Timeout {
                received: Bytes::new(),
            }
        }
    }

    let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);

    loop {
        buffer.reserve(READ_CHUNK_SIZE);
        let mut chunk = (&mut stream).take(READ_CHUNK_SIZE as u64);
        let n = match timeout_at(deadline, chunk.read_buf(&mut buffer)).await {
            Ok(Ok(n)) => n,
            Ok(Err(cause)) => return ExchangeResult::ConnectionFailure { cause },
            Err(_) => return classify_at_deadline(buffer),
        };

        if n == 0 {
            // Connection closed
            trace!(buffered = buffer.len(), "Connection closed by peer");
            return classify_at_eof(buffer);
        }

        trace!(bytes = n, buffered = buffer.len(), "Read chunk");

        match mllp::try_extract(&buffer) {
            ParseResult::Complete(payload, _) => return ExchangeResult::Complete { payload },
            ParseResult::Malformed => {
                return ExchangeResult::Malformed {
                    raw: buffer.freeze(),
                }
            }
            ParseResult::Incomplete if buffer.len() > max_response_bytes => {
                debug!(buffered = buffer.len(), "Response exceeds limit without a frame");
                return ExchangeResult::Malformed {
                    raw: buffer.freeze(),
                };
            }
            ParseResult::Incomplete => {}
        }
    }
}

/// The read window closed: a frame ending in a bare end block still counts
fn classify_at_deadline(buffer: BytesMut) -> ExchangeResult {
    match mllp::try_extract_final(&buffer) {
        ParseResult::Complete(payload, _) => ExchangeResult::Complete { payload },
        _ => ExchangeResult::Timeout {
            received: buffer.freeze(),
        },
    }
}

fn classify_at_eof(buffer: BytesMut) -> ExchangeResult {
    if buffer.is_empty() {
        return ExchangeResult::NoResponse;
    }
    match mllp::try_extract_final(&buffer) {
        ParseResult::Complete(payload, _) => ExchangeResult::Complete { payload },
        _ => ExchangeResult::Malformed {
            raw: buffer.freeze(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;

    const MSG: &[u8] = b"MSH|^~\\&|APP|FAC|RCV|RFAC|20230401123000||ADT^A01|MSG00001|P|2.5";

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_complete_response() {
        let frame = mllp::encode(MSG);
        let mock = Builder::new().write(&frame).read(&frame).build();

        let result = exchange_on(mock, MSG, deadline(), usize::MAX).await;
        match result {
            ExchangeResult::Complete { payload } => assert_eq!(&payload[..], MSG),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_split_across_reads() {
        let frame = mllp::encode(MSG);
        let (head, tail) = frame.split_at(10);
        let (mid, end) = tail.split_at(tail.len() - 1);
        let mock = Builder::new()
            .write(&frame)
            .read(head)
            .read(mid)
            .read(end)
            .build();

        let result = exchange_on(mock, MSG, deadline(), usize::MAX).await;
        assert_eq!(result.category(), "complete");
        assert!(result.text().unwrap().unwrap().starts_with("MSH|"));
    }

    #[tokio::test]
    async fn test_no_response() {
        let mock = Builder::new().write(&mllp::encode(MSG)).build();
        let result = exchange_on(mock, MSG, deadline(), usize::MAX).await;
        assert!(matches!(result, ExchangeResult::NoResponse));
    }

    #[tokio::test]
    async fn test_malformed_start() {
        let mock = Builder::new()
            .write(&mllp::encode(MSG))
            .read(b"HTTP/1.1 400 Bad Request\r\n")
            .build();

        match exchange_on(mock, MSG, deadline(), usize::MAX).await {
            ExchangeResult::Malformed { raw } => assert!(raw.starts_with(b"HTTP/1.1")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_frame_then_close() {
        let mock = Builder::new()
            .write(&mllp::encode(MSG))
            .read(b"\x0bMSH|truncated")
            .build();

        match exchange_on(mock, MSG, deadline(), usize::MAX).await {
            ExchangeResult::Malformed { raw } => assert_eq!(&raw[..], b"\x0bMSH|truncated"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bare_end_block_then_close() {
        let mock = Builder::new()
            .write(&mllp::encode(MSG))
            .read(b"\x0bMSH|ok\x1c")
            .build();

        match exchange_on(mock, MSG, deadline(), usize::MAX).await {
            ExchangeResult::Complete { payload } => assert_eq!(&payload[..], b"MSH|ok"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_limit() {
        let mock = Builder::new()
            .write(&mllp::encode(MSG))
            .read(b"\x0b0123456789abcdef")
            .build();

        let result = exchange_on(mock, MSG, deadline(), 8).await;
        assert_eq!(result.category(), "malformed-frame");
    }

    #[tokio::test]
    async fn test_read_error_is_connection_failure() {
        let mock = Builder::new()
            .write(&mllp::encode(MSG))
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))
            .build();

        match exchange_on(mock, MSG, deadline(), usize::MAX).await {
            ExchangeResult::ConnectionFailure { cause } => {
                assert_eq!(cause.kind(), std::io::ErrorKind::ConnectionReset)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_utf8_payload_stays_complete() {
        let reply = mllp::encode(&[0xff, 0xfe, b'M']);
        let mock = Builder::new().write(&mllp::encode(MSG)).read(&reply).build();

        let result = exchange_on(mock, MSG, deadline(), usize::MAX).await;
        assert_eq!(result.category(), "complete");
        assert!(result.text().unwrap().is_err());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port with no listener
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = Client::new("127.0.0.1", port, Duration::from_secs(2));
        let result = client.exchange(MSG).await;
        assert_eq!(result.category(), "connection-failure");
    }

    #[tokio::test]
    async fn test_timeout_when_peer_stays_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await;
            // Hold the connection open past the client's window
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let client = Client::new("127.0.0.1", port, Duration::from_millis(200));
        let result = client.exchange(MSG).await;
        assert_eq!(result.category(), "timeout");
        server.abort();
    }

    #[tokio::test]
    async fn test_bare_end_block_on_open_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(b"\x0bMSH|reply\x1c").await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
        });

        let client = Client::new("127.0.0.1", port, Duration::from_millis(500));
        match client.exchange(MSG).await {
            ExchangeResult::Complete { payload } => assert_eq!(&payload[..], b"MSH|reply"),
            other => panic!("unexpected: {:?}", other),
        }
        server.abort();
    }

    #[tokio::test]
    async fn test_frame_ends_loop_while_peer_keeps_connection_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(&mllp::encode(b"MSH|reply")).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = Client::new("127.0.0.1", port, Duration::from_secs(3));
        let started = std::time::Instant::now();
        let result = client.exchange(MSG).await;
        assert_eq!(result.category(), "complete");
        assert!(started.elapsed() < Duration::from_secs(3));
        server.abort();
    }
}
