use crate::stream_core::frame_codec::{encode_frame, FrameDecoder, FramingError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const READ_CHUNK: usize = 4096;

#[derive(Debug)]
pub enum TransportError {
    /// Connect or write failed (refused, reset, timed out)
    Connection(std::io::Error),
    /// Peer closed the stream; `partial` is true if a frame was cut off
    Closed { partial: bool },
    /// Malformed frame; the connection is still usable
    Framing(FramingError),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Connection(err)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connection(e) => write!(f, "Connection error: {}", e),
            TransportError::Closed { partial: true } => {
                write!(f, "Connection closed mid-frame (partial frame discarded)")
            }
            TransportError::Closed { partial: false } => write!(f, "Connection closed by peer"),
            TransportError::Framing(e) => write!(f, "Framing error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

/// One MLLP connection: read a frame, process it, write the ACK, repeat.
///
/// Both operations take `&mut self`, so a connection can never have more
/// than one frame in flight.
pub struct MllpConnection<S> {
    stream: S,
    decoder: FrameDecoder,
    write_timeout: Duration,
}

impl<S> MllpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, write_timeout: Duration) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::default(),
            write_timeout,
        }
    }

    /// Block until a complete frame arrives. Returns the payload without delimiters.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(decoded) = self.decoder.decode() {
                return decoded.map_err(TransportError::Framing);
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                let partial = self.decoder.has_partial();
                self.decoder.clear();
                return Err(TransportError::Closed { partial });
            }
            self.decoder.extend(&chunk[..n]);
        }
    }

    /// Frame and write an acknowledgement in a single write
    pub async fn write_ack(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encode_frame(payload);
        let write = async {
            self.stream.write_all(&frame).await?;
            self.stream.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(TransportError::Connection),
            Err(_) => Err(TransportError::Connection(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "ACK write timed out",
            ))),
        }
    }
}

/// Open the inbound stream. Not self-retrying; see `run_with_reconnect`.
pub async fn connect(
    address: &str,
    connect_timeout: Duration,
    write_timeout: Duration,
) -> Result<MllpConnection<TcpStream>, TransportError> {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(TransportError::Connection(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {} timed out", address),
            )))
        }
    };
    stream.set_nodelay(true)?;
    Ok(MllpConnection::new(stream, write_timeout))
}
