use crate::pipeline::engine::MessageEngine;
use crate::pipeline::errors::EngineError;
use crate::pipeline::hl7::AckCode;
use crate::pipeline::metrics::{CONNECTION_CLOSED, MALFORMED_FRAMES, REQUEST_LATENCY};
use crate::pipeline::pager::LATENCY_BUDGET;
use crate::stream_core::{
    config::{MalformedFramePolicy, RuntimeConfig},
    error_handler::{ExponentialBackoff, MaxRetriesExceeded},
    frame_codec::FramingError,
    mllp_client::{connect, MllpConnection, TransportError},
};
use metrics::{histogram, increment_counter};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Streaming => "STREAMING",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
pub enum StreamError {
    Transport(TransportError),
    /// Processing failed in a way that forbids acknowledging; the stream halts
    Engine(EngineError),
    MaxRetries,
}

impl From<TransportError> for StreamError {
    fn from(err: TransportError) -> Self {
        StreamError::Transport(err)
    }
}

impl From<EngineError> for StreamError {
    fn from(err: EngineError) -> Self {
        StreamError::Engine(err)
    }
}

impl From<MaxRetriesExceeded> for StreamError {
    fn from(_: MaxRetriesExceeded) -> Self {
        StreamError::MaxRetries
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Transport(e) => write!(f, "Transport error: {}", e),
            StreamError::Engine(e) => write!(f, "Stream halted: {}", e),
            StreamError::MaxRetries => write!(f, "Maximum reconnect attempts exceeded"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Read, process and acknowledge frames until the connection ends.
///
/// Every frame the peer sent gets exactly one ACK (or none under
/// `MalformedFramePolicy::Drop`). Bytes outside of any frame are logged and
/// skipped without a reply. Returns Ok on a clean peer close. A partial frame, a dead socket or an
/// engine failure is an error; in the engine case the failing frame is not
/// acknowledged.
pub async fn stream_messages<S>(
    conn: &mut MllpConnection<S>,
    engine: &MessageEngine,
    policy: MalformedFramePolicy,
) -> Result<(), StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let payload = match conn.read_frame().await {
            Ok(payload) => payload,
            Err(TransportError::Framing(FramingError::UnexpectedBytes(n))) => {
                log::warn!("Skipped {} bytes outside of a frame", n);
                continue;
            }
            Err(TransportError::Framing(e)) => {
                increment_counter!(MALFORMED_FRAMES);
                match policy {
                    MalformedFramePolicy::Acknowledge => {
                        log::warn!("Malformed frame ({}), replying AR", e);
                        conn.write_ack(engine.ack(AckCode::Reject).as_bytes()).await?;
                    }
                    MalformedFramePolicy::Drop => {
                        log::warn!("Malformed frame ({}), dropped", e);
                    }
                }
                continue;
            }
            Err(TransportError::Closed { partial }) => {
                increment_counter!(CONNECTION_CLOSED);
                if partial {
                    return Err(TransportError::Closed { partial }.into());
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let received_at = Instant::now();
        let outcome = engine.handle_frame(&payload, received_at).await?;
        conn.write_ack(engine.ack(outcome.ack_code()).as_bytes()).await?;

        let elapsed = received_at.elapsed();
        histogram!(REQUEST_LATENCY, elapsed.as_secs_f64());
        if elapsed > LATENCY_BUDGET {
            log::warn!(
                "Message took {}ms, over the {}s budget ({:?})",
                elapsed.as_millis(),
                LATENCY_BUDGET.as_secs(),
                outcome
            );
        }
    }
}

/// Connection state machine: connect, stream, and reconnect with backoff.
///
/// Only returns on an engine failure or once reconnect attempts run out.
pub async fn run_with_reconnect(
    config: &RuntimeConfig,
    engine: &MessageEngine,
) -> Result<(), StreamError> {
    let mut backoff = ExponentialBackoff::new(
        config.reconnect_initial_delay,
        config.reconnect_max_delay,
        config.reconnect_max_retries,
    );
    let mut state = ConnectionState::Disconnected;

    loop {
        transition(&mut state, ConnectionState::Connecting);
        log::info!("Connecting to MLLP stream at {}", config.mllp_address);

        match connect(
            &config.mllp_address,
            config.connect_timeout,
            config.ack_write_timeout,
        )
        .await
        {
            Ok(mut conn) => {
                transition(&mut state, ConnectionState::Streaming);
                backoff.reset();

                match stream_messages(&mut conn, engine, config.malformed_frame_policy).await {
                    Ok(()) => log::warn!("MLLP peer closed the connection"),
                    Err(StreamError::Transport(e)) => log::warn!("MLLP connection lost: {}", e),
                    Err(e) => {
                        log::error!("{}", e);
                        return Err(e);
                    }
                }
                transition(&mut state, ConnectionState::Disconnected);
            }
            Err(e) => {
                log::error!("Connection to {} failed: {}", config.mllp_address, e);
                transition(&mut state, ConnectionState::Disconnected);
            }
        }

        backoff.sleep().await?;
    }
}

fn transition(state: &mut ConnectionState, next: ConnectionState) {
    if *state != next {
        log::info!("{} -> {}", state, next);
        *state = next;
    }
}
