pub mod config;
pub mod error_handler;
pub mod frame_codec;
pub mod mllp_client;

mod lib;

pub use config::{MalformedFramePolicy, RuntimeConfig};
pub use lib::{run_with_reconnect, stream_messages, ConnectionState, StreamError};
pub use mllp_client::{MllpConnection, TransportError};
