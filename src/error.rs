//! Error taxonomy for the bus runtime, sinks, adapters, and router.
//!
//! Configuration errors are programmer mistakes and fail fast at the API
//! boundary. Transport errors propagate to the caller of a send operation.
//! Processing errors wrap whatever a predicate, middleware, or handler raised
//! while dispatching a single envelope.

use crate::envelope::Envelope;

/// Programmer-facing configuration mistakes, detected at registration or
/// connect time rather than during steady-state dispatch.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error(
        "message type '{message_type}' is already registered by handler '{existing}'; \
         only one explicit handler may own a message type"
    )]
    DuplicateMessageType {
        message_type: String,
        existing: String,
    },

    #[error("no target configured for platform '{0}'")]
    UnknownPlatform(String),

    #[error("tcp transport is not implemented; configure a websocket target instead")]
    UnsupportedScheme,

    #[error("envelope is missing message_info.platform")]
    MissingPlatform,
}

/// Errors raised while sending through a transport, or while a transport is
/// not in a usable state.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket transport is not connected")]
    NotConnected,

    #[error("failed to send message: {0}")]
    SendFailed(#[source] anyhow::Error),

    #[error("no client registered for platform '{0}'")]
    NoClient(String),
}

/// Wraps any error raised by a predicate, middleware, or handler while
/// dispatching `envelope`. Error hooks have already run by the time this is
/// constructed (see [`crate::runtime::MessageRuntime::handle_message`]).
#[derive(Debug, thiserror::Error)]
#[error("error processing envelope {}: {source}", self.envelope_id())]
pub struct ProcessingError {
    pub envelope: Envelope,
    #[source]
    pub source: anyhow::Error,
}

impl ProcessingError {
    pub fn new(envelope: Envelope, source: anyhow::Error) -> Self {
        Self { envelope, source }
    }

    fn envelope_id(&self) -> String {
        self.envelope
            .id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    }
}

pub type BusResult<T> = std::result::Result<T, anyhow::Error>;
