//! Error types for the bot runtime and the RTM client.

use thiserror::Error;

/// Request- and subscription-level error taxonomy of the RTM client.
///
/// These are reported to per-request and per-subscription callbacks and
/// carried on the shared error channel; they never carry payloads so they can
/// cross restart boundaries freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorKind {
    #[error("unknown error")]
    Unknown,
    #[error("client is not connected")]
    NotConnected,
    #[error("error parsing response")]
    ResponseParsing,
    #[error("invalid response")]
    InvalidResponse,
    #[error("transport error")]
    Transport,
    #[error("invalid message")]
    InvalidMessage,
    #[error("subscription error")]
    Subscription,
    #[error("subscribe error")]
    Subscribe,
    #[error("unsubscribe error")]
    Unsubscribe,
    #[error("publish error")]
    Publish,
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// WebSocket failure anywhere in resolve / connect / TLS / upgrade /
    /// read / write. The resilient wrapper reacts to these by restarting.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Request- or subscription-level failure surfaced to a caller.
    #[error("client error: {0}")]
    Client(ErrorKind),

    /// Wire codec failure (JSON or CBOR encode/decode).
    #[error("wire codec error: {0}")]
    Codec(String),

    /// A channel payload that does not match the expected shape.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Error signalled by the bot's own handlers, carrying the kind of the
    /// event that triggered it. The reactor loop treats these as retryable:
    /// the connection is rebuilt and subscriptions are restored.
    #[error("bot error: {message}")]
    Bot { kind: ErrorKind, message: String },
}

impl Error {
    /// Whether the outer runtime loop should rebuild the connection and keep
    /// going. Anything else breaks the loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WebSocket(_)
                | Error::Io(_)
                | Error::Client(ErrorKind::Transport)
                | Error::Bot { .. }
        )
    }

    /// The client-level kind that best describes this error, used when
    /// reporting it to the resilient wrapper.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) | Error::Io(_) => ErrorKind::Transport,
            Error::Client(kind) => *kind,
            Error::Bot { kind, .. } => *kind,
            Error::Codec(_) => ErrorKind::ResponseParsing,
            Error::InvalidFrame(_) => ErrorKind::InvalidMessage,
            Error::Config(_) => ErrorKind::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_messages() {
        assert_eq!(ErrorKind::NotConnected.to_string(), "client is not connected");
        assert_eq!(ErrorKind::Publish.to_string(), "publish error");
        assert_eq!(ErrorKind::Transport.to_string(), "transport error");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Client(ErrorKind::Transport).is_retryable());
        assert!(Error::Bot {
            kind: ErrorKind::Subscription,
            message: "subscription failure".into(),
        }
        .is_retryable());
        assert!(!Error::Client(ErrorKind::Publish).is_retryable());
        assert!(!Error::Config("missing appkey".into()).is_retryable());
        assert!(!Error::Codec("bad cbor".into()).is_retryable());
    }

    #[test]
    fn test_kind_derivation() {
        assert_eq!(Error::Client(ErrorKind::Publish).kind(), ErrorKind::Publish);
        assert_eq!(
            Error::Bot {
                kind: ErrorKind::Subscription,
                message: "subscription failure".into(),
            }
            .kind(),
            ErrorKind::Subscription
        );
        assert_eq!(Error::Codec("bad cbor".into()).kind(), ErrorKind::ResponseParsing);
        assert_eq!(
            Error::InvalidFrame("missing d".into()).kind(),
            ErrorKind::InvalidMessage
        );
    }
}
