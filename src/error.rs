//! Error types.

use std::fmt;
use std::time::Duration;

/// Side of the relay an error relates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// The external SMTP client talking to the proxy.
    Client,
    /// The internal MTA the proxy talks to.
    Mta,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Client => f.write_str("client"),
            Peer::Mta => f.write_str("MTA"),
        }
    }
}

/// Error type for swiftdrop.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("swiftdrop config is invalid: {0}")]
    Config(#[from] serini::Error),
    #[error("destination [{name}] is invalid: {reason}")]
    Destination { name: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no socket activity within {0:?}")]
    SocketTimeout(Duration),
    #[error("socket exception on {peer} side: {source}")]
    SocketError {
        peer: Peer,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} disconnected")]
    PeerDisconnected(Peer),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("MTA rejected {context}: {raw_smtp_answer:?}")]
    MailSend {
        context: String,
        raw_smtp_answer: String,
    },
    #[error("message exceeds maximum size of {0} bytes")]
    MessageTooLarge(usize),
    #[error("recipient <{0}> resolves to no destination")]
    RoutingInvariant(String),
    #[error("did not get recipient")]
    NoRecipients,
    #[error("upload failed for destination(s): {}", failed.join(", "))]
    CaptureSink { failed: Vec<String> },
    #[error("object store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("object store: {0}")]
    Store(String),
}
