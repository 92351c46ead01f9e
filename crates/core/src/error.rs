//! Error types for the streaming output.

use std::fmt;

/// Errors that can occur while configuring or running a streaming output.
///
/// Variants fall into three groups:
///
/// - **Configuration**: [`UnsupportedCodec`](Self::UnsupportedCodec),
///   [`InvalidFormat`](Self::InvalidFormat),
///   [`UnsupportedProtocol`](Self::UnsupportedProtocol),
///   [`PortConflict`](Self::PortConflict), [`InvalidMtu`](Self::InvalidMtu),
///   [`InvalidConfig`](Self::InvalidConfig). Returned synchronously when a
///   stream or session is created; they fail that call only.
/// - **Transport**: [`Io`](Self::Io), [`SessionClosed`](Self::SessionClosed).
///   Per-sink send failures are handled inside the session and never
///   surface here.
/// - **Protocol**: [`Parse`](Self::Parse), [`MountNotFound`](Self::MountNotFound).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No RTP payload format exists for this codec.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// The codec is known but the stream parameters cannot be carried
    /// (e.g. a G.726 bitrate outside 16/24/32/40 kbit/s).
    #[error("invalid stream format: {0}")]
    InvalidFormat(String),

    /// The requested transport protocol has no sink implementation.
    #[error("unsupported transport protocol: {0}")]
    UnsupportedProtocol(String),

    /// RTP must use an even port when RTCP takes the next one.
    #[error("RTP port {0} is odd and rtcp-mux is disabled")]
    PortConflict(u16),

    /// The MTU leaves no room for payload after headers.
    #[error("MTU {0} is too small")]
    InvalidMtu(usize),

    /// Any other rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session or serializer has been destroyed.
    #[error("session closed")]
    SessionClosed,

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// No handler registered at the requested path.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// A listener or server was started twice.
    #[error("already running")]
    AlreadyRunning,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number.
    InvalidContentLength,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
        }
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
