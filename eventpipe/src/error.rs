use thiserror::Error;

pub type Result<T> = std::result::Result<T, NettraceError>;

/// Decoding failures. `InvalidMagic` and `InvalidSerializationHeader` are
/// fatal; everything else is recovered at a block or object boundary.
#[derive(Debug, Error)]
pub enum NettraceError {
    #[error("not a nettrace stream (bad magic)")]
    InvalidMagic,

    #[error("invalid serialization header: {0:?}")]
    InvalidSerializationHeader(String),

    #[error("unexpected end of data")]
    UnexpectedEnd,

    #[error("type back-reference {0} does not resolve")]
    UnknownTypeIndex(u32),

    #[error("malformed {kind}: {message}")]
    MalformedBlock {
        kind: &'static str,
        message: String,
    },

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("malformed {event} payload: {message}")]
    MalformedPayload {
        event: &'static str,
        message: String,
    },
}

impl From<binrw::Error> for NettraceError {
    fn from(err: binrw::Error) -> Self {
        if is_eof(&err) {
            NettraceError::UnexpectedEnd
        } else {
            NettraceError::MalformedEvent(err.to_string())
        }
    }
}

fn is_eof(err: &binrw::Error) -> bool {
    match err {
        binrw::Error::Io(io) => io.kind() == std::io::ErrorKind::UnexpectedEof,
        _ => false,
    }
}
