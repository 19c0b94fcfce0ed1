//! Transient-versus-terminal classification of I/O and media errors.

use std::io;

use symphonia::core::errors::Error as SymphoniaError;

/// I/O error kinds worth retrying: the source may come back.
pub fn is_transient_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Whether anything in the error chain is a transient I/O failure.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            return is_transient_kind(io.kind());
        }
        matches!(
            cause.downcast_ref::<SymphoniaError>(),
            Some(SymphoniaError::IoError(io)) if is_transient_kind(io.kind())
        )
    })
}

/// How a packet read ended the decode loop.
#[derive(Debug)]
pub(crate) enum StreamEnd {
    EndOfStream,
    Transient(SymphoniaError),
    Fatal(SymphoniaError),
}

impl StreamEnd {
    pub(crate) fn from_read_error(err: SymphoniaError) -> Self {
        match &err {
            SymphoniaError::IoError(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                StreamEnd::EndOfStream
            }
            SymphoniaError::IoError(io) if is_transient_kind(io.kind()) => {
                StreamEnd::Transient(err)
            }
            _ => StreamEnd::Fatal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn network_kinds_are_transient() {
        assert!(is_transient_kind(io::ErrorKind::TimedOut));
        assert!(is_transient_kind(io::ErrorKind::ConnectionReset));
        assert!(!is_transient_kind(io::ErrorKind::NotFound));
        assert!(!is_transient_kind(io::ErrorKind::InvalidData));
    }

    #[test]
    fn wrapped_io_errors_are_found_in_chain() {
        let err = anyhow::Error::new(io::Error::new(io::ErrorKind::TimedOut, "slow"))
            .context("open source");
        assert!(is_transient(&err));

        let err: anyhow::Result<()> =
            Err(SymphoniaError::IoError(io::Error::from(io::ErrorKind::ConnectionReset)))
                .context("probe");
        assert!(is_transient(&err.unwrap_err()));
    }

    #[test]
    fn format_errors_are_terminal() {
        let err = anyhow::Error::new(SymphoniaError::Unsupported("codec"));
        assert!(!is_transient(&err));
        let err = anyhow::anyhow!("no audio stream");
        assert!(!is_transient(&err));
    }

    #[test]
    fn unexpected_eof_ends_the_stream() {
        let end = StreamEnd::from_read_error(SymphoniaError::IoError(io::Error::from(
            io::ErrorKind::UnexpectedEof,
        )));
        assert!(matches!(end, StreamEnd::EndOfStream));
        let end = StreamEnd::from_read_error(SymphoniaError::IoError(io::Error::from(
            io::ErrorKind::TimedOut,
        )));
        assert!(matches!(end, StreamEnd::Transient(_)));
        let end = StreamEnd::from_read_error(SymphoniaError::DecodeError("bad"));
        assert!(matches!(end, StreamEnd::Fatal(_)));
    }
}
