use std::fmt;
use std::time::Duration;

#[derive(Debug)]
pub enum Error {
    Network(std::io::Error),
    Timeout { seq: u32, after: Duration },
    Parse(String),
    QueueExhausted { attempts: u32 },
    Closed,
    Io(std::io::Error),
}

impl Error {
    /// Network and timeout failures are worth another attempt; everything
    /// else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Network(e) => write!(f, "network error: {e}"),
            Error::Timeout { seq, after } => {
                write!(f, "no response to seq {seq} within {}ms", after.as_millis())
            }
            Error::Parse(msg) => write!(f, "parse error: {msg}"),
            Error::QueueExhausted { attempts } => {
                write!(f, "command abandoned after {attempts} attempts")
            }
            Error::Closed => write!(f, "device connection closed"),
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Network(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
