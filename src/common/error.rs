use std::{fmt, io, path::PathBuf};

use crate::process::Channel;

#[derive(Debug)]
pub enum Error {
    /// The operation is not allowed while the child process is running.
    AlreadyRunning,
    /// The operation needs a running child process.
    NotRunning,
    /// No executable was configured before starting.
    NoExecutable,
    /// The communication channel was not enabled when the process was started.
    ChannelDisabled(Channel),
    /// A previous stdin write has not been fully transmitted yet.
    WritePending,
    /// The pseudo-terminal is not open.
    PtyNotOpen,
    Io(Option<PathBuf>, io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyRunning => f.write_str("process is already running"),
            Error::NotRunning => f.write_str("process is not running"),
            Error::NoExecutable => f.write_str("no executable was set"),
            Error::ChannelDisabled(channel) => {
                write!(f, "the {channel} channel is not enabled")
            }
            Error::WritePending => f.write_str("a write to stdin is still in progress"),
            Error::PtyNotOpen => f.write_str("pseudo-terminal is not open"),
            Error::Io(location, e) => {
                if let Some(path) = location {
                    write!(f, "'{}': {e}", path.display())
                } else {
                    write!(f, "IO error: {e}")
                }
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(_, e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(None, err)
    }
}

impl Error {
    pub(crate) fn at(path: impl Into<PathBuf>, err: io::Error) -> Self {
        Error::Io(Some(path.into()), err)
    }

    /// Returns `true` if this error is about the state of the process or channel rather than an
    /// operating system failure.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        !matches!(self, Self::Io(..))
    }
}
