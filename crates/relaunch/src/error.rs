use std::fmt;
use std::io;
use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while assembling a `Config`. These are always fatal:
/// they're caught before a single socket is touched.
#[derive(Debug)]
pub enum ConfigError {
    /// Two entries in `addresses` name the same socket address; binding
    /// would just fail with `EADDRINUSE` later, so this is caught eagerly
    /// with a message that points at the actual mistake.
    DuplicateAddress(SocketAddr),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::DuplicateAddress(addr) => {
                write!(f, "address {} is configured more than once", addr)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug)]
pub enum Error {
    Config(ConfigError),
    Bind(SocketAddr, io::Error),
    SpawnChild(io::Error),
    ExecProbe(io::Error),
    ProbeFailed(String),
    ProbeTimedOut,
    Fetch(String),
    Swap(io::Error),
    Io(io::Error),
    Channel(relaunch_protocol::Error),
    Signal(nix::Error),
    UserProgramPanicked,
    Bootstrap(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(err) => write!(f, "invalid configuration: {}", err),
            Error::Bind(addr, err) => write!(f, "unable to bind {}: {}", addr, err),
            Error::SpawnChild(err) => write!(f, "unable to spawn child: {}", err),
            Error::ExecProbe(err) => write!(f, "unable to execute candidate in probe mode: {}", err),
            Error::ProbeFailed(msg) => write!(f, "candidate failed probe: {}", msg),
            Error::ProbeTimedOut => write!(f, "candidate probe timed out"),
            Error::Fetch(msg) => write!(f, "fetch failed: {}", msg),
            Error::Swap(err) => write!(f, "unable to swap binary on disk: {}", err),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Channel(err) => write!(f, "control channel error: {}", err),
            Error::Signal(err) => write!(f, "signal error: {}", err),
            Error::UserProgramPanicked => write!(f, "user program panicked"),
            Error::Bootstrap(msg) => write!(f, "bootstrap error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(err) => Some(err),
            Error::Bind(_, err) => Some(err),
            Error::SpawnChild(err) => Some(err),
            Error::ExecProbe(err) => Some(err),
            Error::Swap(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Channel(err) => Some(err),
            Error::Signal(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<relaunch_protocol::Error> for Error {
    fn from(err: relaunch_protocol::Error) -> Self {
        Error::Channel(err)
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Signal(err)
    }
}
