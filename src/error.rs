use thiserror::Error;
use crate::line::Leg;

/// Failure reported by a line resource (the kernel line driver boundary).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("line resource rejected {0}")]
    Rejected(&'static str),

    #[error("line resource is gone")]
    Gone,

    #[error("line resource is busy")]
    Busy,

    #[error("operation still in progress")]
    InProgress,
}

impl ResourceError {
    /// Fatal errors mean the line can no longer be read or written.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResourceError::Gone)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubchannelError {
    #[error("{0:?} leg is already allocated")]
    Conflict(Leg),

    #[error("{0:?} leg is not allocated")]
    NotAllocated(Leg),

    #[error("the real leg can only be released by hanging up the line")]
    RealRelease,

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown signalling '{0}'")]
    UnknownSignalling(String),

    #[error("unknown caller id signalling '{0}'")]
    UnknownCidSignalling(String),

    #[error("unknown caller id start '{0}'")]
    UnknownCidStart(String),

    #[error("unknown companding law '{0}'")]
    UnknownLaw(String),

    #[error("unknown mwi spill type '{0}'")]
    UnknownMwiType(String),

    #[error("invalid distinctive ring pattern: {0}")]
    InvalidPattern(String),

    #[error("line {0} is configured more than once")]
    DuplicateLine(u32),

    #[error("unable to link line {0} to line {1}")]
    InvalidLink(u32, u32),

    #[error("unable to open line {0}: {1}")]
    Open(u32, ResourceError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CidError {
    #[error("caller id checksum mismatch")]
    Checksum,

    #[error("caller id framing error")]
    Framing,

    #[error("caller id message truncated")]
    Truncated,

    #[error("caller id detection timed out")]
    Timeout,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("no such line {0}")]
    NoSuchLine(u32),

    #[error("call is not owned by line {0}")]
    NotOwner(u32),

    #[error("line {0} is busy")]
    LineBusy(u32),

    #[error("line {0} is unavailable")]
    Unavailable(u32),

    #[error("no line available for '{0}'")]
    NoneAvailable(String),

    #[error("invalid line search '{0}'")]
    BadSearch(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("line {0} is contended")]
    Contended(u32),

    #[error(transparent)]
    Subchannel(#[from] SubchannelError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
