//! Signalling core for analog telephone lines: hook, flash and ring handling,
//! call waiting and three-way calling on three multiplexed legs, hardware
//! conferencing, Caller ID and visual message waiting.

pub mod callerid;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod line;
pub mod monitor;
pub mod mwi;
pub mod registry;
pub mod signalling;

pub use crate::config::{load_config, parse_config, DriverConfig};
pub use crate::engine::Env;
pub use crate::error::{ConfigError, EngineError};
pub use crate::host::{CallControl, CallId, CallState, HostAction, Indication, MessageStore};
pub use crate::line::{Leg, Line};
pub use crate::monitor::Monitor;
pub use crate::registry::{Registry, Requested, Search};
