//! The boundary with the host PBX: call identities, call states and the
//! effects the line engine asks the host to carry out.

use std::fmt;
use std::time::Instant;
use std::sync::atomic::{AtomicU64, Ordering};
use crate::callerid::CallerId;
use crate::error::EngineError;
use crate::line::Leg;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a host call attached to one leg of a line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallId(u64);

impl CallId {
    pub fn next() -> Self {
        CallId(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Host-visible state of a call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallState {
    Down,
    /// Off hook, collecting digits.
    Reserved,
    /// Inbound call ringing towards the host.
    Ring,
    /// Outbound call ringing the far end.
    Ringing,
    Dialing,
    /// Second stage dialing after the far end went off hook.
    DialingOffhook,
    Up,
    Busy,
    /// Inbound call detected before the ring proper.
    PreRing,
}

/// A call owned by one leg of a line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallLeg {
    pub id: CallId,
    pub state: CallState,
    /// The host is running a dialplan on this call.
    pub pbx: bool,
    /// Caller id to present when this call rings a station.
    pub caller: Option<CallerId>,
    /// Distinctive ring cadence requested by the host (1-based).
    pub distinctive: Option<usize>,
    /// When the call entered its current state.
    pub since: Instant,
}

impl CallLeg {
    pub fn new(id: CallId, state: CallState) -> Self {
        Self {
            id,
            state,
            pbx: false,
            caller: None,
            distinctive: None,
            since: Instant::now(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.state == CallState::Up
    }
}

/// Control indications delivered to a call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Control {
    Answer,
    Ringing,
    Ring,
    OffHook,
    Busy,
    Congestion,
    Hold,
    Unhold,
    Flash,
    Progress,
}

/// Call progress the host asks the line to signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Indication {
    Busy,
    Congestion,
    Ringing,
    Progress,
    Proceeding,
    Hold,
    Unhold,
    /// Stop whatever tone is playing.
    Stop,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HangupCause {
    Normal,
    Busy,
    Congestion,
    /// The line can no longer be read or written.
    Failure,
}

/// Everything the host needs to create a call for a line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Origination {
    pub call: CallId,
    pub line: u32,
    pub leg: Leg,
    pub state: CallState,
    pub context: String,
    /// Start the dialplan right away instead of collecting digits first.
    pub start_pbx: bool,
}

/// An effect queued by the line engine, delivered once the line lock is released.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostAction {
    Control(CallId, Control),
    Hangup(CallId, HangupCause),
    Originate(Origination),
    Digit { call: CallId, begin: bool, digit: char },
    CallerId { call: CallId, caller: Option<CallerId>, context: Option<String> },
    Transfer { from: CallId, to: CallId, hold: bool },
    Mwi { line: u32, active: bool },
}

/// The host PBX.
pub trait CallControl: Send + Sync {
    /// Creates the host call and spawns its setup context.
    fn originate(&self, origination: &Origination) -> Result<(), EngineError>;

    fn dispatch(&self, action: HostAction);
}

/// Voicemail message store.
pub trait MessageStore: Send + Sync {
    fn message_count(&self, mailbox: &str) -> u32;
}

/// A message store with no messages anywhere.
pub struct NoMessages;

impl MessageStore for NoMessages {
    fn message_count(&self, _mailbox: &str) -> u32 {
        0
    }
}
