use std::sync::mpsc;
use crate::codec::Law;
use crate::error::ResourceError;

/// Hook operations a line resource accepts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HookAction {
    OnHook,
    OffHook,
    /// Apply ringing voltage (station lines).
    Ring,
    /// Remove ringing voltage.
    RingOff,
    Flash,
    Wink,
    /// Seize a trunk. May report `InProgress` while the seize completes.
    Start,
}

/// A discrete event reported by the line driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineEvent {
    OnHook,
    RingOffHook,
    WinkFlash,
    Alarm,
    NoAlarm,
    DialComplete,
    RingerOn,
    RingerOff,
    HookComplete,
    Polarity,
    RingBegin,
    PulseStart,
    EcDisabled,
    DtmfCid,
    Removed,
    NeonMwiActive,
    NeonMwiInactive,
    PulseDigit(char),
    DtmfDown(char),
    DtmfUp(char),
}

/// Built-in tones of the line driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tone {
    Ringback,
    Busy,
    Congestion,
    DialTone,
    DialRecall,
    Stutter,
    Info,
}

/// How a resource takes part in a hardware conference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfMode {
    /// Not conferenced.
    Normal,
    /// Talker and listener.
    Conference,
    /// The line's own audio plus the conference mix.
    RealAndPseudo,
    Talker,
    Listener,
    /// Bridged directly to another line.
    DigitalMonitor,
    Mute,
}

/// Conference membership request. A missing slot asks the device for a new one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConfRequest {
    pub slot: Option<u32>,
    pub mode: ConfMode,
}

impl ConfRequest {
    pub fn leave() -> Self {
        Self { slot: None, mode: ConfMode::Normal }
    }
}

/// Software gain settings applied to a resource.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct Gains {
    pub rx_gain: f32,
    pub tx_gain: f32,
    pub rx_drc: f32,
    pub tx_drc: f32,
}

/// One open handle onto a line, or onto a pseudo channel.
pub trait LineResource: Send {
    fn set_hook(&mut self, action: HookAction) -> Result<(), ResourceError>;

    /// Whether the far side is off hook (the phone on a station line, the loop on a trunk).
    fn is_off_hook(&self) -> Result<bool, ResourceError>;

    /// Next pending event, if any.
    fn get_event(&mut self) -> Result<Option<LineEvent>, ResourceError>;

    fn law(&self) -> Law;

    fn set_law(&mut self, law: Law) -> Result<(), ResourceError>;

    /// Sets conference membership and returns the slot actually joined (0 when leaving).
    fn set_conf(&mut self, request: ConfRequest) -> Result<u32, ResourceError>;

    /// Switches between linear and companded samples. Returns the previous mode.
    fn set_linear(&mut self, linear: bool) -> Result<bool, ResourceError>;

    fn set_gains(&mut self, gains: &Gains) -> Result<(), ResourceError>;

    /// Enables the echo canceller with the given taps, or disables it.
    fn set_echo_cancel(&mut self, taps: Option<u32>) -> Result<(), ResourceError>;

    fn train_echo_canceller(&mut self, ms: u32) -> Result<(), ResourceError>;

    /// Plays a built-in tone; `None` stops whatever is playing.
    fn play_tone(&mut self, tone: Option<Tone>) -> Result<(), ResourceError>;

    /// Reverses (or restores) loop polarity towards a station.
    fn set_polarity(&mut self, reversed: bool) -> Result<(), ResourceError>;

    /// Sends a dial string. `T`/`P`/`M` select tone, pulse or MF; `w` pauses.
    fn dial(&mut self, digits: &str) -> Result<(), ResourceError>;

    fn is_dialing(&self) -> bool;

    /// Reads one frame of companded samples into `buf`, returning the count.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ResourceError>;

    /// Writes companded samples, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, ResourceError>;

    /// Selects a distinctive ring cadence; `None` is the default ring.
    fn set_cadence(&mut self, cadence: Option<usize>) -> Result<(), ResourceError>;
}

/// The line driver: opens lines and pseudo channels.
pub trait LineDevice: Send + Sync {
    /// Opens a physical line. The device rings `doorbell` with the line number
    /// whenever the line has an event or audio to process.
    fn open(&self, line: u32, doorbell: mpsc::Sender<u32>) -> Result<Box<dyn LineResource>, ResourceError>;

    /// Opens a pseudo channel for a call waiting or three-way leg.
    fn open_pseudo(&self) -> Result<Box<dyn LineResource>, ResourceError>;
}
