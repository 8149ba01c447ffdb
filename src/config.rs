use std::fs;
use std::collections::BTreeSet;
use serde::Deserialize;
use toml;
use crate::error::ConfigError;

#[allow(non_camel_case_types)]
pub type ms = u64;

/// Maximum number of distinctive ring patterns per line.
pub const MAX_RING_PATTERNS: usize = 3;

/// Default tolerance (in milliseconds) for distinctive ring matching.
pub const DEFAULT_RING_RANGE_MS: u32 = 200;

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct DriverConfig {
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,

    /// Monitor loop configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Analog lines, one table per physical interface.
    #[serde(default, rename = "line")]
    pub lines: Vec<LineConfig>,

    /// Static master/slave conference links.
    #[serde(default, rename = "link")]
    pub links: Vec<LinkConfig>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogConfig {
    /// Maximum log level (`"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`).
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned()
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case", default)]
pub struct MonitorConfig {
    /// How long the monitor waits for line activity before running housekeeping.
    pub poll_timeout_ms: ms,

    /// Seconds a station line must be quiet on-hook before MWI is sent to it.
    pub mwi_quiet_secs: u64,

    /// Mean absolute sample level that wakes DTMF caller id detection on idle lines.
    pub dtmf_cid_level: u32,

    /// Samples per audio frame.
    pub frame_samples: usize,

    /// Run the monitor thread at maximum priority.
    pub realtime_priority: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 1000,
            mwi_quiet_secs: 3,
            dtmf_cid_level: 256,
            frame_samples: 160,
            realtime_priority: true,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct LineConfig {
    /// Physical line number.
    pub channel: u32,

    /// Signalling variant.
    ///
    /// |Name                                 |Family                     |
    /// |:------------------------------------|:--------------------------|
    /// |`fxo_ls`, `fxo_gs`, `fxo_ks`         |Station (drives a phone)   |
    /// |`fxs_ls`, `fxs_gs`, `fxs_ks`         |Trunk (loop from a CO)     |
    /// |`em`, `em_e1`, `em_w`                |E&M                        |
    /// |`featd`, `featdmf`, `featdmf_ta`, `featb`, `e911`, `fgccama`, `fgccamamf`|E&M feature group|
    /// |`sf`, `sf_w`, `sf_featd`, `sf_featdmf`, `sf_featb`|Single frequency|
    /// |`radio`                              |Radio (carrier operated)   |
    pub signalling: String,

    /// Dialplan context for calls originated on this line.
    #[serde(default = "default_context")]
    pub context: String,

    /// Hunt group used by outbound searches.
    #[serde(default)]
    pub group: Option<u32>,

    /// Start the dialplan immediately on off-hook instead of collecting digits.
    #[serde(default)]
    pub immediate: bool,

    /// Dial outbound digits as pulses instead of tones.
    #[serde(default)]
    pub pulse: bool,

    /// Caller ID configuration.
    #[serde(default)]
    pub callerid: CallerIdConfig,

    /// Calling feature configuration.
    #[serde(default)]
    pub features: FeaturesConfig,

    /// Timing configuration.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Audio path configuration.
    #[serde(default)]
    pub audio: AudioConfig,

    /// Distinctive ring patterns (at most three).
    #[serde(default)]
    pub distinctive_ring: Vec<DistinctiveRingConfig>,

    /// Message waiting configuration.
    #[serde(default)]
    pub mwi: MwiConfig,

    /// Feature group D tandem access codes.
    #[serde(default)]
    pub feature_group: FeatureGroupConfig,
}

fn default_context() -> String {
    "default".to_owned()
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case", default)]
pub struct CallerIdConfig {
    /// Send and detect caller id on this line.
    pub use_callerid: bool,

    /// Caller id signalling: `"bell"`, `"v23"`, `"v23_jp"` or `"dtmf"`.
    pub signalling: String,

    /// When inbound detection starts: `"ring"`, `"polarity"`, `"polarity_in"` or `"dtmf"`.
    pub start: String,

    /// Withhold our own identity on outbound calls.
    pub hide_callerid: bool,

    /// Send caller id on call waiting.
    pub callwaiting_callerid: bool,

    /// Wait for the CPE acknowledgement before sending call waiting caller id.
    pub callwaiting_cid_ack: bool,

    /// Ring count after which caller id is sent.
    pub cid_rings: u32,

    /// Sample the distinctive ring cadence after caller id rather than during it.
    pub distinctive_ring_after_cid: bool,

    /// Our own name, sent as ANI or in full VMWI spills.
    pub name: Option<String>,

    /// Our own number.
    pub number: Option<String>,
}

impl Default for CallerIdConfig {
    fn default() -> Self {
        Self {
            use_callerid: true,
            signalling: "bell".to_owned(),
            start: "ring".to_owned(),
            hide_callerid: false,
            callwaiting_callerid: true,
            callwaiting_cid_ack: true,
            cid_rings: 1,
            distinctive_ring_after_cid: false,
            name: None,
            number: None,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case", default)]
pub struct FeaturesConfig {
    /// Enables call waiting.
    pub call_waiting: bool,

    /// Enables three-way calling on flash.
    pub three_way_calling: bool,

    /// Transfer the remaining parties when hanging up a three-way call.
    pub transfer: bool,

    /// Allow transfer to a busy party.
    pub transfer_to_busy: bool,

    /// Do not disturb.
    pub dnd: bool,

    /// Treat a polarity reversal as answer on outbound trunk calls.
    pub answer_on_polarity_switch: bool,

    /// Treat a polarity reversal as hangup on answered trunk calls.
    pub hangup_on_polarity_switch: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            call_waiting: true,
            three_way_calling: true,
            transfer: true,
            transfer_to_busy: false,
            dnd: false,
            answer_on_polarity_switch: false,
            hangup_on_polarity_switch: false,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case", default)]
pub struct TimingConfig {
    /// A ringing line without a qualifying off-hook is released after this long.
    pub ring_timeout_ms: ms,

    /// Polarity reversals this soon after answer are not treated as hangup.
    pub polarity_on_answer_delay_ms: ms,

    /// Trunk lines stay unavailable for this long after a call.
    pub guard_time_ms: ms,

    /// Flashes closer together than this are treated as bounce.
    pub bounce_guard_ms: ms,

    /// Number of leading digits stripped from outbound numbers.
    pub stripmsd: usize,

    /// Echo canceller training time, enables echo break on trunk dialing.
    pub echo_training: Option<u32>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ring_timeout_ms: 8000,
            polarity_on_answer_delay_ms: 600,
            guard_time_ms: 2000,
            bounce_guard_ms: 2000,
            stripmsd: 0,
            echo_training: None,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case", default)]
pub struct AudioConfig {
    /// Companding law: `"ulaw"` or `"alaw"`.
    pub law: String,
    /// Receive gain in dB.
    pub rx_gain: f32,
    /// Transmit gain in dB.
    pub tx_gain: f32,
    /// Receive dynamic range compression.
    pub rx_drc: f32,
    /// Transmit dynamic range compression.
    pub tx_drc: f32,
    /// Echo canceller taps. `None` disables echo cancellation.
    pub echo_cancel: Option<u32>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            law: "ulaw".to_owned(),
            rx_gain: 0.0,
            tx_gain: 0.0,
            rx_drc: 0.0,
            tx_drc: 0.0,
            echo_cancel: Some(128),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct DistinctiveRingConfig {
    /// Inter-ring gaps in milliseconds; `-1` matches anything.
    pub pattern: [i32; 3],
    /// Allowed deviation in milliseconds.
    pub range: Option<u32>,
    /// Context selected by this pattern.
    pub context: String,
    /// Caller id ring count used when ringing out with this cadence.
    pub cid_rings: Option<u32>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "kebab-case", default)]
pub struct MwiConfig {
    /// Mailbox watched for message waiting.
    pub mailbox: Option<String>,
    /// Send the FSK VMWI spill.
    pub send_fsk: bool,
    /// Precede the spill with a ring pulse alert.
    pub send_rpas: bool,
    /// Spill type: `"mdmf-full"`, `"mdmf"` or `"sdmf"`.
    pub spill_type: String,
}

impl Default for MwiConfig {
    fn default() -> Self {
        Self {
            mailbox: None,
            send_fsk: true,
            send_rpas: false,
            spill_type: "mdmf-full".to_owned(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FeatureGroupConfig {
    /// Operator zone code sent on the first wink.
    pub ozz: String,
    /// Carrier identification code sent on the first wink.
    pub cic: String,
}

#[derive(Deserialize, Clone, Copy, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct LinkConfig {
    pub master: u32,
    pub slave: u32,
}

impl DriverConfig {
    /// Structural checks that don't depend on parsing individual names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for line in &self.lines {
            if !seen.insert(line.channel) {
                return Err(ConfigError::DuplicateLine(line.channel))
            }
            if line.distinctive_ring.len() > MAX_RING_PATTERNS {
                return Err(ConfigError::InvalidPattern(format!("line {} has more than {} patterns", line.channel, MAX_RING_PATTERNS)))
            }
            for ring in &line.distinctive_ring {
                if ring.pattern.iter().any(|gap| *gap < -1) {
                    return Err(ConfigError::InvalidPattern(format!("{:?}", ring.pattern)))
                }
            }
        }
        Ok(())
    }
}

pub fn parse_config(config_str: &str) -> Result<DriverConfig, ConfigError> {
    let config: DriverConfig = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &str) -> Result<DriverConfig, ConfigError> {
    let config_str = fs::read_to_string(path)?;
    parse_config(&config_str)
}
