//! Signalling variants and the per-family behavior the engine dispatches to.

mod station;
mod trunk;
mod em;
mod radio;

use std::fmt;
use std::str::FromStr;
use enum_iterator::{all, Sequence};
use crate::engine::Env;
use crate::error::{ConfigError, Result};
use crate::line::{Leg, Line};

pub use self::station::Station;
pub use self::trunk::Trunk;
pub use self::em::EandM;
pub use self::radio::Radio;

/// Signalling of one line.
///
/// `Fxo*` variants drive a telephone (the line is a station), `Fxs*` variants
/// sit on a loop from a central office (the line is a trunk).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Sequence)]
pub enum Signalling {
    FxoLs,
    FxoGs,
    FxoKs,
    FxsLs,
    FxsGs,
    FxsKs,
    Em,
    EmE1,
    EmWink,
    FeatD,
    FeatDMf,
    FeatDMfTa,
    FeatB,
    E911,
    FgcCama,
    FgcCamaMf,
    Sf,
    SfWink,
    SfFeatD,
    SfFeatDMf,
    SfFeatB,
    Radio,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    Station,
    Trunk,
    Em,
    Radio,
}

impl Signalling {
    pub fn name(self) -> &'static str {
        use Signalling::*;
        match self {
            FxoLs => "fxo_ls",
            FxoGs => "fxo_gs",
            FxoKs => "fxo_ks",
            FxsLs => "fxs_ls",
            FxsGs => "fxs_gs",
            FxsKs => "fxs_ks",
            Em => "em",
            EmE1 => "em_e1",
            EmWink => "em_w",
            FeatD => "featd",
            FeatDMf => "featdmf",
            FeatDMfTa => "featdmf_ta",
            FeatB => "featb",
            E911 => "e911",
            FgcCama => "fgccama",
            FgcCamaMf => "fgccamamf",
            Sf => "sf",
            SfWink => "sf_w",
            SfFeatD => "sf_featd",
            SfFeatDMf => "sf_featdmf",
            SfFeatB => "sf_featb",
            Radio => "radio",
        }
    }

    pub fn family(self) -> Family {
        use Signalling::*;
        match self {
            FxoLs | FxoGs | FxoKs => Family::Station,
            FxsLs | FxsGs | FxsKs => Family::Trunk,
            Radio => Family::Radio,
            _ => Family::Em,
        }
    }

    pub fn behavior(self) -> &'static dyn SignallingBehavior {
        match self.family() {
            Family::Station => &Station,
            Family::Trunk => &Trunk,
            Family::Em => &EandM,
            Family::Radio => &Radio,
        }
    }

    /// Deferred digits go out on the far end's wink rather than at seize.
    pub fn waits_for_wink(self) -> bool {
        use Signalling::*;
        matches!(self, EmWink | FeatDMf | FeatB | E911 | FgcCama | FgcCamaMf | SfFeatDMf | SfFeatB)
    }

    /// Deferred digits go out when the seize completes.
    pub fn dials_on_hook_complete(self) -> bool {
        use Signalling::*;
        matches!(self, FxsLs | FxsGs | FxsKs | Em | EmE1 | EmWink | FeatD | Sf | SfWink | SfFeatD)
    }

    /// Dials again once the far end goes off hook.
    pub fn is_two_stage(self) -> bool {
        matches!(self, Signalling::E911 | Signalling::FgcCama | Signalling::FgcCamaMf)
    }
}

impl FromStr for Signalling {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let name = name.to_ascii_lowercase();
        all::<Signalling>()
            .find(|signalling| signalling.name() == name)
            .ok_or(ConfigError::UnknownSignalling(name))
    }
}

impl fmt::Display for Signalling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How one signalling family reacts to line events on a line that carries a call.
pub trait SignallingBehavior: Send + Sync {
    fn family(&self) -> Family;

    /// Hook (or carrier) went down under the Real call.
    fn on_hook(&self, line: &mut Line, env: &mut Env);

    fn ring_off_hook(&self, line: &mut Line, env: &mut Env);

    fn wink_flash(&self, line: &mut Line, env: &mut Env);

    fn polarity(&self, line: &mut Line, env: &mut Env) {
        line.polarity_supervision(env);
    }

    fn hook_complete(&self, line: &mut Line, env: &mut Env) {
        if line.signalling.dials_on_hook_complete() {
            line.send_deferred_dial(env);
        }
    }

    fn ring_begin(&self, _line: &mut Line, _env: &mut Env) {}

    /// Places the host's call on `leg` towards `dest`.
    fn call(&self, line: &mut Line, env: &mut Env, leg: Leg, dest: &str) -> Result<()>;

    /// Ring or off-hook on a line with no calls.
    fn seized(&self, line: &mut Line, env: &mut Env);
}

/// Digits after the `/` of a host destination.
pub(crate) fn dest_digits(dest: &str) -> Option<&str> {
    dest.split_once('/').map(|(_, digits)| digits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for signalling in all::<Signalling>() {
            assert_eq!(signalling.name().parse::<Signalling>().unwrap(), signalling);
        }
        assert_eq!("FXO_KS".parse::<Signalling>().unwrap(), Signalling::FxoKs);
        assert!(matches!("pri".parse::<Signalling>(), Err(ConfigError::UnknownSignalling(_))));
    }

    #[test]
    fn families() {
        assert_eq!(Signalling::FxoGs.family(), Family::Station);
        assert_eq!(Signalling::FxsKs.family(), Family::Trunk);
        assert_eq!(Signalling::SfFeatB.family(), Family::Em);
        assert_eq!(Signalling::Radio.behavior().family(), Family::Radio);
    }

    #[test]
    fn mf_variants_wait_for_the_wink() {
        assert!(Signalling::FeatDMf.waits_for_wink());
        assert!(!Signalling::FeatDMf.dials_on_hook_complete());
        assert!(!Signalling::FeatDMfTa.waits_for_wink());
        assert!(Signalling::EmWink.waits_for_wink() && Signalling::EmWink.dials_on_hook_complete());
    }

    #[test]
    fn destination_digits() {
        assert_eq!(dest_digits("1/5551234"), Some("5551234"));
        assert_eq!(dest_digits("g1"), None);
    }
}
