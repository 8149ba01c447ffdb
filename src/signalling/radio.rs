use log::debug;
use crate::engine::Env;
use crate::error::{EngineError, Result};
use crate::host::CallState;
use crate::line::{Leg, Line};
use super::{Family, SignallingBehavior};

/// Carrier operated radio interface. Carrier up and down arrive as hook events.
pub struct Radio;

impl SignallingBehavior for Radio {
    fn family(&self) -> Family {
        Family::Radio
    }

    fn on_hook(&self, line: &mut Line, env: &mut Env) {
        line.far_end_hangup(env);
    }

    fn ring_off_hook(&self, line: &mut Line, env: &mut Env) {
        line.ring_or_answer(env);
    }

    fn wink_flash(&self, line: &mut Line, _env: &mut Env) {
        debug!("Line {}: ignoring flash on a radio", line.number);
    }

    fn polarity(&self, line: &mut Line, _env: &mut Env) {
        debug!("Line {}: ignoring polarity on a radio", line.number);
    }

    fn hook_complete(&self, _line: &mut Line, _env: &mut Env) {}

    fn call(&self, line: &mut Line, env: &mut Env, leg: Leg, _dest: &str) -> Result<()> {
        // Keying up is the whole call; carrier from the far end answers it
        if !line.off_hook() {
            return Err(EngineError::InvalidState("unable to key up radio"))
        }
        line.set_call_state(leg, CallState::Ringing, env.now);
        Ok(())
    }

    fn seized(&self, line: &mut Line, env: &mut Env) {
        line.inbound_ring(env);
    }
}
