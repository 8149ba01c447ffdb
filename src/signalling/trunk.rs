use log::debug;
use crate::engine::Env;
use crate::error::Result;
use crate::host::CallState;
use crate::line::{Leg, Line, Polarity};
use super::{Family, SignallingBehavior};

/// Loop, ground and kewl start lines fed by a central office.
pub struct Trunk;

impl SignallingBehavior for Trunk {
    fn family(&self) -> Family {
        Family::Trunk
    }

    fn on_hook(&self, line: &mut Line, env: &mut Env) {
        line.far_end_hangup(env);
    }

    fn ring_off_hook(&self, line: &mut Line, env: &mut Env) {
        if line.state(Leg::Real) == Some(CallState::Ring) {
            line.ringt = line.ringt_base;
        }
        // A ring means the loop can't be reversed
        debug!("Line {}: polarity {:?} --> Idle on ring", line.number, line.polarity);
        line.polarity = Polarity::Idle;
        line.ring_or_answer(env);
    }

    fn ring_begin(&self, line: &mut Line, _env: &mut Env) {
        if line.state(Leg::Real) == Some(CallState::Ring) {
            line.ringt = line.ringt_base;
        }
    }

    fn wink_flash(&self, line: &mut Line, _env: &mut Env) {
        debug!("Line {}: ignoring wink/flash on a trunk", line.number);
    }

    fn call(&self, line: &mut Line, env: &mut Env, leg: Leg, dest: &str) -> Result<()> {
        line.seize_and_dial(env, leg, dest)
    }

    fn seized(&self, line: &mut Line, env: &mut Env) {
        line.inbound_ring(env);
    }
}
