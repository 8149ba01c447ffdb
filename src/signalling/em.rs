use log::{debug, warn};
use crate::engine::Env;
use crate::error::Result;
use crate::host::{CallState, HangupCause};
use crate::line::{Leg, Line};
use super::{Family, Signalling, SignallingBehavior};

/// E&M, feature group and single frequency trunks.
pub struct EandM;

impl SignallingBehavior for EandM {
    fn family(&self) -> Family {
        Family::Em
    }

    fn on_hook(&self, line: &mut Line, env: &mut Env) {
        line.far_end_hangup(env);
    }

    fn ring_off_hook(&self, line: &mut Line, env: &mut Env) {
        if line.signalling.is_two_stage() && line.state(Leg::Real) == Some(CallState::DialingOffhook) {
            line.second_stage_dial(env);
            return
        }
        line.ring_or_answer(env);
    }

    fn wink_flash(&self, line: &mut Line, env: &mut Env) {
        match line.signalling {
            Signalling::FeatDMfTa => tandem_wink(line, env),
            signalling if signalling.waits_for_wink() => line.send_deferred_dial(env),
            _ => {
                if line.dialing {
                    debug!("Line {}: ignoring wink while dialing", line.number);
                } else {
                    debug!("Line {}: got wink in {:?}", line.number, line.state(Leg::Real));
                }
            }
        }
    }

    fn call(&self, line: &mut Line, env: &mut Env, leg: Leg, dest: &str) -> Result<()> {
        line.seize_and_dial(env, leg, dest)
    }

    fn seized(&self, line: &mut Line, env: &mut Env) {
        line.inbound_ring(env);
    }
}

/// Feature group D tandem access: the first wink takes the ANI, the second the
/// called number.
fn tandem_wink(line: &mut Line, env: &mut Env) {
    let Some(call) = line.call(Leg::Real) else {
        return
    };
    let winks = line.dial.winks;
    line.dial.winks += 1;
    let digits = match winks {
        0 => Some(format!("M*0{}#", line.ani().unwrap_or_default())),
        1 => line.dial.final_dial.take(),
        _ => {
            warn!("Line {}: got a third wink on a tandem access call", line.number);
            env.hangup(call, HangupCause::Failure);
            return
        }
    };
    let Some(digits) = digits else {
        return
    };
    if !line.dial_digits(&digits) {
        warn!("Line {}: unable to send tandem access digits", line.number);
        line.on_hook();
        env.hangup(call, HangupCause::Failure);
        return
    }
    line.dialing = true;
}
