use std::fmt;
use std::ops::{Index, IndexMut};
use enum_iterator::{all, Sequence};
use log::{trace, warn};
use crate::error::SubchannelError;
use crate::host::{CallId, CallLeg};
use super::conference::Membership;
use super::resource::{ConfRequest, LineDevice, LineResource, Tone};

/// The three logical legs multiplexed onto one line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Sequence)]
pub enum Leg {
    /// The active call; the only leg that owns the physical line.
    Real,
    /// A held call waiting call.
    CallWait,
    /// A three-way conference peer.
    ThreeWay,
}

impl Leg {
    #[inline]
    pub fn as_index(self) -> usize {
        self as usize
    }
}

pub enum AudioPath {
    /// The line's own resource.
    Physical,
    /// A pseudo channel opened for this leg.
    Pseudo(Box<dyn LineResource>),
}

impl fmt::Debug for AudioPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioPath::Physical => write!(f, "Physical"),
            AudioPath::Pseudo(_) => write!(f, "Pseudo"),
        }
    }
}

/// Controls waiting to be delivered to a leg's call on its next read.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Pending {
    pub ringing: bool,
    pub busy: bool,
    pub congestion: bool,
    pub answer: bool,
    pub flash: bool,
    pub hold: bool,
    pub unhold: bool,
}

#[derive(Debug, Default)]
pub struct Subchannel {
    /// Audio path; `None` while the leg is not allocated.
    pub path: Option<AudioPath>,
    /// The call this leg carries.
    pub owner: Option<CallLeg>,
    pub in_three_way: bool,
    pub linear: bool,
    pub pending: Pending,
    pub membership: Membership,
    /// Conference membership is parked while a spill plays on this leg.
    pub suspended: bool,
    /// Tone currently playing on this leg.
    pub tone: Option<Tone>,
}

impl Subchannel {
    fn physical() -> Self {
        Self {
            path: Some(AudioPath::Physical),
            ..Default::default()
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.path.is_some()
    }

    /// The resource behind this leg's audio path.
    pub fn resource<'a>(&'a mut self, hw: &'a mut dyn LineResource) -> Option<&'a mut dyn LineResource> {
        match &mut self.path {
            Some(AudioPath::Physical) => Some(hw),
            Some(AudioPath::Pseudo(resource)) => Some(resource.as_mut()),
            None => None,
        }
    }

    pub fn call(&self) -> Option<CallId> {
        self.owner.as_ref().map(|owner| owner.id)
    }
}

/// The Real, CallWait and ThreeWay subchannels of a line.
#[derive(Debug)]
pub struct Subchannels {
    subs: [Subchannel; 3],
}

impl Subchannels {
    pub fn new() -> Self {
        Self {
            subs: [Subchannel::physical(), Subchannel::default(), Subchannel::default()],
        }
    }

    /// Opens a pseudo channel for `leg`.
    pub fn allocate(&mut self, leg: Leg, device: &dyn LineDevice) -> Result<(), SubchannelError> {
        if self[leg].is_allocated() {
            return Err(SubchannelError::Conflict(leg))
        }
        let resource = device.open_pseudo()?;
        self[leg] = Subchannel {
            path: Some(AudioPath::Pseudo(resource)),
            ..Default::default()
        };
        trace!("Allocated {:?} subchannel", leg);
        Ok(())
    }

    /// Withdraws `leg` from any conference and drops its pseudo channel.
    pub fn release(&mut self, leg: Leg, hw: &mut dyn LineResource) -> Result<(), SubchannelError> {
        if leg == Leg::Real {
            return Err(SubchannelError::RealRelease)
        }
        if !self[leg].is_allocated() {
            return Err(SubchannelError::NotAllocated(leg))
        }
        let sub = &mut self[leg];
        if sub.membership != Membership::NotConferenced {
            if let Some(resource) = sub.resource(hw) {
                if let Err(err) = resource.set_conf(ConfRequest::leave()) {
                    warn!("Unable to withdraw {:?} from its conference: {}", leg, err);
                }
            }
        }
        self[leg] = Subchannel::default();
        trace!("Released {:?} subchannel", leg);
        Ok(())
    }

    /// Moves the calls on `a` and `b` onto each other's leg. Resources stay put.
    pub fn swap(&mut self, a: Leg, b: Leg) {
        if a == b {
            return
        }
        let (x, y) = (a.as_index(), b.as_index());
        let (lo, hi) = (x.min(y), x.max(y));
        let (left, right) = self.subs.split_at_mut(hi);
        let (first, second) = (&mut left[lo], &mut right[0]);
        std::mem::swap(&mut first.owner, &mut second.owner);
        std::mem::swap(&mut first.in_three_way, &mut second.in_three_way);
        std::mem::swap(&mut first.pending, &mut second.pending);
        trace!("Swapped {:?} and {:?}", a, b);
    }

    /// The leg carrying `call`.
    pub fn find(&self, call: CallId) -> Option<Leg> {
        all::<Leg>().find(|leg| self[*leg].call() == Some(call))
    }

    /// Legs that currently carry a call.
    pub fn owned(&self) -> impl Iterator<Item = Leg> + '_ {
        all::<Leg>().filter(move |leg| self[*leg].owner.is_some())
    }

    pub fn owner(&self, leg: Leg) -> Option<&CallLeg> {
        self[leg].owner.as_ref()
    }

    pub fn owner_mut(&mut self, leg: Leg) -> Option<&mut CallLeg> {
        self[leg].owner.as_mut()
    }

    pub fn has_owner(&self, leg: Leg) -> bool {
        self[leg].owner.is_some()
    }
}

impl Default for Subchannels {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<Leg> for Subchannels {
    type Output = Subchannel;

    fn index(&self, leg: Leg) -> &Self::Output {
        &self.subs[leg.as_index()]
    }
}

impl IndexMut<Leg> for Subchannels {
    fn index_mut(&mut self, leg: Leg) -> &mut Self::Output {
        &mut self.subs[leg.as_index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use rand::Rng;
    use crate::host::CallState;
    use crate::line::loopback::LoopbackDevice;
    use crate::line::resource::ConfMode;

    fn setup() -> (LoopbackDevice, Box<dyn LineResource>, Subchannels) {
        let device = LoopbackDevice::new();
        let (tx, _rx) = mpsc::channel();
        let hw = device.open(1, tx).unwrap();
        (device, hw, Subchannels::new())
    }

    #[test]
    fn allocation_conflicts() {
        let (device, _hw, mut subs) = setup();
        assert_eq!(subs.allocate(Leg::Real, &device), Err(SubchannelError::Conflict(Leg::Real)));
        subs.allocate(Leg::CallWait, &device).unwrap();
        subs[Leg::CallWait].owner = Some(CallLeg::new(CallId::next(), CallState::Ringing));
        assert_eq!(subs.allocate(Leg::CallWait, &device), Err(SubchannelError::Conflict(Leg::CallWait)));
        // the existing leg is untouched
        assert!(subs.has_owner(Leg::CallWait));
        assert_eq!(device.pseudo_probes().len(), 1);
    }

    #[test]
    fn release_rules() {
        let (device, mut hw, mut subs) = setup();
        assert_eq!(subs.release(Leg::Real, hw.as_mut()), Err(SubchannelError::RealRelease));
        assert_eq!(subs.release(Leg::ThreeWay, hw.as_mut()), Err(SubchannelError::NotAllocated(Leg::ThreeWay)));

        subs.allocate(Leg::ThreeWay, &device).unwrap();
        let resource = subs[Leg::ThreeWay].resource(hw.as_mut()).unwrap();
        let slot = resource.set_conf(ConfRequest { slot: None, mode: ConfMode::Conference }).unwrap();
        subs[Leg::ThreeWay].membership = Membership::SoftwareConferenced { slot, role: ConfMode::Conference };
        subs[Leg::ThreeWay].pending.hold = true;

        subs.release(Leg::ThreeWay, hw.as_mut()).unwrap();
        assert!(!subs[Leg::ThreeWay].is_allocated());
        assert_eq!(subs[Leg::ThreeWay].pending, Pending::default());
        assert_eq!(device.pseudo_probes()[0].conf().mode, ConfMode::Normal);
    }

    #[test]
    fn swap_keeps_resources_in_place() {
        let (device, mut hw, mut subs) = setup();
        subs.allocate(Leg::CallWait, &device).unwrap();
        let (a, b) = (CallId::next(), CallId::next());
        subs[Leg::Real].owner = Some(CallLeg::new(a, CallState::Up));
        subs[Leg::CallWait].owner = Some(CallLeg::new(b, CallState::Ringing));
        subs.swap(Leg::Real, Leg::CallWait);
        assert_eq!(subs.find(b), Some(Leg::Real));
        assert_eq!(subs.find(a), Some(Leg::CallWait));
        assert!(matches!(subs[Leg::Real].path, Some(AudioPath::Physical)));
        assert!(subs[Leg::CallWait].resource(hw.as_mut()).is_some());
    }

    #[test]
    fn swap_is_an_involution() {
        let (device, _hw, mut subs) = setup();
        subs.allocate(Leg::CallWait, &device).unwrap();
        subs.allocate(Leg::ThreeWay, &device).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            for leg in all::<Leg>() {
                subs[leg].owner = rng.gen_bool(0.7).then(|| CallLeg::new(CallId::next(), CallState::Up));
                subs[leg].in_three_way = rng.gen();
                subs[leg].pending.hold = rng.gen();
            }
            let legs: Vec<Leg> = all::<Leg>().collect();
            let a = legs[rng.gen_range(0..3)];
            let b = legs[rng.gen_range(0..3)];
            let before: Vec<_> = all::<Leg>().map(|l| (subs[l].owner.clone(), subs[l].in_three_way, subs[l].pending)).collect();
            subs.swap(a, b);
            subs.swap(a, b);
            let after: Vec<_> = all::<Leg>().map(|l| (subs[l].owner.clone(), subs[l].in_three_way, subs[l].pending)).collect();
            assert_eq!(before, after);
        }
    }
}
