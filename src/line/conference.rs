//! Reconciles master/slave and three-way relationships with the hardware
//! conferencing of each leg.

use enum_iterator::all;
use log::{debug, warn};
use super::{Leg, Line};
use super::resource::{ConfMode, ConfRequest};

/// How one subchannel is mixed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Membership {
    #[default]
    NotConferenced,
    /// Bridged directly to another line.
    SlaveNative { peer: u32 },
    /// Member of a numbered conference slot.
    SoftwareConferenced { slot: u32, role: ConfMode },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Target {
    Leave,
    Native(u32),
    /// Join the conference owned by the line at this group index.
    Software { owner: usize, role: ConfMode },
}

/// Whether `master` can bridge its only slave directly.
pub fn is_slave_native(master: &Line, slaves: &[&mut Line]) -> bool {
    if all::<Leg>().any(|leg| master.subs[leg].is_allocated() && master.subs[leg].in_three_way) {
        return false
    }
    match slaves {
        [slave] => slave.law == master.law,
        _ => false,
    }
}

fn own_role(leg: Leg) -> ConfMode {
    match leg {
        Leg::Real => ConfMode::RealAndPseudo,
        _ => ConfMode::Conference,
    }
}

/// Brings every leg of `group` in line with the logical topology.
/// `group[0]` is the master, the rest its slaves, all locked by the caller.
/// Returns the number of hardware membership changes made.
pub fn reconcile_group(group: &mut [&mut Line]) -> usize {
    let Some((master, slaves)) = group.split_first_mut() else {
        return 0
    };
    let native = is_slave_native(master, slaves);
    let mut targets = vec![[Target::Leave; 3]; slaves.len() + 1];
    let mut needs_conf = vec![false; slaves.len() + 1];

    // Each line's own three-way legs
    for (idx, line) in std::iter::once(&**master).chain(slaves.iter().map(|s| &**s)).enumerate() {
        for leg in all::<Leg>() {
            let sub = &line.subs[leg];
            if sub.is_allocated() && sub.in_three_way {
                targets[idx][leg.as_index()] = Target::Software { owner: idx, role: own_role(leg) };
                needs_conf[idx] = true;
            }
        }
    }

    for (i, slave) in slaves.iter().enumerate() {
        targets[i + 1][Leg::Real.as_index()] = if native {
            Target::Native(master.number)
        } else {
            needs_conf[0] = true;
            Target::Software { owner: 0, role: ConfMode::RealAndPseudo }
        };
        debug!("Line {} joins master {} ({})", slave.number, master.number, if native { "native" } else { "software" });
    }

    if master.in_conference && !master.subs[Leg::Real].in_three_way {
        targets[0][Leg::Real.as_index()] = match (native, slaves.first()) {
            (true, Some(slave)) => Target::Native(slave.number),
            _ => {
                needs_conf[0] = true;
                Target::Software { owner: 0, role: ConfMode::RealAndPseudo }
            }
        };
    }

    let mut confnos: Vec<Option<u32>> = std::iter::once(master.confno)
        .chain(slaves.iter().map(|s| s.confno))
        .collect();
    let mut changes = 0;

    // Leave first so slots are never shared by stale members
    for pass_leave in [true, false] {
        for idx in 0..targets.len() {
            let line: &mut Line = if idx == 0 { &mut **master } else { &mut *slaves[idx - 1] };
            for leg in all::<Leg>() {
                let target = targets[idx][leg.as_index()];
                if (target == Target::Leave) != pass_leave {
                    continue
                }
                if apply(line, leg, target, &mut confnos) {
                    changes += 1;
                }
            }
        }
    }

    for idx in 0..targets.len() {
        let line: &mut Line = if idx == 0 { &mut **master } else { &mut *slaves[idx - 1] };
        line.confno = if needs_conf[idx] { confnos[idx] } else { None };
    }
    changes
}

/// Reconciles a line with no master or slaves.
pub fn reconcile_line(line: &mut Line) -> usize {
    reconcile_group(&mut [line])
}

fn apply(line: &mut Line, leg: Leg, target: Target, confnos: &mut [Option<u32>]) -> bool {
    let number = line.number;
    let sub = &mut line.subs[leg];
    if !sub.is_allocated() || sub.suspended {
        return false
    }
    let request = match (target, sub.membership) {
        (Target::Leave, Membership::NotConferenced) => return false,
        (Target::Leave, _) => ConfRequest::leave(),
        (Target::Native(peer), Membership::SlaveNative { peer: current }) if peer == current => return false,
        (Target::Native(peer), _) => ConfRequest { slot: Some(peer), mode: ConfMode::DigitalMonitor },
        (Target::Software { owner, role }, Membership::SoftwareConferenced { slot, role: current })
            if confnos[owner] == Some(slot) && current == role => return false,
        (Target::Software { owner, role }, _) => ConfRequest { slot: confnos[owner], mode: role },
    };

    let Some(resource) = sub.resource(line.hw.as_mut()) else {
        return false
    };
    match resource.set_conf(request) {
        Ok(slot) => {
            sub.membership = match target {
                Target::Leave => Membership::NotConferenced,
                Target::Native(peer) => Membership::SlaveNative { peer },
                Target::Software { owner, role } => {
                    confnos[owner] = Some(slot);
                    Membership::SoftwareConferenced { slot, role }
                }
            };
            debug!("Line {} {:?} conference --> {:?}", number, leg, sub.membership);
            true
        },
        Err(err) => {
            warn!("Line {} {:?}: unable to set conference {:?}: {}", number, leg, request, err);
            false
        }
    }
}

/// Parks a leg's conference membership while a spill plays to it.
pub fn suspend(line: &mut Line, leg: Leg) {
    let number = line.number;
    let sub = &mut line.subs[leg];
    if sub.suspended {
        return
    }
    sub.suspended = true;
    if sub.membership == Membership::NotConferenced {
        return
    }
    if let Some(resource) = sub.resource(line.hw.as_mut()) {
        if let Err(err) = resource.set_conf(ConfRequest::leave()) {
            warn!("Line {}: unable to suspend {:?} conference: {}", number, leg, err);
        }
    }
}

/// Puts a suspended leg back into the conference it was in.
pub fn restore(line: &mut Line, leg: Leg) {
    let number = line.number;
    let sub = &mut line.subs[leg];
    if !sub.suspended {
        return
    }
    sub.suspended = false;
    let request = match sub.membership {
        Membership::NotConferenced => return,
        Membership::SlaveNative { peer } => ConfRequest { slot: Some(peer), mode: ConfMode::DigitalMonitor },
        Membership::SoftwareConferenced { slot, role } => ConfRequest { slot: Some(slot), mode: role },
    };
    if let Some(resource) = sub.resource(line.hw.as_mut()) {
        if let Err(err) = resource.set_conf(request) {
            warn!("Line {}: unable to restore {:?} conference: {}", number, leg, err);
            sub.membership = Membership::NotConferenced;
        }
    }
}
