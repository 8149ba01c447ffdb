//! The driver context: every open line, keyed by number, and the host-facing
//! entry points that reach them.
//!
//! Locks are always taken in the same order: the list lock first, then line
//! locks in ascending line number. Host effects queued while a line is locked
//! are delivered only after every lock is released.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};
use indexmap::IndexMap;
use log::{debug, info, warn};
use rand::Rng;
use crate::callerid::CallerId;
use crate::config::{DriverConfig, LineConfig};
use crate::engine::{Env, MAX_EVENTS_PER_PASS};
use crate::error::{ConfigError, EngineError, Result};
use crate::host::*;
use crate::line::{lock, reconcile_group, reconcile_line, Leg, Line, LineDevice, SyntheticEvent};

/// Most slaves one master can carry.
pub const MAX_SLAVES: usize = 4;
/// Attempts `try_with_line` makes before reporting contention.
pub const TRY_LOCK_ATTEMPTS: u32 = 8;

/// How `request` picks a line.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Search {
    /// One specific line.
    Line(u32),
    /// First available line of a group, lowest number first.
    Group(u32),
    /// First available line of a group, highest number first.
    GroupDescending(u32),
    /// Rotate through a group, starting after the line handed out last.
    RoundRobin(u32),
    RoundRobinDescending(u32),
}

impl Search {
    fn group(self) -> Option<u32> {
        match self {
            Search::Line(_) => None,
            Search::Group(group) | Search::GroupDescending(group)
            | Search::RoundRobin(group) | Search::RoundRobinDescending(group) => Some(group),
        }
    }

    fn descending(self) -> bool {
        matches!(self, Search::GroupDescending(_) | Search::RoundRobinDescending(_))
    }

    fn round_robin(self) -> bool {
        matches!(self, Search::RoundRobin(_) | Search::RoundRobinDescending(_))
    }
}

impl FromStr for Search {
    type Err = EngineError;

    /// Parses the part of a dial string before the `/`: `5`, `g1`, `G1`, `r1` or `R1`.
    fn from_str(data: &str) -> Result<Self> {
        let target = data.split('/').next().unwrap_or_default();
        let bad = || EngineError::BadSearch(data.to_owned());
        let mut chars = target.chars();
        let (kind, number) = match chars.next() {
            Some(c @ ('g' | 'G' | 'r' | 'R')) => (Some(c), chars.as_str()),
            Some(_) => (None, target),
            None => return Err(bad()),
        };
        let number: u32 = number.parse().map_err(|_| bad())?;
        Ok(match kind {
            Some('g') => Search::Group(number),
            Some('G') => Search::GroupDescending(number),
            Some('r') => Search::RoundRobin(number),
            Some('R') => Search::RoundRobinDescending(number),
            _ => Search::Line(number),
        })
    }
}

/// A call handed out by `request`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Requested {
    pub line: u32,
    pub call: CallId,
    pub leg: Leg,
}

struct Entry {
    group: Option<u32>,
    line: Arc<Mutex<Line>>,
}

struct Lines {
    arena: BTreeMap<u32, Entry>,
    /// Last line handed out per round robin search.
    cursors: IndexMap<Search, u32>,
}

pub struct Registry {
    lines: Mutex<Lines>,
    device: Arc<dyn LineDevice>,
    control: Arc<dyn CallControl>,
    store: Arc<dyn MessageStore>,
    doorbell: mpsc::Sender<u32>,
}

impl Registry {
    /// Opens every configured line and applies the static links. The returned
    /// receiver is rung with a line number whenever that line has activity.
    pub fn new(
        config: &DriverConfig,
        device: Arc<dyn LineDevice>,
        control: Arc<dyn CallControl>,
        store: Arc<dyn MessageStore>,
    ) -> std::result::Result<(Self, mpsc::Receiver<u32>), ConfigError> {
        let (doorbell, rx) = mpsc::channel();
        let registry = Self {
            lines: Mutex::new(Lines {
                arena: BTreeMap::new(),
                cursors: IndexMap::new(),
            }),
            device,
            control,
            store,
            doorbell,
        };
        for line in &config.lines {
            registry.add_line(line)?;
        }
        for link in &config.links {
            registry.link(link.master, link.slave)?;
        }
        info!("Registry ready with {} lines", registry.numbers().len());
        Ok((registry, rx))
    }

    pub fn add_line(&self, config: &LineConfig) -> std::result::Result<(), ConfigError> {
        let mut lines = lock(&self.lines);
        if lines.arena.contains_key(&config.channel) {
            return Err(ConfigError::DuplicateLine(config.channel))
        }
        let line = Line::open(config, self.device.as_ref(), self.doorbell.clone())?;
        lines.arena.insert(config.channel, Entry {
            group: config.group,
            line: Arc::new(Mutex::new(line)),
        });
        Ok(())
    }

    /// Tears a line down. Lines with calls are only marked and go once idle.
    pub fn remove_line(&self, number: u32) -> Result<()> {
        let mut lines = lock(&self.lines);
        let entry = lines.arena.get(&number).ok_or(EngineError::NoSuchLine(number))?;
        let mut line = lock(&entry.line);
        if line.is_owned() {
            line.removed = true;
            return Err(EngineError::LineBusy(number))
        }
        if line.master.is_some() || !line.slaves.is_empty() {
            return Err(EngineError::InvalidState("line is still linked"))
        }
        drop(line);
        lines.arena.remove(&number);
        lines.cursors.retain(|_, last| *last != number);
        info!("Removed line {}", number);
        Ok(())
    }

    /// Removes lines the driver reported gone once they have no calls.
    pub fn sweep_removed(&self) {
        let removed: Vec<u32> = {
            let lines = lock(&self.lines);
            lines.arena.iter()
                .filter(|(_, entry)| {
                    let line = lock(&entry.line);
                    line.removed && !line.is_owned()
                })
                .map(|(number, _)| *number)
                .collect()
        };
        for number in removed {
            if let Err(err) = self.remove_line(number) {
                debug!("Line {} not removed yet: {}", number, err);
            }
        }
    }

    pub fn numbers(&self) -> Vec<u32> {
        lock(&self.lines).arena.keys().copied().collect()
    }

    pub fn line(&self, number: u32) -> Option<Arc<Mutex<Line>>> {
        lock(&self.lines).arena.get(&number).map(|entry| entry.line.clone())
    }

    fn env(&self, now: Instant) -> Env<'_> {
        Env::new(now, self.device.as_ref(), self.store.as_ref())
    }

    /// Runs `f` on a locked line, then delivers whatever it queued for the host.
    pub fn with_line<R>(&self, number: u32, f: impl FnOnce(&mut Line, &mut Env) -> R) -> Result<R> {
        let arc = self.line(number).ok_or(EngineError::NoSuchLine(number))?;
        let guard = lock(&arc);
        Ok(self.run_locked(guard, f))
    }

    /// Like `with_line`, but gives up with `Contended` instead of blocking
    /// when the line stays locked through a few randomized backoffs.
    pub fn try_with_line<R>(&self, number: u32, f: impl FnOnce(&mut Line, &mut Env) -> R) -> Result<R> {
        let arc = self.line(number).ok_or(EngineError::NoSuchLine(number))?;
        for attempt in 0..TRY_LOCK_ATTEMPTS {
            match arc.try_lock() {
                Ok(guard) => return Ok(self.run_locked(guard, f)),
                Err(TryLockError::Poisoned(poisoned)) => return Ok(self.run_locked(poisoned.into_inner(), f)),
                Err(TryLockError::WouldBlock) => {
                    let backoff = rand::thread_rng().gen_range(50..250) * (attempt as u64 + 1);
                    thread::yield_now();
                    thread::sleep(Duration::from_micros(backoff));
                }
            }
        }
        debug!("Line {} contended", number);
        Err(EngineError::Contended(number))
    }

    fn run_locked<R>(&self, mut guard: MutexGuard<'_, Line>, f: impl FnOnce(&mut Line, &mut Env) -> R) -> R {
        let mut env = self.env(Instant::now());
        let result = f(&mut *guard, &mut env);
        let dirty = std::mem::take(&mut guard.conf_dirty);
        let master = guard.master.unwrap_or(guard.number);
        drop(guard);
        if dirty {
            self.reconcile_group(master);
        }
        self.deliver(env.take_actions());
        result
    }

    /// Hands queued effects to the host. No line lock may be held here.
    fn deliver(&self, actions: Vec<HostAction>) {
        for action in actions {
            match action {
                HostAction::Originate(origination) => {
                    if let Err(err) = self.control.originate(&origination) {
                        warn!("Unable to originate {} on line {}: {}", origination.call, origination.line, err);
                        let call = origination.call;
                        let result = self.with_line(origination.line, |line, env| {
                            line.inject(SyntheticEvent::SetupFailed(call));
                            line.process_events(env, MAX_EVENTS_PER_PASS);
                        });
                        if let Err(err) = result {
                            warn!("Unable to report setup failure: {}", err);
                        }
                    }
                },
                action => self.control.dispatch(action),
            }
        }
    }

    /// Re-applies the conference topology of `master` and all its slaves.
    pub fn reconcile_group(&self, master: u32) -> usize {
        let arcs: Vec<Arc<Mutex<Line>>> = {
            let lines = lock(&self.lines);
            let Some(entry) = lines.arena.get(&master) else {
                return 0
            };
            let mut numbers = lock(&entry.line).slaves.clone();
            numbers.push(master);
            numbers.sort_unstable();
            numbers.dedup();
            numbers.iter()
                .filter_map(|number| lines.arena.get(number).map(|entry| entry.line.clone()))
                .collect()
        };
        let mut guards: Vec<MutexGuard<Line>> = arcs.iter().map(|arc| lock(arc)).collect();
        let mut group: Vec<&mut Line> = guards.iter_mut().map(|guard| &mut **guard).collect();
        if let Some(pos) = group.iter().position(|line| line.number == master) {
            group.swap(0, pos);
        }
        for line in group.iter_mut() {
            line.conf_dirty = false;
        }
        reconcile_group(&mut group)
    }

    /// Links `slave` to `master` so the slave's Real leg hears the master.
    pub fn link(&self, master: u32, slave: u32) -> std::result::Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidLink(master, slave);
        if master == slave {
            return Err(invalid())
        }
        let (Some(master_arc), Some(slave_arc)) = (self.line(master), self.line(slave)) else {
            return Err(invalid())
        };
        {
            let first = lock(if master < slave { &master_arc } else { &slave_arc });
            let second = lock(if master < slave { &slave_arc } else { &master_arc });
            let (mut master_line, mut slave_line) = if master < slave { (first, second) } else { (second, first) };
            if slave_line.master.is_some() || !slave_line.slaves.is_empty() || master_line.master.is_some() {
                return Err(invalid())
            }
            if master_line.slaves.len() >= MAX_SLAVES {
                warn!("Line {} already has {} slaves", master, MAX_SLAVES);
                return Err(invalid())
            }
            master_line.slaves.push(slave);
            master_line.in_conference = true;
            slave_line.master = Some(master);
        }
        info!("Linked line {} to master {}", slave, master);
        self.reconcile_group(master);
        Ok(())
    }

    pub fn unlink(&self, slave: u32) -> Result<()> {
        let slave_arc = self.line(slave).ok_or(EngineError::NoSuchLine(slave))?;
        let Some(master) = lock(&slave_arc).master else {
            return Ok(())
        };
        let master_arc = self.line(master).ok_or(EngineError::NoSuchLine(master))?;
        {
            let first = lock(if master < slave { &master_arc } else { &slave_arc });
            let second = lock(if master < slave { &slave_arc } else { &master_arc });
            let (mut master_line, mut slave_line) = if master < slave { (first, second) } else { (second, first) };
            master_line.slaves.retain(|number| *number != slave);
            master_line.in_conference = !master_line.slaves.is_empty();
            slave_line.master = None;
        }
        info!("Unlinked line {} from master {}", slave, master);
        self.reconcile_group(master);
        reconcile_line(&mut lock(&slave_arc));
        Ok(())
    }

    /// Finds an available line and attaches a new host call to it.
    ///
    /// An idle line gets the call on its Real leg. A station already on a call
    /// takes it as a waiting call when call waiting allows.
    pub fn request(&self, search: Search, caller: Option<CallerId>, distinctive: Option<usize>) -> Result<Requested> {
        let candidates: Vec<(u32, Arc<Mutex<Line>>)> = {
            let lines = lock(&self.lines);
            let mut candidates: Vec<(u32, Arc<Mutex<Line>>)> = lines.arena.iter()
                .filter(|(number, entry)| match search {
                    Search::Line(wanted) => **number == wanted,
                    _ => entry.group == search.group(),
                })
                .map(|(number, entry)| (*number, entry.line.clone()))
                .collect();
            if search.descending() {
                candidates.reverse();
            }
            if search.round_robin() {
                if let Some(last) = lines.cursors.get(&search) {
                    let start = candidates.iter().position(|(number, _)| number == last).map(|pos| pos + 1).unwrap_or(0);
                    let len = candidates.len().max(1);
                    candidates.rotate_left(start % len);
                }
            }
            candidates
        };
        if let (Search::Line(number), true) = (search, candidates.is_empty()) {
            return Err(EngineError::NoSuchLine(number))
        }

        let now = Instant::now();
        for (number, arc) in candidates {
            let mut line = lock(&arc);
            if !line.is_available(now) {
                debug!("Line {} is not available", number);
                continue
            }
            let leg = if line.is_owned() {
                if let Err(err) = line.subs.allocate(Leg::CallWait, self.device.as_ref()) {
                    warn!("Line {}: unable to allocate call waiting leg: {}", number, err);
                    continue
                }
                Leg::CallWait
            } else {
                Leg::Real
            };
            let mut call = CallLeg::new(CallId::next(), CallState::Down);
            call.caller = caller.clone();
            call.distinctive = distinctive;
            let id = call.id;
            line.attach(leg, call);
            if leg == Leg::Real {
                line.owner = Some(Leg::Real);
            }
            drop(line);
            if search.round_robin() {
                lock(&self.lines).cursors.insert(search, number);
            }
            info!("Requested {} on line {} ({:?})", id, number, leg);
            return Ok(Requested { line: number, call: id, leg })
        }
        match search {
            Search::Line(number) => Err(EngineError::LineBusy(number)),
            other => Err(EngineError::NoneAvailable(format!("{:?}", other))),
        }
    }

    pub fn call(&self, number: u32, call: CallId, dest: &str) -> Result<()> {
        self.with_line(number, |line, env| line.place_call(env, call, dest))?
    }

    pub fn answer(&self, number: u32, call: CallId) -> Result<()> {
        self.with_line(number, |line, env| line.answer(env, call))?
    }

    pub fn hangup(&self, number: u32, call: CallId) -> Result<()> {
        self.with_line(number, |line, env| line.hangup(env, call))?
    }

    pub fn indicate(&self, number: u32, call: CallId, indication: Indication) -> Result<()> {
        self.with_line(number, |line, env| line.indicate(env, call, indication))?
    }

    pub fn read(&self, number: u32, call: CallId, buf: &mut [u8]) -> Result<usize> {
        self.with_line(number, |line, env| line.read(env, call, buf))?
    }

    pub fn write(&self, number: u32, call: CallId, data: &[u8]) -> Result<usize> {
        self.with_line(number, |line, _env| line.write(call, data))?
    }

    /// Simulates a hook flash from the subscriber.
    pub fn flash(&self, number: u32) -> Result<()> {
        self.with_line(number, |line, env| {
            line.inject(SyntheticEvent::Flash);
            line.process_events(env, MAX_EVENTS_PER_PASS);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::line::loopback::LoopbackDevice;

    #[derive(Default)]
    struct Recorder {
        actions: Mutex<Vec<HostAction>>,
    }

    impl CallControl for Recorder {
        fn originate(&self, _origination: &Origination) -> Result<()> {
            Ok(())
        }

        fn dispatch(&self, action: HostAction) {
            self.actions.lock().unwrap().push(action);
        }
    }

    fn registry(config: &str) -> (Registry, Arc<LoopbackDevice>) {
        let device = Arc::new(LoopbackDevice::new());
        let config = parse_config(config).unwrap();
        let (registry, _rx) = Registry::new(&config, device.clone(), Arc::new(Recorder::default()), Arc::new(NoMessages)).unwrap();
        (registry, device)
    }

    const GROUP: &str = r#"
        [[line]]
        channel = 1
        signalling = "fxs_ls"
        group = 1
        [[line]]
        channel = 2
        signalling = "fxs_ls"
        group = 1
        [[line]]
        channel = 3
        signalling = "fxs_ls"
        group = 1
    "#;

    #[test]
    fn search_strings() {
        assert_eq!("4".parse::<Search>().unwrap(), Search::Line(4));
        assert_eq!("g1/5551234".parse::<Search>().unwrap(), Search::Group(1));
        assert_eq!("R2".parse::<Search>().unwrap(), Search::RoundRobinDescending(2));
        assert!("x".parse::<Search>().is_err());
    }

    #[test]
    fn group_search_takes_lowest_free_line() {
        let (registry, _device) = registry(GROUP);
        assert_eq!(registry.request(Search::Group(1), None, None).unwrap().line, 1);
        assert_eq!(registry.request(Search::Group(1), None, None).unwrap().line, 2);
        assert_eq!(registry.request(Search::GroupDescending(1), None, None).unwrap().line, 3);
        assert!(matches!(registry.request(Search::Group(1), None, None), Err(EngineError::NoneAvailable(_))));
    }

    #[test]
    fn round_robin_resumes_after_last_line() {
        let (registry, _device) = registry(GROUP);
        let first = registry.request(Search::RoundRobin(1), None, None).unwrap();
        assert_eq!(first.line, 1);
        registry.hangup(1, first.call).unwrap();
        assert_eq!(registry.request(Search::RoundRobin(1), None, None).unwrap().line, 2);
    }

    #[test]
    fn round_robin_wraps_past_the_last_line() {
        let (registry, _device) = registry(&GROUP.replace("fxs_ls", "fxo_ls"));
        let calls: Vec<Requested> = (0..3).map(|_| registry.request(Search::RoundRobin(1), None, None).unwrap()).collect();
        assert_eq!(calls.iter().map(|requested| requested.line).collect::<Vec<_>>(), vec![1, 2, 3]);
        registry.hangup(1, calls[0].call).unwrap();
        assert_eq!(registry.request(Search::RoundRobin(1), None, None).unwrap().line, 1);
    }

    #[test]
    fn links_are_validated() {
        let (registry, _device) = registry(GROUP);
        registry.link(1, 2).unwrap();
        assert!(matches!(registry.link(2, 3), Err(ConfigError::InvalidLink(2, 3))));
        assert!(matches!(registry.link(1, 1), Err(ConfigError::InvalidLink(1, 1))));
        registry.unlink(2).unwrap();
        let master = registry.line(1).unwrap();
        assert!(lock(&master).slaves.is_empty());
    }

    #[test]
    fn busy_lines_are_removed_once_idle() {
        let (registry, _device) = registry(GROUP);
        let requested = registry.request(Search::Line(2), None, None).unwrap();
        assert!(matches!(registry.remove_line(2), Err(EngineError::LineBusy(2))));
        registry.hangup(2, requested.call).unwrap();
        registry.sweep_removed();
        assert_eq!(registry.numbers(), vec![1, 3]);
    }
}
