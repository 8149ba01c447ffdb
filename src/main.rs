use std::collections::BTreeMap;
use std::env;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use spin_sleep::LoopHelper;
use analog_line::codec::{FRAME_MS, FRAME_SAMPLES};
use analog_line::host::{HangupCause, NoMessages, Origination};
use analog_line::line::loopback::LoopbackDevice;
use analog_line::{load_config, CallControl, CallId, EngineError, HostAction, Monitor, Registry};

const CONFIG_PATH: &str = "./analog_line.toml";

/// A host that keeps every call it is handed and logs the rest.
#[derive(Default)]
struct ConsoleHost {
    calls: Mutex<BTreeMap<CallId, u32>>,
    hangups: Mutex<Vec<(u32, CallId)>>,
}

impl CallControl for ConsoleHost {
    fn originate(&self, origination: &Origination) -> Result<(), EngineError> {
        info!("Host: new {} on line {} ({:?}) in '{}'", origination.call, origination.line, origination.state, origination.context);
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).insert(origination.call, origination.line);
        Ok(())
    }

    fn dispatch(&self, action: HostAction) {
        match action {
            HostAction::Hangup(call, cause) => {
                let line = self.calls.lock().unwrap_or_else(|e| e.into_inner()).remove(&call);
                if let Some(line) = line {
                    if cause != HangupCause::Normal {
                        warn!("Host: {} on line {} hung up ({:?})", call, line, cause);
                    }
                    self.hangups.lock().unwrap_or_else(|e| e.into_inner()).push((line, call));
                }
            },
            other => info!("Host: {:?}", other),
        }
    }
}

fn main() {
    let path = env::args().nth(1).unwrap_or_else(|| CONFIG_PATH.to_owned());
    let config = match load_config(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Unable to load {}: {}", path, err);
            std::process::exit(1);
        }
    };

    let level = config.log.level.parse().unwrap_or(LevelFilter::Info);
    let log_config = ConfigBuilder::new().set_time_format_rfc3339().build();
    if let Err(err) = TermLogger::init(level, log_config, TerminalMode::Mixed, ColorChoice::Auto) {
        eprintln!("Unable to start logger: {}", err);
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(err) = ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)) {
            warn!("Unable to install Ctrl-C handler: {}", err);
        }
    }

    let device = Arc::new(LoopbackDevice::new());
    let host = Arc::new(ConsoleHost::default());
    let (registry, doorbell) = match Registry::new(&config, device, host.clone(), Arc::new(NoMessages)) {
        Ok(registry) => registry,
        Err(err) => {
            error!("Unable to open lines: {}", err);
            std::process::exit(1);
        }
    };
    let registry = Arc::new(registry);

    let monitor = Monitor::new(registry.clone(), doorbell, config.monitor.clone(), running.clone());
    let monitor = match monitor.spawn() {
        Ok(handle) => handle,
        Err(err) => {
            error!("Unable to start monitor: {}", err);
            std::process::exit(1);
        }
    };

    // The host side: read every live call once per frame
    let mut frame = vec![0u8; FRAME_SAMPLES];
    let mut clock = LoopHelper::builder().build_with_target_rate(1000.0 / FRAME_MS as f64);
    while running.load(Ordering::SeqCst) {
        clock.loop_start();
        let calls: Vec<(CallId, u32)> = host.calls.lock().unwrap_or_else(|e| e.into_inner())
            .iter().map(|(call, line)| (*call, *line)).collect();
        for (call, line) in calls {
            if let Err(err) = registry.read(line, call, &mut frame) {
                warn!("Read of {} on line {} failed: {}", call, line, err);
            }
        }
        let hangups = std::mem::take(&mut *host.hangups.lock().unwrap_or_else(|e| e.into_inner()));
        for (line, call) in hangups {
            if let Err(err) = registry.hangup(line, call) {
                warn!("Hangup of {} on line {} failed: {}", call, line, err);
            }
        }
        clock.loop_sleep();
    }

    info!("Shutting down");
    if monitor.join().is_err() {
        error!("Monitor thread panicked");
    }
}
