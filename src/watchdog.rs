//! Process liveness watchdog.
//!
//! When the countdown expires the process is killed with SIGKILL. Nothing is
//! cleaned up; an external supervisor is expected to restart the relay.

use crate::config::RelayConfig;
use crate::counters::{CountersSnapshot, SharedCounters};
use log::{error, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const TICK: Duration = Duration::from_secs(1);

/// Grace period between the fatal log line and the kill.
const KILL_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Streaming-aware mode only: the stream has been stalled for half the timeout.
    Warn,
    Kill,
}

/// Countdown state. Owned by the watchdog thread.
#[derive(Debug)]
pub struct Watchdog {
    timeout: i64,
    streaming_aware: bool,
    remaining: i64,
    last_total: u64,
    warned: bool,
}

impl Watchdog {
    pub fn new(timeout_secs: u64, streaming_aware: bool, initial_total: u64) -> Self {
        let timeout = i64::try_from(timeout_secs).unwrap_or(i64::MAX);
        Self {
            timeout,
            streaming_aware,
            remaining: timeout,
            last_total: initial_total,
            warned: false,
        }
    }

    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    /// Advances the countdown by one tick given the current counters.
    ///
    /// In streaming-aware mode the countdown only runs while a request is
    /// open and no byte moved since the previous tick; otherwise it resets.
    /// Without streaming awareness it runs unconditionally.
    pub fn tick(&mut self, snapshot: CountersSnapshot) -> Verdict {
        if self.streaming_aware {
            let stalled = snapshot.open_requests > 0 && snapshot.total_bytes_relayed == self.last_total;
            self.last_total = snapshot.total_bytes_relayed;
            if !stalled {
                self.remaining = self.timeout;
                self.warned = false;
                return Verdict::Continue;
            }
        }

        self.remaining -= 1;
        if self.remaining <= 0 {
            return Verdict::Kill;
        }

        if self.streaming_aware && !self.warned && self.remaining <= self.timeout / 2 {
            self.warned = true;
            return Verdict::Warn;
        }

        Verdict::Continue
    }
}

/// Starts the watchdog thread when `sigkill_timeout` is non-zero.
pub fn spawn_watchdog(config: &RelayConfig, counters: Arc<SharedCounters>) -> Option<JoinHandle<()>> {
    if !config.watchdog_enabled() {
        return None;
    }

    let watchdog = Watchdog::new(
        config.sigkill_timeout,
        config.sigkill_on_stream_stop,
        counters.total_bytes_relayed(),
    );

    if config.sigkill_on_stream_stop {
        info!("Watchdog armed: kill after {}s of stalled streaming", config.sigkill_timeout);
    } else {
        info!("Watchdog armed: kill after {}s", config.sigkill_timeout);
    }

    match thread::Builder::new()
        .name("relay-watchdog".to_string())
        .spawn(move || run_watchdog(watchdog, &counters, TICK, kill_current_process))
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("Failed to start watchdog thread: {}", e);
            None
        }
    }
}

/// Drives `watchdog` once per `tick` until it demands a kill, then calls
/// `terminate`.
pub fn run_watchdog<F>(mut watchdog: Watchdog, counters: &SharedCounters, tick: Duration, terminate: F)
where
    F: FnOnce(),
{
    loop {
        thread::sleep(tick);

        match watchdog.tick(counters.snapshot()) {
            Verdict::Continue => {}
            Verdict::Warn => {
                warn!(
                    "Stream looks stalled: no data relayed for a while; the relay will be killed in {}s unless it resumes",
                    watchdog.remaining()
                );
            }
            Verdict::Kill => {
                error!("Watchdog timeout reached, killing the relay process");
                log::logger().flush();
                thread::sleep(KILL_DELAY);
                terminate();
                return;
            }
        }
    }
}

/// Kills the current process immediately, without unwinding or cleanup.
pub fn kill_current_process() {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Err(e) = signal::kill(Pid::this(), Signal::SIGKILL) {
            error!("SIGKILL failed ({}), aborting instead", e);
        }
    }

    std::process::abort();
}
