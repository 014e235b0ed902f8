// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Heartbeat watchdog. The main loop calls [Watchdog::tick] every frame;
//! a dedicated monitor thread accumulates the time between heartbeats
//! and escalates from a one-shot warning to a fatal trap when the loop
//! stalls. Wall-clock jumps larger than the suspend threshold are
//! treated as host suspension and not accumulated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug)]
pub struct WatchdogConfig {
    /// Steps longer than this are assumed to be host suspension and are
    /// not counted against the heartbeat.
    pub suspend_threshold_ms: u64,
    pub warning_ms: u64,
    pub fatal_ms: u64,
}

/// Called with the configured threshold when it is crossed. The default
/// fatal hook aborts the process; tests inject their own.
pub type WatchdogHook = Box<dyn Fn(u64) + Send + Sync>;

struct Shared {
    running: AtomicBool,
    tick_flag: AtomicBool,
    config: WatchdogConfig,
    on_warning: WatchdogHook,
    on_fatal: WatchdogHook,
}

pub struct Watchdog {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Spawns the monitor thread. Requires `fatal_ms > warning_ms > 0`.
    pub fn start(config: WatchdogConfig) -> Self {
        Self::start_with_hooks(
            config,
            Box::new(move |warning_ms| {
                warn!(warning_ms, "main thread is unresponsive");
            }),
            Box::new(move |fatal_ms| {
                error!(fatal_ms, "main thread did not respond within the fatal threshold");
                std::process::abort();
            }),
        )
    }

    /// As [Watchdog::start] with caller-supplied threshold hooks.
    pub fn start_with_hooks(
        config: WatchdogConfig,
        on_warning: WatchdogHook,
        on_fatal: WatchdogHook,
    ) -> Self {
        assert!(config.warning_ms > 0);
        assert!(config.fatal_ms > config.warning_ms);

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            tick_flag: AtomicBool::new(false),
            config,
            on_warning,
            on_fatal,
        });
        let monitor = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("adk_watchdog".to_owned())
            .spawn(move || monitor_loop(&monitor));

        match thread {
            Ok(thread) => Self {
                shared,
                thread: Some(thread),
            },
            Err(err) => {
                error!(%err, "failed to spawn the watchdog thread");
                std::process::abort();
            }
        }
    }

    /// Records a heartbeat. Safe to call from any thread.
    pub fn tick(&self) {
        self.shared.tick_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Stops the monitor thread and joins it. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shared.running.swap(false, Ordering::Relaxed) {
            info!("terminating watchdog thread");
            self.tick();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn monitor_loop(shared: &Shared) {
    let config = shared.config;
    let mut last_observation = Instant::now();
    let mut time_since_last_tick = 0u64;
    let mut warning_reported = false;

    while shared.running.load(Ordering::Relaxed) {
        let now = Instant::now();
        let dt = now.duration_since(last_observation).as_millis() as u64;
        last_observation = now;
        // A step beyond the threshold means the host suspended us, not
        // that the main loop stalled; skip it without resetting.
        if dt <= config.suspend_threshold_ms {
            time_since_last_tick += dt;
        }

        if shared.tick_flag.swap(false, Ordering::Relaxed) {
            time_since_last_tick = 0;
            warning_reported = false;
        }

        if time_since_last_tick >= config.fatal_ms {
            (shared.on_fatal)(config.fatal_ms);
            return;
        }
        if time_since_last_tick >= config.warning_ms && !warning_reported {
            (shared.on_warning)(config.warning_ms);
            warning_reported = true;
        }

        thread::sleep(Duration::from_millis(1));
    }
}
