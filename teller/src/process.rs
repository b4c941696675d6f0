//! Destructive recovery: terminating the external process tree.
//!
//! The legacy application offers no way to cancel a stuck operation, so the
//! only recovery primitive is killing every related process and launching
//! again. All of that goes through a [`ProcessReaper`] owned by the session
//! controller.

use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

use crate::errors::SessionError;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub trait ProcessReaper: Send + Sync {
    /// Asks every process whose executable name contains `pattern`
    /// (case-insensitive) to terminate and returns how many were signalled.
    fn reap(&self, pattern: &str) -> usize;

    /// Force-kills every process matching `pattern`.
    fn kill(&self, pattern: &str) -> usize;

    /// Counts live processes whose executable name contains `pattern`.
    fn count(&self, pattern: &str) -> usize;
}

/// Asks all processes matching any of `patterns` to terminate. Safe to call
/// when nothing is running.
pub fn reap_all(reaper: &dyn ProcessReaper, patterns: &[String]) -> usize {
    let mut total = 0;
    for pattern in patterns {
        let reaped = reaper.reap(pattern);
        if reaped > 0 {
            info!("Terminated {} process(es) matching '{}'", reaped, pattern);
        }
        total += reaped;
    }
    total
}

/// Waits until no process matches `patterns`. Survivors still running after
/// `grace` are force-killed; anything left after `timeout` is an error.
pub async fn confirm_exited(
    reaper: &dyn ProcessReaper,
    patterns: &[String],
    grace: Duration,
    timeout: Duration,
) -> Result<(), SessionError> {
    let started = Instant::now();
    let mut escalated = false;

    loop {
        let survivors: Vec<(&String, usize)> = patterns
            .iter()
            .map(|pattern| (pattern, reaper.count(pattern)))
            .filter(|(_, count)| *count > 0)
            .collect();
        let Some(&(pattern, count)) = survivors.first() else {
            return Ok(());
        };

        let elapsed = started.elapsed();
        if !escalated && elapsed >= grace {
            for (pattern, count) in &survivors {
                warn!(
                    "{} process(es) matching '{}' ignored terminate, killing",
                    count, pattern
                );
                reaper.kill(pattern);
            }
            escalated = true;
            continue;
        }
        if elapsed >= timeout {
            return Err(SessionError::ProcessesSurvived {
                pattern: pattern.clone(),
                count,
            });
        }
        debug!(%pattern, count, "Waiting for processes to exit");
        tokio::time::sleep(EXIT_POLL_INTERVAL.min(timeout - elapsed)).await;
    }
}

/// [`ProcessReaper`] backed by the host process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoReaper;

impl SysinfoReaper {
    fn snapshot() -> System {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
    }

    fn signal_matching(pattern: &str, signal: Signal) -> usize {
        let needle = pattern.to_lowercase();
        let system = Self::snapshot();
        let mut signalled = 0;

        for (pid, process) in system.processes() {
            let name = process.name().to_string_lossy().to_lowercase();
            if !name.contains(&needle) {
                continue;
            }
            // Platforms without SIGTERM fall back to kill.
            let sent = match signal {
                Signal::Kill => process.kill(),
                other => process.kill_with(other).unwrap_or_else(|| process.kill()),
            };
            if sent {
                debug!("Sent {:?} to process {} ({})", signal, pid, name);
                signalled += 1;
            } else {
                debug!("Process {} ({}) already gone or access denied", pid, name);
            }
        }
        signalled
    }
}

impl ProcessReaper for SysinfoReaper {
    fn reap(&self, pattern: &str) -> usize {
        Self::signal_matching(pattern, Signal::Term)
    }

    fn kill(&self, pattern: &str) -> usize {
        Self::signal_matching(pattern, Signal::Kill)
    }

    fn count(&self, pattern: &str) -> usize {
        let needle = pattern.to_lowercase();
        Self::snapshot()
            .processes()
            .values()
            .filter(|p| p.name().to_string_lossy().to_lowercase().contains(&needle))
            .count()
    }
}
