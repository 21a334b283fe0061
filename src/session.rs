//! Background refresh of a [`TopologyRegistry`]
//!
//! A single worker thread runs the initial discovery pass, then re-runs
//! `refresh_peers` on a self re-arming timer. Refreshes never overlap, and
//! the timer is cancelled by stopping (or dropping) the session.

use crate::settings::SessionSettings;
use crate::topology::{RefreshReport, TopologyRegistry};
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    /// Delay after the first pass and after cycles with no new nodes
    pub fast_interval: Duration,
    /// Delay after a cycle that added nodes
    pub slow_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(2),
            slow_interval: Duration::from_secs(5),
        }
    }
}

impl From<&SessionSettings> for SessionOptions {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            fast_interval: settings.fast_interval(),
            slow_interval: settings.slow_interval(),
        }
    }
}

/// Interval before the refresh that follows `report`
pub fn next_interval(report: &RefreshReport, options: &SessionOptions) -> Duration {
    if report.new_nodes() > 0 {
        options.slow_interval
    } else {
        options.fast_interval
    }
}

pub struct Session {
    registry: Arc<TopologyRegistry>,
    cancel: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Session {
    /// Spawn the worker; the first discovery pass starts immediately
    pub fn start(registry: Arc<TopologyRegistry>, options: SessionOptions) -> io::Result<Self> {
        let (cancel_tx, cancel_rx) = mpsc::channel();
        let worker_registry = registry.clone();
        let worker = thread::Builder::new()
            .name("netglobe-refresh".to_string())
            .spawn(move || run(&worker_registry, options, cancel_rx))?;

        info!("session started");
        Ok(Self {
            registry,
            cancel: Some(cancel_tx),
            worker: Some(worker),
        })
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    /// Cancel the timer and wait for an in-flight refresh to finish
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("refresh worker panicked");
            }
            info!("session stopped");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(registry: &TopologyRegistry, options: SessionOptions, cancel: Receiver<()>) {
    info!("initial discovery pass");
    discover_self(registry);
    if let Err(e) = registry.refresh_peers() {
        warn!("initial discovery failed: {}", e);
    }
    let mut interval = options.fast_interval;

    loop {
        debug!("next refresh in {:?}", interval);
        match cancel.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        if registry.self_node().is_none() {
            discover_self(registry);
        }

        interval = match registry.refresh_peers() {
            Ok(report) => next_interval(&report, &options),
            Err(e) => {
                warn!("refresh failed: {}", e);
                options.fast_interval
            }
        };
    }
}

fn discover_self(registry: &TopologyRegistry) {
    match registry.discover_self() {
        Ok(Some(node)) => info!("self at {:.4}, {:.4} ({})", node.location.lat, node.location.lon, node.ip),
        Ok(None) => {}
        Err(e) => warn!("locating this host failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_nodes_slow_the_timer() {
        let options = SessionOptions::default();
        let busy = RefreshReport {
            hops_created: 2,
            ..RefreshReport::default()
        };
        let quiet = RefreshReport {
            scanned: 4,
            updated: 4,
            ..RefreshReport::default()
        };
        assert_eq!(next_interval(&busy, &options), Duration::from_secs(5));
        assert_eq!(next_interval(&quiet, &options), Duration::from_secs(2));
    }

    #[test]
    fn options_from_settings() {
        let settings = SessionSettings {
            fast_interval_secs: 0.5,
            slow_interval_secs: 1.5,
            ..SessionSettings::default()
        };
        let options = SessionOptions::from(&settings);
        assert_eq!(options.fast_interval, Duration::from_millis(500));
        assert_eq!(options.slow_interval, Duration::from_millis(1500));
    }
}
