pub mod kubernetes;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::target::TargetGroup;

/// Produces target groups until `shutdown` is cancelled.
///
/// A discoverer does not know whether an actual change happened; it
/// guarantees that it sends a new group whenever one might have. Consumers
/// deduplicate by group source.
#[async_trait]
pub trait Discoverer: Send + 'static {
    async fn discover(
        self: Box<Self>,
        out: mpsc::Sender<Vec<TargetGroup>>,
        shutdown: CancellationToken,
    );
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no discoverers configured")]
    NoDiscoverers,

    #[error("debounce interval must be positive")]
    ZeroInterval,
}

fn default_interval() -> u64 {
    5
}

/// Discovery section of the agent configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Seconds between debounced emissions of the accumulated group set.
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Kubernetes discoverers, one per role configuration.
    #[serde(default)]
    pub k8s: Vec<kubernetes::Config>,
}

impl Config {
    pub async fn build(&self) -> crate::Result<Manager> {
        let mut discoverers: Vec<Box<dyn Discoverer>> = Vec::with_capacity(self.k8s.len());
        for config in &self.k8s {
            discoverers.push(Box::new(config.build().await?));
        }

        Ok(Manager::new(
            discoverers,
            Duration::from_secs(self.interval),
        )?)
    }
}

/// Fans in a set of discoverers and emits a debounced, coalesced snapshot
/// of everything they reported since the last emission.
///
/// Each discoverer feeds a private channel whose groups are folded into a
/// shared accumulator keyed by source; a group re-announcing an unchanged
/// source simply overwrites it. A ticker drains the accumulator with a
/// non-blocking send, so a slow consumer degrades to "try again next tick"
/// and never backpressures the fold path.
pub struct Manager {
    discoverers: Vec<Box<dyn Discoverer>>,
    interval: Duration,
}

impl Manager {
    pub fn new(discoverers: Vec<Box<dyn Discoverer>>, interval: Duration) -> Result<Self, Error> {
        if discoverers.is_empty() {
            return Err(Error::NoDiscoverers);
        }

        if interval.is_zero() {
            return Err(Error::ZeroInterval);
        }

        Ok(Self {
            discoverers,
            interval,
        })
    }
}

#[async_trait]
impl Discoverer for Manager {
    async fn discover(
        self: Box<Self>,
        out: mpsc::Sender<Vec<TargetGroup>>,
        shutdown: CancellationToken,
    ) {
        let accum = Arc::new(Mutex::new(HashMap::<String, TargetGroup>::new()));
        let pending = Arc::new(AtomicBool::new(false));

        let mut tasks = JoinSet::new();
        for discoverer in self.discoverers {
            let (tx, mut rx) = mpsc::channel::<Vec<TargetGroup>>(16);
            tasks.spawn(discoverer.discover(tx, shutdown.clone()));

            let accum = Arc::clone(&accum);
            let pending = Arc::clone(&pending);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                loop {
                    let groups = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        received = rx.recv() => match received {
                            Some(groups) => groups,
                            // a discoverer exiting stops contributing,
                            // nothing more
                            None => break,
                        },
                    };

                    let mut accum = accum.lock().unwrap();
                    for group in groups {
                        accum.insert(group.source.clone(), group);
                    }
                    pending.store(true, Ordering::Release);
                }
            });
        }

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            if pending
                .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let mut accum = accum.lock().unwrap();
            if accum.is_empty() {
                continue;
            }

            let groups = accum.drain().map(|(_, group)| group).collect::<Vec<_>>();
            match out.try_send(groups) {
                Ok(()) => {}
                Err(TrySendError::Full(groups)) => {
                    // consumer not ready, put everything back and try
                    // again next tick
                    for group in groups {
                        accum.insert(group.source.clone(), group);
                    }
                    pending.store(true, Ordering::Release);
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }

        // cancelled, or the consumer is gone; either way stop folding
        tasks.shutdown().await;
    }
}
