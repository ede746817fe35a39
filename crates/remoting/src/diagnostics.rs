//! Listeners and performance counters

use crate::{Channel, ChannelError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Receives channel lifecycle notifications
pub trait ChannelListener: Send + Sync {
    /// Called once, after the channel has terminated
    fn on_closed(&self, channel: &Channel, cause: &ChannelError);
}

/// Snapshot of the remote loading statistics of a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerformanceCounters {
    /// Classes fetched from the peer
    pub classes_loaded: u64,
    /// Time spent fetching classes
    pub class_loading_time: Duration,
    /// Resources fetched from the peer
    pub resources_loaded: u64,
    /// Time spent fetching resources
    pub resource_loading_time: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    classes: AtomicU64,
    class_nanos: AtomicU64,
    resources: AtomicU64,
    resource_nanos: AtomicU64,
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

impl Counters {
    pub(crate) fn class_loaded(&self, elapsed: Duration) {
        self.classes.fetch_add(1, Ordering::Relaxed);
        self.class_nanos.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub(crate) fn resource_loaded(&self, elapsed: Duration) {
        self.resources.fetch_add(1, Ordering::Relaxed);
        self.resource_nanos.fetch_add(nanos(elapsed), Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PerformanceCounters {
        PerformanceCounters {
            classes_loaded: self.classes.load(Ordering::Relaxed),
            class_loading_time: Duration::from_nanos(self.class_nanos.load(Ordering::Relaxed)),
            resources_loaded: self.resources.load(Ordering::Relaxed),
            resource_loading_time: Duration::from_nanos(self.resource_nanos.load(Ordering::Relaxed)),
        }
    }

    pub(crate) fn reset(&self) {
        for counter in [&self.classes, &self.class_nanos, &self.resources, &self.resource_nanos] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
