use crate::coreloop::plugin::Plugin;
use crate::coreloop::{Application, CoreShared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fires `Application::scheduled_tick` once every `every` of accumulated
/// base time. Several instances with distinct ids compose into one core to
/// drive sub-systems at different cadences.
pub struct ScheduledTick {
    id: u8,
    every_ms: u64,
    elapsed_ms: AtomicU64,
}

impl ScheduledTick {
    pub fn new(id: u8, every: Duration) -> ScheduledTick {
        ScheduledTick {
            id,
            every_ms: every.as_millis() as u64,
            elapsed_ms: AtomicU64::new(0),
        }
    }
}

impl<A: Application> Plugin<A> for ScheduledTick {
    fn tick(&self, core: &Arc<CoreShared<A>>, diff: Duration) {
        let elapsed =
            self.elapsed_ms.fetch_add(diff.as_millis() as u64, Ordering::Relaxed)
                + diff.as_millis() as u64;

        if elapsed > self.every_ms {
            self.elapsed_ms.store(0, Ordering::Relaxed);
            core.app
                .scheduled_tick(&core.handle(), self.id, Duration::from_millis(elapsed));
        }
    }
}
