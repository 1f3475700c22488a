use crate::coreloop::plugin::Plugin;
use crate::coreloop::{Application, CoreShared};
use crate::logging;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

/// Brackets every tick with begin/end trace marks and reports the wall
/// time spent between them.
pub struct TickTimer {
    started: Mutex<Option<Instant>>,
}

impl TickTimer {
    pub fn new() -> TickTimer {
        TickTimer {
            started: Mutex::new(None),
        }
    }
}

impl<A: Application> Plugin<A> for TickTimer {
    fn pre_tick(&self, _core: &Arc<CoreShared<A>>) {
        *self.started.lock().expect("Tick timer poisoned") = Some(Instant::now());
    }

    fn post_tick(&self, core: &Arc<CoreShared<A>>) {
        if let Some(started) = self.started.lock().expect("Tick timer poisoned").take() {
            logging::trace!(core.base.log, "tick";
                            "elapsed_us" => started.elapsed().as_micros() as u64);
        }
    }
}
