use crate::coreloop::plugin::Plugin;
use crate::coreloop::{Application, CoreShared};
use std::sync::Arc;
use std::time::Duration;

/// Forwards the bare tick to `Application::user_tick`.
pub struct UserTick;

impl UserTick {
    pub fn new() -> UserTick {
        UserTick
    }
}

impl<A: Application> Plugin<A> for UserTick {
    #[inline]
    fn tick(&self, core: &Arc<CoreShared<A>>, diff: Duration) {
        core.app.user_tick(&core.handle(), diff);
    }
}
