use crate::coreloop::{Application, CoreShared};
use crate::net::buffer::PacketBuffer;
use crate::net::endpoint::Endpoint;
use crate::pool::PoolBox;
use std::sync::Arc;
use std::time::Duration;

/// A pooled endpoint record and packet buffer traveling together through
/// the receive path.
pub struct InboundPacket {
    pub endpoint: PoolBox<Endpoint>,
    pub buffer: PoolBox<PacketBuffer>,
}

/// An optional behavior composed into the running core. Every hook takes a
/// back-pointer to the composed core; all hooks default to no-ops, so a
/// plugin implements only the capabilities it has and absent hooks
/// monomorphize away.
///
/// Plugins are composed as tuples and invoked in tuple order at each
/// extension point.
pub trait Plugin<A: Application>: Send + Sync + 'static {
    /// Runs at the top of every tick, before the tick hooks.
    fn pre_tick(&self, _core: &Arc<CoreShared<A>>) {}

    /// The per-tick hook. `diff` is the measured time since the previous
    /// tick.
    fn tick(&self, _core: &Arc<CoreShared<A>>, _diff: Duration) {}

    /// Runs after the end-of-tick sleep.
    fn post_tick(&self, _core: &Arc<CoreShared<A>>) {}

    /// Offered every received datagram, on the receive worker for
    /// `stripe`. A plugin claims the packet by taking it; an unclaimed
    /// packet falls back to the pools when the dispatch returns.
    fn handle_packet(
        &self,
        _core: &Arc<CoreShared<A>>,
        _stripe: u8,
        _packet: &mut Option<InboundPacket>,
    ) {
    }
}

impl<A: Application> Plugin<A> for () {}

macro_rules! plugin_tuple {
    ($($plugin:ident),+) => {
        impl<A: Application, $($plugin: Plugin<A>),+> Plugin<A> for ($($plugin,)+) {
            #[allow(non_snake_case)]
            fn pre_tick(&self, core: &Arc<CoreShared<A>>) {
                let ($($plugin,)+) = self;
                $($plugin.pre_tick(core);)+
            }

            #[allow(non_snake_case)]
            fn tick(&self, core: &Arc<CoreShared<A>>, diff: Duration) {
                let ($($plugin,)+) = self;
                $($plugin.tick(core, diff);)+
            }

            #[allow(non_snake_case)]
            fn post_tick(&self, core: &Arc<CoreShared<A>>) {
                let ($($plugin,)+) = self;
                $($plugin.post_tick(core);)+
            }

            #[allow(non_snake_case)]
            fn handle_packet(
                &self,
                core: &Arc<CoreShared<A>>,
                stripe: u8,
                packet: &mut Option<InboundPacket>,
            ) {
                let ($($plugin,)+) = self;
                $($plugin.handle_packet(core, stripe, packet);)+
            }
        }
    };
}

plugin_tuple!(P0);
plugin_tuple!(P0, P1);
plugin_tuple!(P0, P1, P2);
plugin_tuple!(P0, P1, P2, P3);
plugin_tuple!(P0, P1, P2, P3, P4);
