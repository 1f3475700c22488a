use crate::coreloop::plugin::{InboundPacket, Plugin};
use crate::coreloop::{Application, CoreShared};
use crate::fiber::Counter;
use std::sync::Arc;
use std::time::Duration;

/// The ingress pipeline glue: claims every received packet into the
/// striped accumulator, and on each tick announces new peers, merges the
/// stripes, fans the per-peer batches out across the core pool, runs the
/// application's post-network hook and processes deferred disconnects.
pub struct NetworkPlugin;

impl NetworkPlugin {
    pub fn new() -> NetworkPlugin {
        NetworkPlugin
    }
}

impl<A: Application> Plugin<A> for NetworkPlugin {
    fn tick(&self, core: &Arc<CoreShared<A>>, diff: Duration) {
        let ingress = core.ingress();

        ingress.drain_new(|endpoint| {
            core.app.new_client(&core.handle(), endpoint);
        });

        ingress.merge();

        let batches = ingress.ready();
        if !batches.is_empty() {
            // Every batch must complete before the tick moves on; the wait
            // drains queued jobs so a small pool cannot deadlock on its own
            // fanout.
            let counter = Counter::new();
            for (endpoint, buffers) in batches {
                let shared = core.clone();
                core.base.core_pool.push_with(
                    move || {
                        shared.app.client_inputs(&shared.handle(), endpoint, buffers);
                    },
                    &counter,
                );
            }
            core.base.core_pool.wait(&counter);
        }

        core.app.post_network_tick(&core.handle(), diff);

        ingress.process_disconnects(|endpoint| {
            core.app.on_disconnected(&core.handle(), endpoint);
        });
    }

    fn handle_packet(
        &self,
        core: &Arc<CoreShared<A>>,
        stripe: u8,
        packet: &mut Option<InboundPacket>,
    ) {
        if let Some(packet) = packet.take() {
            // The accumulation itself runs on a core fiber so the receive
            // worker returns to its socket immediately.
            let shared = core.clone();
            core.base.core_pool.push(move || {
                let InboundPacket { endpoint, buffer } = packet;
                shared.ingress().arrival(stripe, *endpoint, buffer);
                // The endpoint record lease drops here; the stripe keeps a
                // value copy.
            });
        }
    }
}
