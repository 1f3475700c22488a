use crate::logging;
use crate::net::buffer::PacketBuffer;
use crate::net::endpoint::Endpoint;
use crate::pool::PoolBox;
use hashbrown::HashSet;
use indexmap::{IndexMap, IndexSet};
use std::sync::{Mutex, MutexGuard};

type BufferList = Vec<PoolBox<PacketBuffer>>;

/// Lock-striped accumulator of inbound datagrams.
///
/// Each receive worker owns one stripe and only ever locks that stripe on
/// arrival (plus the shared zone, once, when it meets an endpoint it has not
/// seen). The tick fiber merges stripe contents into the shared per-peer
/// lists once per tick, so the receive workers never contend on a global
/// lock.
///
/// Lock order: stripe mutexes in ascending index order (only the disconnect
/// path holds more than one), the shared mutex after any stripe mutexes,
/// and the disconnect mutex on its own.
pub struct Ingress {
    stripes: Vec<Mutex<Stripe>>,
    shared: Mutex<SharedZone>,
    disconnects: Mutex<Vec<Endpoint>>,
    log: logging::Logger,
}

/// Per-receive-worker partition: the endpoints this stripe has seen and the
/// buffers that arrived on it since the last merge.
struct Stripe {
    known: HashSet<Endpoint>,
    pending: IndexMap<Endpoint, BufferList>,
}

/// The tick-side zone: every known endpoint, the endpoints seen for the
/// first time since the last tick, and the durable per-peer buffer lists.
struct SharedZone {
    known: HashSet<Endpoint>,
    fresh: IndexSet<Endpoint>,
    buffers: IndexMap<Endpoint, BufferList>,
}

impl Ingress {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(stripes: u8, log: L) -> Ingress {
        Ingress {
            stripes: (0..stripes)
                .map(|_| {
                    Mutex::new(Stripe {
                        known: HashSet::new(),
                        pending: IndexMap::new(),
                    })
                })
                .collect(),
            shared: Mutex::new(SharedZone {
                known: HashSet::new(),
                fresh: IndexSet::new(),
                buffers: IndexMap::new(),
            }),
            disconnects: Mutex::new(Vec::new()),
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn stripe_count(&self) -> u8 {
        self.stripes.len() as u8
    }

    /// Record a datagram arrival on `stripe`. First contact on a stripe
    /// registers the endpoint with the shared zone; a globally unknown
    /// endpoint is also queued for the next tick's new-endpoint drain.
    pub fn arrival(&self, stripe: u8, endpoint: Endpoint, buffer: PoolBox<PacketBuffer>) {
        let mut stripe = self.lock_stripe(stripe);

        if !stripe.known.contains(&endpoint) {
            {
                let mut shared = self.lock_shared();
                if shared.known.insert(endpoint) {
                    shared.fresh.insert(endpoint);
                }
            }

            stripe.known.insert(endpoint);
        }

        stripe.pending.entry(endpoint).or_default().push(buffer);
    }

    /// Drain the endpoints first seen since the last tick, creating their
    /// durable buffer lists and announcing each through `on_new`. Called
    /// once per tick, before the stripe merge.
    pub fn drain_new<F: FnMut(Endpoint)>(&self, mut on_new: F) {
        let mut shared = self.lock_shared();

        let fresh: Vec<Endpoint> = shared.fresh.drain(..).collect();
        for endpoint in fresh {
            logging::debug!(self.log, "new peer"; "endpoint" => %endpoint);
            shared.buffers.entry(endpoint).or_default();
            on_new(endpoint);
        }
    }

    /// Fold every stripe's pending buffers into the shared per-peer lists.
    /// An endpoint that raced past the new-endpoint drain has no shared
    /// list yet; its buffers stay in the stripe until the next tick
    /// announces it.
    pub fn merge(&self) {
        for index in 0..self.stripes.len() {
            let mut stripe = self.lock_stripe(index as u8);
            if stripe.pending.is_empty() {
                continue;
            }

            let mut shared = self.lock_shared();
            let pending = std::mem::take(&mut stripe.pending);

            for (endpoint, mut buffers) in pending {
                match shared.buffers.get_mut(&endpoint) {
                    Some(list) => list.append(&mut buffers),
                    None => {
                        stripe.pending.insert(endpoint, buffers);
                    }
                }
            }
        }
    }

    /// Take the non-empty per-peer batches accumulated for this tick. The
    /// durable lists stay registered; only their contents move out.
    pub fn ready(&self) -> Vec<(Endpoint, BufferList)> {
        let mut shared = self.lock_shared();

        let mut batches = Vec::new();
        for (endpoint, list) in shared.buffers.iter_mut() {
            if !list.is_empty() {
                batches.push((*endpoint, std::mem::take(list)));
            }
        }
        batches
    }

    /// Queue an endpoint for removal at the end of the current tick.
    pub fn queue_disconnect(&self, endpoint: Endpoint) {
        self.disconnects
            .lock()
            .expect("Disconnect queue poisoned")
            .push(endpoint);
    }

    /// Remove every queued endpoint from the shared zone and all stripes,
    /// invoking `on_disconnected` for each once the locks are released. A
    /// datagram arriving after this runs re-registers the sender as a new
    /// peer.
    pub fn process_disconnects<F: FnMut(Endpoint)>(&self, mut on_disconnected: F) {
        let queued: Vec<Endpoint> = {
            let mut disconnects = self.disconnects.lock().expect("Disconnect queue poisoned");
            disconnects.drain(..).collect()
        };

        for endpoint in queued {
            {
                // All stripe locks in index order, then the shared zone.
                let mut stripes: Vec<MutexGuard<Stripe>> =
                    (0..self.stripes.len()).map(|i| self.lock_stripe(i as u8)).collect();
                let mut shared = self.lock_shared();

                shared.buffers.shift_remove(&endpoint);
                shared.known.remove(&endpoint);
                shared.fresh.shift_remove(&endpoint);

                for stripe in stripes.iter_mut() {
                    stripe.known.remove(&endpoint);
                    stripe.pending.shift_remove(&endpoint);
                }
            }

            logging::debug!(self.log, "peer disconnected"; "endpoint" => %endpoint);
            on_disconnected(endpoint);
        }
    }

    /// Whether the shared zone currently knows the endpoint.
    pub fn is_known(&self, endpoint: Endpoint) -> bool {
        self.lock_shared().known.contains(&endpoint)
    }

    /// Number of endpoints in the shared zone.
    pub fn known_count(&self) -> usize {
        self.lock_shared().known.len()
    }

    #[inline]
    fn lock_stripe(&self, index: u8) -> MutexGuard<Stripe> {
        self.stripes
            .get(index as usize)
            .unwrap_or_else(|| panic!("Stripe id {} out of range", index))
            .lock()
            .expect("Stripe mutex poisoned")
    }

    #[inline]
    fn lock_shared(&self) -> MutexGuard<SharedZone> {
        self.shared.lock().expect("Shared ingress mutex poisoned")
    }
}
