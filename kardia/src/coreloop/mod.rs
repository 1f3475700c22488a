//! The fixed-cadence driver of the whole core: owns the UDP socket, the
//! network receive workers, the core fiber pool and the ingress state, and
//! runs the main tick fiber that everything else responds to.

pub mod network;
pub mod plugin;
pub mod profile;
pub mod scheduled;
pub mod user_tick;

use crate::config::CoreConfig;
use crate::coreloop::plugin::{InboundPacket, Plugin};
use crate::db::driver::Driver;
use crate::db::gateway::DatabaseGateway;
use crate::fiber::TaskPool;
use crate::logging;
use crate::net::buffer::PacketBuffer;
use crate::net::endpoint::Endpoint;
use crate::net::ingress::Ingress;
use crate::pool::ObjectPool;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// The application composed into the core. Callbacks run on core fibers
/// and receive a `CoreHandle` for talking back to the runtime. Only
/// `client_inputs` is mandatory.
pub trait Application: Send + Sync + 'static {
    /// A peer has been seen for the first time. Runs before any
    /// `client_inputs` for that peer.
    fn new_client(&self, _core: &CoreHandle, _endpoint: Endpoint) {}

    /// One call per peer per tick carrying every datagram merged for it
    /// since the previous tick. Buffer leases return to the pool when the
    /// vector drops.
    fn client_inputs(
        &self,
        core: &CoreHandle,
        endpoint: Endpoint,
        buffers: Vec<crate::pool::PoolBox<PacketBuffer>>,
    );

    /// Runs on the tick fiber after the per-peer fanout has completed.
    fn post_network_tick(&self, _core: &CoreHandle, _diff: Duration) {}

    /// The peer has been removed; no further `client_inputs` will arrive
    /// for it.
    fn on_disconnected(&self, _core: &CoreHandle, _endpoint: Endpoint) {}

    /// Forwarded by the `UserTick` plugin.
    fn user_tick(&self, _core: &CoreHandle, _diff: Duration) {}

    /// Forwarded by a `ScheduledTick` plugin when its period elapses.
    fn scheduled_tick(&self, _core: &CoreHandle, _id: u8, _elapsed: Duration) {}
}

/// The non-generic slice of the core that plugins and application
/// callbacks borrow through `CoreHandle`.
pub(crate) struct CoreBase {
    pub(crate) config: CoreConfig,
    pub(crate) core_pool: Arc<TaskPool>,
    pub(crate) socket: UdpSocket,
    pub(crate) local_addr: SocketAddr,
    pub(crate) buffers: ObjectPool<PacketBuffer>,
    pub(crate) endpoints: ObjectPool<Endpoint>,
    pub(crate) ingress: Ingress,
    pub(crate) running: AtomicBool,
    pub(crate) log: logging::Logger,
}

/// The composed core as seen by plugins: the shared runtime state plus the
/// application. Handed to every hook as an `Arc` so fanout closures can
/// own a reference.
pub struct CoreShared<A: Application> {
    pub(crate) base: CoreBase,
    pub(crate) app: A,
}

impl<A: Application> CoreShared<A> {
    #[inline]
    pub fn app(&self) -> &A {
        &self.app
    }

    #[inline]
    pub fn handle(&self) -> CoreHandle {
        CoreHandle { base: &self.base }
    }

    #[inline]
    pub(crate) fn ingress(&self) -> &Ingress {
        &self.base.ingress
    }
}

/// The application's view of the runtime: transmit, disconnect, scheduling
/// and shutdown. Cheap to construct, borrows the core.
pub struct CoreHandle<'a> {
    base: &'a CoreBase,
}

impl<'a> CoreHandle<'a> {
    /// Send one datagram to a peer, returning the transmitted byte count.
    /// Transmission errors are logged and discarded; UDP gives no delivery
    /// promise either way.
    pub fn send(&self, endpoint: Endpoint, data: &[u8]) -> usize {
        match self.base.socket.send_to(data, endpoint.to_addr()) {
            Ok(sent) => sent,
            Err(err) => {
                logging::debug!(self.base.log, "send error";
                                "endpoint" => %endpoint,
                                "error" => %err);
                0
            }
        }
    }

    /// Send and hand the actual byte count to `callback`. The error
    /// channel for applications that care about short sends.
    #[inline]
    pub fn send_with<C: FnOnce(usize)>(&self, endpoint: Endpoint, data: &[u8], callback: C) {
        callback(self.send(endpoint, data));
    }

    /// Queue the peer for removal at the end of the current tick.
    #[inline]
    pub fn disconnect(&self, endpoint: Endpoint) {
        self.base.ingress.queue_disconnect(endpoint);
    }

    /// Ask the loop to exit after the current tick completes.
    #[inline]
    pub fn stop(&self) {
        self.base.running.store(false, Ordering::SeqCst);
    }

    /// Schedule a job on the core fiber pool.
    #[inline]
    pub fn push<F: FnOnce() + Send + 'static>(&self, job: F) {
        self.base.core_pool.push(job);
    }

    #[inline]
    pub fn log(&self) -> &logging::Logger {
        &self.base.log
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.base.local_addr
    }

    #[inline]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.base.config.heartbeat_ms)
    }
}

/// Lifecycle of the loop. Transitions are linear; anything else is a
/// programming error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoopState {
    NotStarted,
    StartingNetwork,
    StartingPools,
    Running,
    Stopping,
    Joined,
}

/// The tick loop. Construction binds the socket and builds the pools;
/// `start` brings up the thread groups and schedules the main tick fiber.
pub struct CoreLoop<A: Application, P: Plugin<A>> {
    shared: Arc<CoreShared<A>>,
    plugins: Arc<P>,
    state: Arc<Mutex<LoopState>>,
    net_threads: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
    db_pool: Mutex<Option<Arc<TaskPool>>>,
    stop_barrier: Arc<Barrier>,
    join_pools: AtomicBool,
    stopped: AtomicBool,
}

impl<A: Application, P: Plugin<A>> CoreLoop<A, P> {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: CoreConfig,
        app: A,
        plugins: P,
        log: L,
    ) -> CoreLoop<A, P> {
        if config.net_threads == 0 || config.net_threads > u8::max_value() as u16 {
            panic!("Network thread count {} out of range", config.net_threads);
        }

        let log = logging::child(log);

        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port))
            .expect("Error binding UDP socket");
        let local_addr = socket.local_addr().expect("Error reading bound address");

        logging::info!(log, "core loop created";
                       "addr" => %local_addr,
                       "core_threads" => config.core_threads,
                       "net_threads" => config.net_threads,
                       "db_threads" => config.db_threads);

        let ingress = Ingress::new(config.net_threads as u8, &log);
        let core_pool = Arc::new(TaskPool::new("core", &log));

        CoreLoop {
            shared: Arc::new(CoreShared {
                base: CoreBase {
                    config,
                    core_pool,
                    socket,
                    local_addr,
                    buffers: ObjectPool::new(),
                    endpoints: ObjectPool::new(),
                    ingress,
                    running: AtomicBool::new(false),
                    log,
                },
                app,
            }),
            plugins: Arc::new(plugins),
            state: Arc::new(Mutex::new(LoopState::NotStarted)),
            net_threads: Arc::new(Mutex::new(Vec::new())),
            db_pool: Mutex::new(None),
            stop_barrier: Arc::new(Barrier::new(2)),
            join_pools: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Bring the core up: network receive workers, the database pool (when
    /// a gateway is supplied), the main tick fiber, and finally the core
    /// fiber pool. With `join_pools` the call blocks until the loop exits;
    /// without it, `stop` synchronizes the shutdown from outside.
    pub fn start<D: Driver>(&self, db: Option<&DatabaseGateway<D>>, join_pools: bool) {
        self.transition(LoopState::NotStarted, LoopState::StartingNetwork);
        self.join_pools.store(join_pools, Ordering::SeqCst);
        self.shared.base.running.store(true, Ordering::SeqCst);

        {
            let mut handles = self.net_threads.lock().expect("Net thread registry poisoned");
            for stripe in 0..self.shared.base.config.net_threads {
                let shared = self.shared.clone();
                let plugins = self.plugins.clone();

                let handle = thread::Builder::new()
                    .name(format!("net-{}", stripe))
                    .spawn(move || receive_worker(shared, plugins, stripe as u8))
                    .expect("Error spawning network thread");
                handles.push(handle);
            }
        }

        self.transition(LoopState::StartingNetwork, LoopState::StartingPools);

        if let Some(gateway) = db {
            let pool = Arc::new(TaskPool::new("db", &self.shared.base.log));
            pool.start(self.shared.base.config.db_threads);
            gateway.attach_pool(pool.clone());
            *self.db_pool.lock().expect("Database pool slot poisoned") = Some(pool);
        }

        // The main tick fiber. It owns the shutdown sequence: when the loop
        // exits it tears down the database pool, joins the network threads
        // and signals the core pool to drain.
        {
            let shared = self.shared.clone();
            let plugins = self.plugins.clone();
            let db_pool = self.db_pool.lock().expect("Database pool slot poisoned").clone();
            let net_threads = self.net_threads.clone();
            let state = self.state.clone();
            let barrier = self.stop_barrier.clone();

            self.shared.base.core_pool.push(move || {
                run_tick_fiber(&shared, &plugins);

                *state.lock().expect("Loop state poisoned") = LoopState::Stopping;
                logging::info!(shared.base.log, "core loop stopping");

                if let Some(pool) = db_pool {
                    pool.end();
                    pool.join();
                }

                {
                    let mut handles = net_threads.lock().expect("Net thread registry poisoned");
                    for handle in handles.drain(..) {
                        handle.join().expect("Network thread panicked");
                    }
                }

                shared.base.core_pool.end();

                if !join_pools {
                    barrier.wait();
                }
            });
        }

        self.transition(LoopState::StartingPools, LoopState::Running);
        self.shared.base.core_pool.start(self.shared.base.config.core_threads);

        if join_pools {
            self.shared.base.core_pool.join();
            *self.state.lock().expect("Loop state poisoned") = LoopState::Joined;
        }
    }

    /// Cooperative shutdown from outside the loop. Flips the running flag,
    /// meets the tick fiber at the stop barrier and joins the core pool.
    /// No-op if the loop already stopped.
    pub fn stop(&self) {
        if self.state() == LoopState::NotStarted {
            return;
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.base.running.store(false, Ordering::SeqCst);

        if !self.join_pools.load(Ordering::SeqCst) {
            self.stop_barrier.wait();
            self.shared.base.core_pool.join();
            *self.state.lock().expect("Loop state poisoned") = LoopState::Joined;
        }
    }

    #[inline]
    pub fn shared(&self) -> &Arc<CoreShared<A>> {
        &self.shared
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.base.local_addr
    }

    #[inline]
    pub fn state(&self) -> LoopState {
        *self.state.lock().expect("Loop state poisoned")
    }

    fn transition(&self, from: LoopState, to: LoopState) {
        let mut state = self.state.lock().expect("Loop state poisoned");
        if *state != from {
            panic!("Invalid loop transition {:?} -> {:?} (currently {:?})", from, to, *state);
        }
        *state = to;
    }
}

/// The main tick fiber: EMA-compensated fixed cadence around the plugin
/// hooks.
fn run_tick_fiber<A: Application, P: Plugin<A>>(shared: &Arc<CoreShared<A>>, plugins: &Arc<P>) {
    let heartbeat = shared.base.config.heartbeat_ms as i64;
    let mut diff_mean = heartbeat as f32;
    let mut now = Instant::now();

    logging::info!(shared.base.log, "tick fiber running";
                   "heartbeat_ms" => heartbeat);

    while shared.base.running.load(Ordering::SeqCst) {
        let last = now;
        now = Instant::now();

        let diff = now - last;
        diff_mean = 0.95 * diff_mean + 0.05 * (diff.as_millis() as f32);

        plugins.pre_tick(shared);
        plugins.tick(shared, diff);

        // Sleep what remains of the heartbeat, pulled forward by the EMA
        // drift so a loop running over budget catches up gradually.
        let update_time =
            now.elapsed().as_millis() as i64 + (diff_mean.ceil() as i64 - heartbeat);
        if update_time < heartbeat {
            thread::sleep(Duration::from_millis((heartbeat - update_time) as u64));
        }

        plugins.post_tick(shared);
    }
}

/// One network receive worker; the worker index doubles as the ingress
/// stripe id. Each worker polls its own clone of the socket and drains it
/// on readiness, leasing a buffer and an endpoint record per datagram and
/// offering the pair to the plugins.
fn receive_worker<A: Application, P: Plugin<A>>(
    shared: Arc<CoreShared<A>>,
    plugins: Arc<P>,
    stripe: u8,
) {
    let socket = shared.base.socket.try_clone().expect("Error cloning UDP socket");
    socket.set_nonblocking(true).expect("Error configuring UDP socket");
    let mut socket = MioUdpSocket::from_std(socket);

    let mut poll = Poll::new().expect("Error creating network poll");
    poll.registry()
        .register(&mut socket, Token(stripe as usize), Interest::READABLE)
        .expect("Error registering UDP socket");
    let mut events = Events::with_capacity(64);

    while shared.base.running.load(Ordering::SeqCst) {
        if let Err(err) = poll.poll(&mut events, Some(Duration::from_millis(50))) {
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            panic!("Network poll failed: {:?}", err);
        }

        for _event in events.iter() {
            // Edge-triggered readiness: drain until the socket runs dry.
            loop {
                let mut buffer = shared.base.buffers.get();

                match socket.recv_from(buffer.storage_mut()) {
                    Ok((size, addr)) => match Endpoint::from_addr(addr) {
                        Some(value) => {
                            buffer.set_size(size);

                            let mut endpoint = shared.base.endpoints.get();
                            endpoint.set(value);

                            let mut packet = Some(InboundPacket { endpoint, buffer });
                            plugins.handle_packet(&shared, stripe, &mut packet);
                        }
                        None => {
                            logging::trace!(shared.base.log, "non-IPv4 datagram dropped";
                                            "stripe" => stripe);
                        }
                    },
                    Err(err) => {
                        if err.kind() != ErrorKind::WouldBlock {
                            logging::debug!(shared.base.log, "receive error";
                                            "stripe" => stripe,
                                            "error" => %err);
                        }
                        // The buffer lease drops here and the receive is
                        // re-armed by the next readiness event.
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coreloop::network::NetworkPlugin;
    use crate::coreloop::user_tick::UserTick;
    use crate::db::mem::MemDriver;
    use crate::pool::PoolBox;
    use crossbeam_channel::{unbounded, Receiver, Sender};
    use std::sync::atomic::AtomicU64;

    const WAIT: Duration = Duration::from_secs(3);

    struct TestApp {
        new_clients: Sender<Endpoint>,
        inputs: Sender<(Endpoint, Vec<Vec<u8>>)>,
        disconnects: Sender<Endpoint>,
        ticks: Sender<Instant>,
        drop_after_input: bool,
        stop_after_ticks: Option<u64>,
        tick_count: AtomicU64,
    }

    struct Events {
        new_clients: Receiver<Endpoint>,
        inputs: Receiver<(Endpoint, Vec<Vec<u8>>)>,
        disconnects: Receiver<Endpoint>,
        ticks: Receiver<Instant>,
    }

    impl Application for TestApp {
        fn new_client(&self, _core: &CoreHandle, endpoint: Endpoint) {
            let _ = self.new_clients.send(endpoint);
        }

        fn client_inputs(
            &self,
            core: &CoreHandle,
            endpoint: Endpoint,
            buffers: Vec<PoolBox<PacketBuffer>>,
        ) {
            let payloads = buffers.iter().map(|b| b.payload().to_vec()).collect();
            let _ = self.inputs.send((endpoint, payloads));

            if self.drop_after_input {
                core.disconnect(endpoint);
            }
        }

        fn on_disconnected(&self, _core: &CoreHandle, endpoint: Endpoint) {
            let _ = self.disconnects.send(endpoint);
        }

        fn user_tick(&self, core: &CoreHandle, _diff: Duration) {
            let _ = self.ticks.send(Instant::now());

            if let Some(limit) = self.stop_after_ticks {
                if self.tick_count.fetch_add(1, Ordering::SeqCst) + 1 >= limit {
                    core.stop();
                }
            }
        }
    }

    fn test_app(drop_after_input: bool, stop_after_ticks: Option<u64>) -> (TestApp, Events) {
        let (new_tx, new_rx) = unbounded();
        let (in_tx, in_rx) = unbounded();
        let (dis_tx, dis_rx) = unbounded();
        let (tick_tx, tick_rx) = unbounded();

        (
            TestApp {
                new_clients: new_tx,
                inputs: in_tx,
                disconnects: dis_tx,
                ticks: tick_tx,
                drop_after_input,
                stop_after_ticks,
                tick_count: AtomicU64::new(0),
            },
            Events {
                new_clients: new_rx,
                inputs: in_rx,
                disconnects: dis_rx,
                ticks: tick_rx,
            },
        )
    }

    fn config(heartbeat_ms: u64) -> CoreConfig {
        CoreConfig {
            port: 0,
            core_threads: 2,
            net_threads: 2,
            db_threads: 1,
            heartbeat_ms,
        }
    }

    fn target<A: Application, P: Plugin<A>>(core: &CoreLoop<A, P>) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], core.local_addr().port()))
    }

    #[test]
    fn test_single_peer_delivery() {
        let (app, events) = test_app(false, None);
        let core = CoreLoop::new(config(20), app, (NetworkPlugin::new(),), None);
        core.start::<MemDriver>(None, false);

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        for _ in 0..10 {
            client.send_to(b"A", target(&core)).unwrap();
        }

        // Announcement strictly precedes delivery.
        let peer = events.new_clients.recv_timeout(WAIT).unwrap();
        assert_eq!(peer.port(), client.local_addr().unwrap().port());

        let mut total = 0;
        while total < 10 {
            let (endpoint, payloads) = events.inputs.recv_timeout(WAIT).unwrap();
            assert_eq!(endpoint, peer);
            for payload in &payloads {
                assert_eq!(payload.as_slice(), b"A");
            }
            total += payloads.len();
        }
        assert_eq!(total, 10);

        core.stop();
        assert_eq!(core.state(), LoopState::Joined);

        // Every leased buffer found its way back to the pool.
        let buffers = &core.shared().base.buffers;
        assert_eq!(buffers.idle(), buffers.allocated());
    }

    #[test]
    fn test_disconnect_then_reconnect() {
        let (app, events) = test_app(true, None);
        let core = CoreLoop::new(config(20), app, (NetworkPlugin::new(),), None);
        core.start::<MemDriver>(None, false);

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"hi", target(&core)).unwrap();

        let peer = events.new_clients.recv_timeout(WAIT).unwrap();
        let (endpoint, payloads) = events.inputs.recv_timeout(WAIT).unwrap();
        assert_eq!(endpoint, peer);
        assert_eq!(payloads, vec![b"hi".to_vec()]);

        // The application disconnected the peer inside client_inputs; the
        // same tick processes it after the fanout.
        let gone = events.disconnects.recv_timeout(WAIT).unwrap();
        assert_eq!(gone, peer);

        // A datagram after disconnect processing makes the sender a brand
        // new peer.
        client.send_to(b"back", target(&core)).unwrap();
        let again = events.new_clients.recv_timeout(WAIT).unwrap();
        assert_eq!(again, peer);
        let (_, payloads) = events.inputs.recv_timeout(WAIT).unwrap();
        assert_eq!(payloads, vec![b"back".to_vec()]);

        core.stop();
    }

    #[test]
    fn test_heartbeat_cadence() {
        let (app, events) = test_app(false, None);
        let core = CoreLoop::new(config(40), app, (UserTick::new(),), None);
        core.start::<MemDriver>(None, false);

        let mut stamps = Vec::new();
        for _ in 0..20 {
            stamps.push(events.ticks.recv_timeout(WAIT).unwrap());
        }
        core.stop();

        let span = *stamps.last().unwrap() - stamps[0];
        let mean = span / (stamps.len() as u32 - 1);

        // Idle ticks track the heartbeat; generous bounds for loaded
        // machines.
        assert!(mean >= Duration::from_millis(24), "mean tick {:?}", mean);
        assert!(mean <= Duration::from_millis(64), "mean tick {:?}", mean);
    }

    #[test]
    fn test_state_machine() {
        let (app, _events) = test_app(false, None);
        let core = CoreLoop::new(config(10), app, (), None);

        assert_eq!(core.state(), LoopState::NotStarted);
        core.start::<MemDriver>(None, false);
        assert_eq!(core.state(), LoopState::Running);

        core.stop();
        assert_eq!(core.state(), LoopState::Joined);

        // Stopping twice is a no-op.
        core.stop();
        assert_eq!(core.state(), LoopState::Joined);
    }

    #[test]
    fn test_join_pools_blocks_until_stopped_from_inside() {
        let (app, events) = test_app(false, Some(3));
        let core = CoreLoop::new(config(10), app, (UserTick::new(),), None);

        // Blocks until the application stops the loop from user_tick.
        core.start::<MemDriver>(None, true);
        assert_eq!(core.state(), LoopState::Joined);
        assert!(events.ticks.len() >= 3);
    }
}
