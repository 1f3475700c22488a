use clap::{Arg, Command};
use kardia::db::mem::MemDriver;
use kardia::logging;
use kardia::prelude::*;
use serde_derive::{Deserialize, Serialize};
use serde_json::json;
use sloggers::types::Severity;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const SESSIONS: CollectionKey = 0;
const JOURNAL: CollectionKey = 1;

const STATS_TICK: u8 = 0;

#[derive(Serialize, Deserialize)]
struct RunnerConfig {
    core: CoreConfig,
    // The embedded store works without any tuning, so a config file may
    // omit this table entirely.
    #[serde(default)]
    database: DatabaseConfig,
}

#[derive(Serialize, Deserialize)]
struct DatabaseConfig {
    name: String,
    execute_every: u64,
}

impl Default for RunnerConfig {
    fn default() -> RunnerConfig {
        RunnerConfig {
            core: CoreConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> DatabaseConfig {
        DatabaseConfig {
            name: "kardia".to_string(),
            execute_every: 1000,
        }
    }
}

impl RunnerConfig {
    fn load<P: AsRef<Path>>(path: P) -> RunnerConfig {
        serdeconv::from_toml_file(path).expect("Error loading runner configuration file")
    }
}

/// Demo application: echoes every datagram back to its sender, registers
/// each new peer as a session document and journals input sizes through a
/// transaction. A payload of `quit` disconnects the peer; `halt` stops the
/// server.
struct EchoServer {
    gateway: DatabaseGateway<MemDriver>,
    journal: Mutex<Transaction<MemDriver>>,
    inputs_seen: AtomicU64,
}

impl Application for EchoServer {
    fn new_client(&self, core: &CoreHandle, endpoint: Endpoint) {
        logging::info!(core.log(), "client connected"; "endpoint" => %endpoint);

        let log = core.log().clone();
        self.gateway.ensure_creation(
            SESSIONS,
            json!({ "address": endpoint.to_string() }),
            move |result| match result {
                Ok(id) => {
                    logging::info!(log, "session registered"; "id" => id);
                }
                Err(err) => {
                    logging::warn!(log, "session registration failed"; "error" => %err);
                }
            },
        );
    }

    fn client_inputs(&self, core: &CoreHandle, endpoint: Endpoint, buffers: Vec<PoolBox<PacketBuffer>>) {
        self.inputs_seen.fetch_add(buffers.len() as u64, Ordering::Relaxed);

        let mut journal = self.journal.lock().expect("Journal poisoned");
        for buffer in &buffers {
            match buffer.payload() {
                b"quit" => core.disconnect(endpoint),
                b"halt" => core.stop(),
                payload => {
                    core.send(endpoint, payload);
                    journal.push_operation(
                        JOURNAL,
                        OpType::Insert,
                        json!({ "from": endpoint.to_string(), "bytes": payload.len() }),
                    );
                }
            }
        }
    }

    /// Runs via the `UserTick` plugin, after the network tick has fanned
    /// the inputs out, so everything journaled this tick is eligible for
    /// this flush.
    fn user_tick(&self, _core: &CoreHandle, diff: Duration) {
        let mut journal = self.journal.lock().expect("Journal poisoned");
        journal.update(diff.as_millis() as u64, &self.gateway, |_| {
            None::<&Transaction<MemDriver>>
        });
    }

    fn on_disconnected(&self, core: &CoreHandle, endpoint: Endpoint) {
        logging::info!(core.log(), "client disconnected"; "endpoint" => %endpoint);
    }

    fn scheduled_tick(&self, core: &CoreHandle, _id: u8, _elapsed: Duration) {
        logging::info!(core.log(), "stats";
                       "inputs" => self.inputs_seen.load(Ordering::Relaxed));
    }
}

fn main() {
    let matches = Command::new("kardia-runner")
        .about("UDP echo server on the kardia core")
        .arg(Arg::new("config").long("config").value_name("FILE"))
        .get_matches();

    let log = logging::term(Severity::Debug);

    let config = match matches.get_one::<String>("config") {
        Some(path) => RunnerConfig::load(path),
        None => RunnerConfig::default(),
    };

    let gateway = DatabaseGateway::new(
        MemDriver::new(),
        &config.database.name,
        vec![(SESSIONS, "sessions"), (JOURNAL, "journal")],
        &log,
    );

    let app = EchoServer {
        journal: Mutex::new(Transaction::new(&gateway, config.database.execute_every)),
        gateway: gateway.clone(),
        inputs_seen: AtomicU64::new(0),
    };

    let core = CoreLoop::new(
        config.core,
        app,
        (
            TickTimer::new(),
            NetworkPlugin::new(),
            ScheduledTick::new(STATS_TICK, Duration::from_secs(10)),
            UserTick::new(),
        ),
        &log,
    );

    core.start(Some(&gateway), true);
}
