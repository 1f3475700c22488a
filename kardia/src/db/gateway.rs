use crate::db::driver::{CollectionKey, Document, Driver, DriverError, DriverResult};
use crate::db::unique_id::IdGenerator;
use crate::fiber::TaskPool;
use crate::logging;
use hashbrown::HashMap;
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Wraps the database driver behind the dedicated database fiber pool.
/// Every scheduled callback checks a client out of the driver's pool,
/// resolves the database handle, runs, and checks the client back in. The
/// gateway also owns the unique-id generator and the collection key map.
///
/// The gateway is a cheap cloneable handle; it is injected explicitly into
/// every collaborator that needs it.
pub struct DatabaseGateway<D: Driver> {
    inner: Arc<GatewayInner<D>>,
}

struct GatewayInner<D: Driver> {
    driver: D,
    database: String,
    collections: HashMap<CollectionKey, String>,
    pool: Mutex<Option<Arc<TaskPool>>>,
    ids: IdGenerator,
    connected: bool,
    log: logging::Logger,
}

/// One checked-out driver session, handed to callbacks running on the
/// database pool.
pub struct DbSession<'a, D: Driver> {
    driver: &'a D,
    database: D::Database,
    collections: &'a HashMap<CollectionKey, String>,
}

impl<'a, D: Driver> DbSession<'a, D> {
    #[inline]
    pub fn driver(&self) -> &D {
        self.driver
    }

    /// Resolve a collection handle by key. Unknown keys are programming
    /// errors.
    pub fn collection(&self, key: CollectionKey) -> D::Collection {
        let name = self
            .collections
            .get(&key)
            .unwrap_or_else(|| panic!("Unknown collection key {}", key));
        self.driver.collection(&self.database, name)
    }
}

impl<D: Driver> Clone for DatabaseGateway<D> {
    #[inline]
    fn clone(&self) -> Self {
        DatabaseGateway {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Driver> DatabaseGateway<D> {
    /// Build a gateway over `driver`, pinging it once to record
    /// connectivity. `collections` maps the small integer keys used
    /// throughout the transaction engine to collection names.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        driver: D,
        database: &str,
        collections: Vec<(CollectionKey, &str)>,
        log: L,
    ) -> DatabaseGateway<D> {
        let log = logging::child(log);

        let connected = match driver.ping() {
            Ok(()) => true,
            Err(err) => {
                logging::warn!(log, "database unreachable"; "error" => %err);
                false
            }
        };

        DatabaseGateway {
            inner: Arc::new(GatewayInner {
                driver,
                database: database.to_string(),
                collections: collections
                    .into_iter()
                    .map(|(key, name)| (key, name.to_string()))
                    .collect(),
                pool: Mutex::new(None),
                ids: IdGenerator::new(),
                connected,
                log,
            }),
        }
    }

    /// Inject the database fiber pool. Done by the core loop at start.
    pub fn attach_pool(&self, pool: Arc<TaskPool>) {
        *self.inner.pool.lock().expect("Gateway pool slot poisoned") = Some(pool);
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.inner.connected
    }

    #[inline]
    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    /// The registered collection keys, in no particular order.
    pub fn collection_keys(&self) -> Vec<CollectionKey> {
        self.inner.collections.keys().copied().collect()
    }

    /// Draw a fresh non-guessable document id.
    #[inline]
    pub fn next_id(&self) -> i64 {
        self.inner.ids.next_id()
    }

    #[inline]
    pub(crate) fn log(&self) -> &logging::Logger {
        &self.inner.log
    }

    /// Schedule `function` on the database fiber pool with a checked-out
    /// session.
    pub fn execute<F>(&self, function: F)
    where
        F: FnOnce(&DbSession<D>) + Send + 'static,
    {
        let pool = self
            .inner
            .pool
            .lock()
            .expect("Gateway pool slot poisoned")
            .clone()
            .expect("Database pool not attached");

        let inner = self.inner.clone();
        pool.push(move || {
            let client = inner.driver.checkout();
            let database = inner.driver.database(&client, &inner.database);
            {
                let session = DbSession {
                    driver: &inner.driver,
                    database,
                    collections: &inner.collections,
                };
                function(&session);
            }
            inner.driver.checkin(client);
        });
    }

    /// Insert `document` with a server-generated unique `_id`, retrying
    /// with a fresh id on duplicate-key collisions. Any other driver error
    /// aborts the loop and is surfaced to the callback.
    pub fn ensure_creation<C>(&self, collection: CollectionKey, document: Document, callback: C)
    where
        C: FnOnce(DriverResult<i64>) + Send + 'static,
    {
        let gateway = self.clone();
        self.execute(move |session| {
            let handle = session.collection(collection);

            let result = loop {
                let id = gateway.next_id();

                let fields = document
                    .as_object()
                    .expect("Documents must be JSON objects");
                let mut with_id = serde_json::Map::new();
                with_id.insert("_id".to_string(), json!(id));
                for (key, value) in fields {
                    with_id.insert(key.clone(), value.clone());
                }

                match session.driver().insert_one(&handle, Document::Object(with_id)) {
                    Ok(()) => break Ok(id),
                    Err(DriverError::DuplicateKey) => {
                        logging::debug!(gateway.inner.log, "id collision, retrying";
                                        "collection" => collection);
                    }
                    Err(err) => {
                        logging::error!(gateway.inner.log, "insert failed";
                                        "collection" => collection,
                                        "error" => %err);
                        break Err(err);
                    }
                }
            };

            callback(result);
        });
    }
}
