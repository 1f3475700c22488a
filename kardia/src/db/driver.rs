use std::fmt;

/// Documents handed to the driver. All persisted documents are JSON-shaped
/// objects; the server generates the 64-bit `_id`, everything else is
/// application-defined.
pub type Document = serde_json::Value;

/// Collection keys are small integers mapped to collection names by the
/// gateway.
pub type CollectionKey = u8;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DriverError {
    /// An insert collided with an existing `_id`.
    DuplicateKey,
    /// Any other driver-reported failure.
    Other(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DriverError::DuplicateKey => write!(f, "duplicate key"),
            DriverError::Other(message) => write!(f, "{}", message),
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// The document-database collaborator. The core never talks to a concrete
/// driver; it checks clients out of the driver's pool, resolves database and
/// collection handles, and runs single inserts or bulk writes through this
/// seam. Implementations decide what the handles actually are.
pub trait Driver: Send + Sync + 'static {
    type Client: Send;
    type Database;
    type Collection;
    type Bulk: BulkOperation;

    /// Check a client out of the connection pool.
    fn checkout(&self) -> Self::Client;

    /// Return a client to the connection pool.
    fn checkin(&self, client: Self::Client);

    /// Cheap liveness probe, run once at gateway construction.
    fn ping(&self) -> DriverResult<()>;

    fn database(&self, client: &Self::Client, name: &str) -> Self::Database;

    fn collection(&self, database: &Self::Database, name: &str) -> Self::Collection;

    /// Insert one document. The document is consumed either way.
    fn insert_one(&self, collection: &Self::Collection, document: Document) -> DriverResult<()>;

    fn create_bulk(&self, collection: &Self::Collection) -> Self::Bulk;

    /// Execute an assembled bulk write, returning the reply document.
    fn execute_bulk(&self, collection: &Self::Collection, bulk: Self::Bulk)
        -> DriverResult<Document>;
}

/// An ordered batch of write operations submitted as one wire operation.
/// Operations are appended in push order; documents are consumed.
pub trait BulkOperation {
    fn insert(&mut self, document: Document);

    fn update_one(&mut self, filter: Document, update: Document);

    fn update_many(&mut self, filter: Document, update: Document);

    /// Update with upsert semantics (used for both one/many upsert ops).
    fn upsert(&mut self, filter: Document, update: Document);

    fn delete(&mut self, filter: Document);

    fn len(&self) -> usize;
}
