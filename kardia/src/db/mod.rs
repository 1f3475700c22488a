//! Persistence: the document-database collaborator contract, the gateway
//! that schedules work on the database fiber pool, the unpredictable-id
//! generator, and the per-entity transaction engine.

pub mod driver;
pub mod gateway;
pub mod mem;
pub mod transaction;
pub mod unique_id;
