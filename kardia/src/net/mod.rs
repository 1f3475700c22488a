//! Network-facing data types and the lock-striped ingress accumulator that
//! folds datagrams arriving on many receive workers into per-peer batches.

pub mod buffer;
pub mod endpoint;
pub mod ingress;
