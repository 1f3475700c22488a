pub use crate::config::CoreConfig;
pub use crate::coreloop::network::NetworkPlugin;
pub use crate::coreloop::plugin::{InboundPacket, Plugin};
pub use crate::coreloop::profile::TickTimer;
pub use crate::coreloop::scheduled::ScheduledTick;
pub use crate::coreloop::user_tick::UserTick;
pub use crate::coreloop::{Application, CoreHandle, CoreLoop, CoreShared, LoopState};
pub use crate::db::driver::{BulkOperation, CollectionKey, Document, Driver, DriverError};
pub use crate::db::gateway::{DatabaseGateway, DbSession};
pub use crate::db::transaction::{Dependency, EntityId, OpId, OpType, Transaction};
pub use crate::fiber::{Counter, TaskPool};
pub use crate::net::buffer::{PacketBuffer, PACKET_CAPACITY};
pub use crate::net::endpoint::Endpoint;
pub use crate::pool::{ObjectPool, PoolBox};
