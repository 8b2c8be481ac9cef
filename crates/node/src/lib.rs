//! SAO storage node.
//!
//! The shard lifecycle engine shared by gateway and provider roles: the
//! provider worker state machine, the gateway order coordinator, the
//! migration engine, the durable order/shard/migration index and the
//! peer transport for the shard protocols.

pub mod api;
pub mod cli;
pub mod gateway;
pub mod index;
pub mod model;
pub mod node;
pub mod repo;
pub mod server;
pub mod state;
pub mod storage;
pub mod transport;

pub use gateway::{CommitResult, FetchResult, GatewayService};
pub use model::ModelManager;
pub use node::Node;
pub use state::{MigrateInfo, MigrateState, OrderInfo, OrderState, ShardInfo, ShardState, MAX_RETRIES};
pub use storage::StorageService;
