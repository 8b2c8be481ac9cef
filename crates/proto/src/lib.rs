//! Wire protocols spoken between SAO nodes: signed client proposals, the
//! shard assign/complete and load/migrate message families, and the
//! length-prefixed JSON frame codec they ride on.

pub mod frame;
pub mod model;
pub mod patch;
pub mod proposal;
pub mod shard;

pub use frame::{read_frame, write_frame, Envelope};
pub use proposal::{
    MetadataProposal, Operation, OrderProposal, OrderRenewProposal, OrderStoreProposal,
    OrderTerminateProposal, Permission, PermissionProposal, QueryProposal, RelayProposal,
    RenewProposal, TerminateProposal,
};
pub use shard::{
    AssignTxType, ShardAssignReq, ShardAssignResp, ShardCompleteReq, ShardCompleteResp,
    ShardLoadReq, ShardLoadResp, ShardMigrateReq, ShardMigrateResp,
};
