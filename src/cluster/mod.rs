//! Sharded execution.
//!
//! Documents of a sharded collection are spread over shards by a hash of
//! their shard-key values ([`routing`]). A Remote/Gather section of a plan
//! runs once per shard behind the [`transport`], and the coordinator merges
//! the shard streams ([`blocks`]).

pub mod blocks;
pub mod routing;
pub mod transport;

pub use blocks::{Fragment, GatherBlock, RemoteBlock, ScatterBlock};
pub use routing::{shard_for_document, shard_for_key, shard_for_route};
pub use transport::{LocalTransport, ShardSender, ShardStream};
