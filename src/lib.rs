mod client;
mod distributor;
mod identity;
mod messages;
mod peer;
mod peerset;
mod ratelimit;
mod retrieve;
mod serverpool;
mod storage;
mod verify;

pub use client::{LightClient, LightClientConfig};
pub use distributor::{
    CostPolicy, DistRequest, DistTicket, Dispatched, DistributorConfig, DistributorStats,
    Eligibility, MessageBuilder, RequestDistributor,
};
pub use identity::{NodeId, NodeRecord};
pub use messages::{
    Capabilities, Hash, HelperTrie, OdrMessage, OdrRequest, OdrResponse, RequestKey, RequestKind,
    WireRequest, LPV1, LPV2,
};
pub use peer::{HeadInfo, PeerConnection, PeerInfo, ServingPeer};
pub use peerset::{PeerEvent, PeerSet, PeerSetError};
pub use ratelimit::DialRateStats;
pub use retrieve::{RetrieveConfig, RetrieveError, RetrieveManager, RetrieveStats};
pub use serverpool::{
    ConnectionState, Dialer, Outcome, PoolEntryInfo, ScoreWeights, ServerPool, ServerPoolConfig,
};
pub use storage::{PoolStore, Reputation};
pub use verify::{content_hash, non_empty, VerifyError, VerifyFn};
