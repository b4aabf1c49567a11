//! chaincommit-core — event delivery and commit confirmation for a
//! permissioned ledger client.
//!
//! # Architecture
//!
//! ```text
//! ChannelTransport (peer connections)
//!     ├── ChannelBlockEventSource ─┬── OrderedBlockEventSource  (in order, no gaps, no duplicates)
//!     │                            │       └── ListenerSession   (checkpointed block / transaction listeners)
//!     │                            └── TransactionCommitHandler  (CommitStrategy over per-peer outcomes)
//!     ├── ChannelContractEventSource (pattern-matched chaincode events)
//!     └── PeerDisconnectSourceFactory ── TransactionCommitHandler
//!
//! EventContext wires the above together for one channel.
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use chaincommit_core::{
//!     init_tracing, BlockEvent, EventConfig, EventContext, InMemoryChannel, ListenOptions, LogConfig,
//!     MemoryCheckpointer, SharedCheckpointer,
//! };
//!
//! init_tracing(&LogConfig::default().with_target("chaincommit-core", "debug"));
//!
//! let channel = Arc::new(InMemoryChannel::new("mychannel"));
//! let context = EventContext::new(channel.clone(), EventConfig::for_organization("Org1MSP"));
//! let checkpoint = SharedCheckpointer::new(MemoryCheckpointer::new());
//! context
//!     .add_block_listener_with(
//!         Arc::new(|block: &Arc<BlockEvent>| println!("block {}", block.block_number)),
//!         ListenOptions::checkpointed(checkpoint.clone()),
//!     )
//!     .unwrap();
//!
//! channel.send_block(BlockEvent::empty(1));
//! assert_eq!(checkpoint.block_number().unwrap(), Some(2));
//! ```

pub mod block_source;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod contract;
pub mod disconnect;
pub mod error;
pub mod handler;
pub mod listener;
pub mod registry;
pub mod session;
pub mod strategy;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use block_source::{BlockEventSource, BlockStream, ChannelBlockEventSource, OrderedBlockEventSource};
pub use checkpoint::{
    CheckpointRecord, CheckpointStore, Checkpointer, MemoryCheckpointStore, MemoryCheckpointer, SharedCheckpointer,
};
pub use config::EventConfig;
pub use context::{EventContext, ListenOptions};
pub use contract::{ChannelContractEventSource, ContractEventFilter, ContractEventSource};
pub use disconnect::{ChannelPeerDisconnectSource, PeerDisconnectSource, PeerDisconnectSourceFactory};
pub use error::GatewayError;
pub use handler::{CommitHandler, CommitPolicy, CommitState, NoOpCommitHandler, TransactionCommitHandler};
pub use listener::{BlockListener, ContractListener, DisconnectListener, TransactionListener};
pub use registry::{ListenerId, ListenerRegistry};
pub use session::{BlockPolicy, CheckpointPolicy, ListenerSession, TransactionPolicy};
pub use strategy::{AllCommitStrategy, AnyCommitStrategy, CommitOutcome, CommitStrategy, OutcomeLedger, PeerScope, Verdict};
pub use telemetry::{init_tracing, LogConfig, LogFormat};
pub use transport::{ChannelTransport, InMemoryChannel, TransportHandle};
pub use types::{BlockEvent, ChaincodeEvent, ContractEvent, Peer, PeerDisconnectEvent, PeerRef, TransactionEvent};
