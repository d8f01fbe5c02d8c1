//! # logplane-client
//!
//! Session-based client for logplane partitions.
//!
//! A [`ClientSession`] gives exactly-once command submission against a
//! single partition: commands carry client-assigned sequence numbers,
//! retries reuse them, and the partition's session layer deduplicates.
//! A [`PartitionedClient`] layers key-based routing over one session per
//! partition.
//!
//! ```no_run
//! use logplane_client::SessionBuilder;
//! use logplane_consensus::ReadConsistency;
//!
//! # async fn run(nodes: Vec<logplane_consensus::RaftNode>) -> logplane_consensus::Result<()> {
//! let session = SessionBuilder::new("orders-service")
//!     .nodes(nodes)
//!     .read_consistency(ReadConsistency::LinearizableLease)
//!     .build()
//!     .await?;
//!
//! let response = session.command(b"reserve:42".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod partition;
pub mod session;

pub use builder::{CommunicationStrategy, RecoveryStrategy, SessionBuilder, SessionConfig};
pub use partition::{HashPartitioner, PartitionedClient, PartitionedClientBuilder, Partitioner};
pub use session::ClientSession;
