//! Cluster coordination core
//!
//! Per CLUSTER_MODEL.md:
//! - Writes fan out as opaque actions to every live member's private
//!   queue; each queue has one dedicated worker applying them in FIFO
//!   order against that member's backend (CL-F1)
//! - Reads go to one READY member, chosen at random
//! - Members are eventually consistent: at any instant replicas may be at
//!   different points in the same action sequence, and that is the model
//! - A joining or repaired member copies itself from a READY template
//!   before applying ordinary writes
//! - The quorum floor (CL-Q1) keeps a multi-member cluster from losing
//!   its last READY member to a remove or quarantine
//! - A failing backend is quarantined in isolation (CL-I1); other members
//!   never observe the failure

mod config;
mod coordinator;
mod errors;
mod members;
mod queue;
mod replica;
mod status;
mod sync;

pub use config::ClusterConfig;
pub use coordinator::ClusterCoordinator;
pub use errors::{ClusterError, ClusterResult};
pub use members::{MemberList, StatusListener};
pub use queue::{QueueEvents, ReplicaQueue};
pub use replica::Replica;
pub use status::{EntryEffect, ReplicaStatus, WorkerDirective};
pub use sync::{SyncAction, Synchronizer, TableSynchronizer, Template, TemplateProvider};
