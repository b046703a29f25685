//! nimbusdb - a self-healing, eventually-consistent database replication cluster
//!
//! A client issues reads and writes against one *logical* database while the
//! writes are fanned out to a set of independent physical backends kept in
//! eventual agreement. This crate is the coordination core: membership,
//! per-replica action queues, the join/synchronization protocol, the quorum
//! floor, and the wait/notify protocol for callers that need a caught-up
//! replica.
//!
//! SQL generation, object mapping and vendor dialects live outside this
//! crate; they meet it at the [`backend`] boundary as opaque database
//! handles and replayable actions.

pub mod backend;
pub mod cluster;
pub mod observability;
pub mod settings;
