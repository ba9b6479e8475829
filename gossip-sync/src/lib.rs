//! TRv1 Gossip Sync Control Plane
//!
//! This crate decides *when* and *with whom* a gossip node synchronizes
//! events, while leaving the exchange itself to a [`Synchronizer`]
//! supplied by the caller. It handles:
//!
//! - **Sync permits**: a bounded pool caps how many exchanges run at once,
//!   shrunk further by suspended intake work and by backlog pressure.
//! - **Backpressure**: a snarfer thread takes permits out of circulation in
//!   proportion to the intake backlog.
//! - **Fallen-behind detection**: peer reports are aggregated into a single
//!   node-wide decision.
//! - **Reconnect**: when behind, ordinary syncing is paused and a validated
//!   state snapshot is installed from a peer that is ahead of us.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────┐
//!  │  GossipController (start / stop / pause / resume) │
//!  └──────┬──────────────────┬────────────────┬────────┘
//!         │                  │                │
//!  ┌──────▼──────┐   ┌───────▼───────┐  ┌─────▼─────────┐
//!  │ SyncStrategy│   │ PermitSnarfer │  │ Reconnect     │
//!  │ loops       │   │ (backlog)     │  │ Coordinator   │
//!  └──┬───────┬──┘   └───────┬───────┘  └──┬─────────┬──┘
//!     │       │              │             │         │
//!     │  ┌────▼──────────────▼────┐        │  ┌──────▼──────────┐
//!     │  │ PermitPool             │◀───────┘  │ FallenBehind    │
//!     │  │ (permits, suspension)  │  drain    │ Tracker         │
//!     │  └────────────────────────┘           └──────▲──────────┘
//!     │                                              │
//!     └──── Synchronizer::exchange ── SelfFallenBehind ┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]        | `GossipSyncConfig`, validation and dev overrides |
//! | [`permit_pool`]   | Concurrency permits, drain, suspension accounting |
//! | [`decay`]         | Linear decay of the suspension count |
//! | [`snarfer`]       | Backlog-driven permit withholding |
//! | [`fallen_behind`] | Aggregation of fallen-behind reports |
//! | [`reconnect`]     | Snapshot reconnect with back-off |
//! | [`worker`]        | Sync loops and strategies |
//! | [`controller`]    | Service lifecycle |
//! | [`collaborators`] | Traits implemented by the rest of the node |
//! | [`status`]        | Status transitions and their metrics |
//! | [`error`]         | Crate-wide error enums |
//!
//! [`Synchronizer`]: collaborators::Synchronizer

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod decay;
pub mod error;
pub mod fallen_behind;
pub mod lifecycle;
pub mod neighbor;
pub mod permit_pool;
pub mod reconnect;
pub mod shutdown;
pub mod snarfer;
pub mod status;
#[cfg(any(test, feature = "dev-context-only-utils"))]
pub mod test_utils;
pub mod types;
pub mod worker;

pub use {
    controller::GossipController,
    error::{GossipSyncError, Result},
    types::{ExchangeOutcome, NodeId},
};
