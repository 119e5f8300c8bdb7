//! # sync-core
//!
//! Pure logic for cardsync (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for peer
//! pairing and card reconciliation without any network or disk I/O,
//! enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (transport, storage) is performed by `sync-peer`, which
//! interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod directory;
pub mod health;
pub mod policy;
pub mod reconcile;
pub mod session;

pub use directory::{FoundOutcome, PeerDirectory, PeerEntry, PeerStatus, DEFAULT_INVITE_TIMEOUT};
pub use health::{reconcile as reconcile_health, HealthReport};
pub use policy::{AcceptancePolicy, NameHints};
pub use reconcile::{resolve, ChangeType, ConflictPolicy, Resolution};
pub use session::{BookAction, PeerBook, PeerConnectionState, PhaseAction, PhaseEvent, SessionPhase};
