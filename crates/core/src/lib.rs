#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Spire Core
//!
//! Identifier types shared by every Spire crate.
//!
//! - **Entity identifiers** (UUID-based, `Copy`): [`RunId`], [`TicketId`], [`TenantId`]
//! - **Validated keys**: [`WorkflowId`], [`WorkerId`], [`EffectId`]
//! - **Per-run counters**: [`CheckpointId`], [`Sequence`]
//!
//! All identifiers serialize as plain strings or integers so that they are
//! safe to use as primary keys in any durable store.

pub mod id;
pub mod keys;

pub use id::*;
pub use keys::*;
