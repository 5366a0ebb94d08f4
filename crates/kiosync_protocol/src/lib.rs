//! # kiosync Protocol
//!
//! Endpoint, checkpoint and request/response envelope types for kiosync.
//!
//! This crate provides:
//! - `EndpointId` / `Endpoint` for the primary/secondary endpoint pair
//! - `CollectionSyncConfig` describing how each endpoint names its fields
//! - `Checkpoint`, `Document` and `LocalChange` records
//! - Pull and push request envelopes and the normalized pull envelope
//! - `CheckpointAdapter`, which translates between endpoint wire shapes
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod checkpoint;
mod collection;
mod document;
mod endpoint;
mod error;
mod messages;

pub use adapter::CheckpointAdapter;
pub use checkpoint::{Checkpoint, Cursor};
pub use collection::{CollectionId, CollectionSyncConfig, EndpointWireFields};
pub use document::{Document, LocalChange};
pub use endpoint::{Endpoint, EndpointId, EndpointPair};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{PullEnvelope, PullRequest, PushRequest, PushRow};
