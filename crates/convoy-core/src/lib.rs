//! Core types and traits for the Convoy simulation scheduler.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the contracts the scheduling engine is built on: identifiers and the
//! simulation clock, double-buffered state cells, the [`Entity`] trait
//! implemented by domain roles, inter-entity messages, and error types.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod buffered;
pub mod entity;
pub mod error;
pub mod id;
pub mod message;

pub use buffered::{Buffered, BufferedBase, BufferedDataManager, FixedDelayed};
pub use entity::{Entity, SubscriptionList, TickContext, UpdateStatus};
pub use error::EntityError;
pub use id::{EntityId, GroupId, TickId, Timeslice, WorkerId};
pub use message::{Message, MessagePayload};
