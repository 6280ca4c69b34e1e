//! Starling Core -- the replication substrate: Hybrid Logical Clock, encoded
//! document model, field-level LWW merge, and the transactional store.
//!
//! This crate provides the local-first replication layer:
//!
//! - **Eventstamp** ([`eventstamp`]): total-ordered stamp codec
//! - **Clock** ([`clock`]): Hybrid Logical Clock for causal stamp generation
//! - **Document** ([`document`]): the `data`/`eventstamps`/`deletedAt` encoded form
//! - **Merge** ([`merge`]): recursive field-level Last-Write-Wins
//! - **Store** ([`store`]): per-collection transactional map with reactive queries
//! - **Error** ([`error`]): the crate's error enum

pub mod clock;
pub mod document;
pub mod error;
pub mod eventstamp;
pub mod merge;
pub mod store;

pub use clock::{ClockSource, SystemClock, HLC};
pub use document::{EncodedDocument, Record, StampTree, Value};
pub use error::{Result, StarlingError};
pub use eventstamp::Eventstamp;
pub use merge::{merge_attributes, merge_collections, merge_resources, MergedDocument, Transition};
pub use store::{
    Batch, IdGenerator, QueryId, Snapshot, Store, StorageAdapter, SubscriptionId, SyncPort,
    Transaction, UuidGenerator,
};
