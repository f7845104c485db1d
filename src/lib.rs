//! Like-boost bot core: group allow-list, per-user daily quota with VIP
//! bypass, and bounded-retry dispatch to the upstream like service.

pub mod bot;
pub mod config;
pub mod gate;
pub mod ledger;
pub mod service;
pub mod store;
pub mod upstream;

pub use gate::{Decision, DenyReason, Request};
pub use service::{AdminOutcome, LikeService, Outcome, QuotaStatus};
pub use store::{JsonFileStore, MemoryStore, StateStore, StoreError, Table};
pub use upstream::{Dispatcher, UpstreamResult};
