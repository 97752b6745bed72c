//! Rapid-fire message coalescing engine.
//!
//! Producers append per-sender fragments to a shared expiring store; a
//! poller decides when a sender's burst is over and hands the merged text to
//! a downstream [`Dispatcher`] exactly once per successful claim.

mod dispatch;
mod error;
mod fragment;
mod keys;
mod poller;
mod readiness;
mod settings;
mod stats;
mod store;

pub use dispatch::Dispatcher;
pub use error::{BatchError, Result};
pub use fragment::{MergedBatch, MessageFragment};
pub use keys::{DEFAULT_KEY_PREFIX, KeySpace, SenderKey};
pub use poller::{CoalescingPoller, PollerStatus, ScanReport};
pub use readiness::{Readiness, ReadinessPolicy, ScanMode, is_ready};
pub use settings::BatchSettings;
pub use stats::{BatchStats, SenderStats};
pub use store::{BatchStore, DrainedBatch, EnqueueReceipt};
