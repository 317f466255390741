//! Group membership: the local projection, per-group subscription workers,
//! and the reconciler that keeps both in line with core's view.

pub mod reconciler;
pub mod registry;
pub mod retry;

pub use reconciler::{Reconciler, SubscribeOutcome};
pub use registry::{GroupInfo, GroupRegistry, SubscriptionFailure, Ticket};
pub use retry::{Exhausted, RetryPolicy, SubscriptionWorker};
