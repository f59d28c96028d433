//! Sync engine: schedules passes, pulls remote revisions into the local
//! cache, and pushes queued local changes.

pub mod backoff;
pub mod conflict;
pub mod diff;
pub mod events;
mod mutations;
mod pass;
mod reconciler;
pub mod state;


pub use backoff::BackOffManager;
pub use conflict::{ConflictChoice, ConflictReport, ConflictResolver, RejectedChange, Resolution};
pub use events::{EventBus, EventSubscription, SkipReason, SyncEvent};
pub use mutations::DecryptedItem;
pub use reconciler::{Connectivity, PassResult, SyncDependencies, SyncReconciler};
pub use state::{ShareSyncState, SyncPhase};
