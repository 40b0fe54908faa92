mod mutex;
mod queue;

pub use mutex::{GuestMutex, SyncError};
pub use queue::{GuestQueue, QueueError};
