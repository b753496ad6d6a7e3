//! Coldgate core: entity descriptors, deferred-operation vocabulary, and
//! status-report types shared between the gateway server and its clients.

pub mod entity;
pub mod ops;
pub mod status;

pub use entity::{DataInfo, DatafileInfo, DatasetInfo, StorageUnit};
pub use ops::{DeferredOp, RequestedState};
pub use status::{LockKind, LockStatusEntry, OpsQueueEntry, ServiceStatus};
