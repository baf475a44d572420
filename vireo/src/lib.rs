//! The keyed task queue, feature composition and store that bind
//! [`vireo_core`]'s reactive state, guards and abort signals to one
//! attached target.

pub mod feature;
pub mod queue;
pub mod store;

pub use feature::{CancelSpec, Feature, FeatureContext, KeySpec, RequestConfig, RequestContext, RequestHandler};
pub use queue::{
    AnyValue, QueueConfig, QueuedView, Task, TaskHandler, TaskId, TaskKey, TaskQueue, TaskRecord,
    TaskStatus, TasksView,
};
pub use store::{Attachment, ErrorEvent, Store, StoreConfig};
