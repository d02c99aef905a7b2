//! Progress reporting for long-running deployment operations.
//!
//! The executor and the image-pull stream write to a narrow
//! [`ProgressSink`] capability; rendering (console spinner, logs, API
//! events) is a collaborator concern.

/// The state an operation or one of its sub-tasks is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    /// A container create has been issued.
    Creating,
    /// The container exists.
    Created,
    /// A container start has been issued.
    Starting,
    /// The container is running.
    Started,
    /// A container stop has been issued.
    Stopping,
    /// The container has stopped.
    Stopped,
    /// A container remove has been issued.
    Removing,
    /// The container is gone.
    Removed,
    /// An image pull is in flight; `update` items carry per-layer detail.
    Pulling,
    /// The image pull finished.
    Pulled,
    /// The operation failed.
    Error,
}

/// Receiver of progress events.
///
/// `id` identifies one tracked task; a pull layer passes the container task
/// id as `parent` so renderers can nest it.
pub trait ProgressSink: Send + Sync {
    /// A new task started.
    fn begin(&self, id: &str, parent: Option<&str>);
    /// A task made progress.
    fn update(&self, id: &str, status: ProgressStatus, text: &str);
    /// A task finished in the given terminal status.
    fn end(&self, id: &str, status: ProgressStatus);
}

/// A sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn begin(&self, _id: &str, _parent: Option<&str>) {}
    fn update(&self, _id: &str, _status: ProgressStatus, _text: &str) {}
    fn end(&self, _id: &str, _status: ProgressStatus) {}
}
