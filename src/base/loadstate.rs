/// The current state of a host resolution request.
/// This roughly matches the resolver subset of net/base/load_states.h
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// The request is idle: not started, queued behind other jobs, or done.
    #[default]
    Idle,

    /// The owning job is running a resolution task.
    ResolvingHost,
}
