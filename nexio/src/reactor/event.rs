/// A readiness event reported by the poller.
///
/// Events are produced by the poller and consumed by the worker loop,
/// which dispatches on them according to the registration found under
/// `token`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Event {
    /// Token of the registration (its slot in the registration table).
    pub(crate) token: usize,

    /// The descriptor is readable, or the peer hung up.
    pub(crate) readable: bool,

    /// The descriptor is writable (or a pending connect finished).
    pub(crate) writable: bool,

    /// The poller flagged an error condition on the descriptor.
    pub(crate) error: bool,
}
