//! Error types produced by the service layer and its collaborators.

/// An error relating to the lifecycle of the discovery service.
#[derive(Debug)]
pub enum Error {
    /// The service has already been started.
    ServiceAlreadyStarted,
    /// The service has not been started.
    ServiceNotStarted,
    /// The channel to the underlying service task has closed.
    ServiceChannelClosed,
    /// The session layer failed to start.
    SessionError(String),
    /// A generic error.
    Custom(&'static str),
}

/// An error occurring when handing a message to the session layer.
///
/// These are produced synchronously by [`crate::SessionService`]
/// implementations, or reported asynchronously through
/// [`crate::SessionEvent::RequestFailed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The request timed out.
    Timeout,
    /// The request was addressed to ourselves.
    SelfRequest,
    /// The destination ENR could not be used to contact the node.
    InvalidEnr(&'static str),
    /// The channel to the session layer has closed.
    ChannelFailed(String),
    /// A session-layer specific failure.
    Custom(&'static str),
}

/// An error returned when starting or awaiting a lookup.
///
/// A lookup that has been accepted by the service never fails; it resolves
/// with whatever subset of records could be found. These errors only cover
/// the plumbing between the caller and the service task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The service has not been started.
    ServiceNotStarted,
    /// The channel to the service task failed.
    ChannelFailed(String),
}
