//! Error taxonomy: immediate API failures ([`Error`]) and per-request
//! completion codes ([`Status`]).
//!
//! Transient internal shortages (send queue full, region slots gone,
//! driver backpressure) never reach the application; they become the
//! crate-private missing-resources marker and the request parks on a
//! delay queue until the next progression pass retries it.

use omx_driver::DriverError;

/// Completion code of a finished request, observed through `test`/`wait`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Status {
    /// Normal completion.
    #[default]
    Success,
    /// The receive buffer was shorter than the incoming message; only
    /// `xfer_length` bytes were delivered.
    MessageTruncated,
    /// Retransmission gave up and the partner was torn down.
    RemoteEndpointUnreachable,
    /// The remote driver knows no such endpoint index.
    RemoteEndpointBadId,
    /// The remote endpoint existed but has closed.
    RemoteEndpointClosed,
    /// The remote endpoint is a different incarnation than the one this
    /// request targeted.
    RemoteEndpointBadSession,
    /// The connect handshake was refused because of a key mismatch.
    RemoteEndpointBadConnectionKey,
    /// A pull targeted a remote region id that is not registered.
    RemoteRdmaWindowBadId,
    /// The remote side aborted the transfer.
    MessageAborted,
    /// The request was cancelled before it could match or complete.
    Cancelled,
}

/// Immediate failure of a library call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The library has not been initialized.
    #[error("not initialized")]
    NotInitialized,
    /// `init` was called while already initialized.
    #[error("already initialized")]
    AlreadyInitialized,
    /// The driver rejected the board or endpoint index.
    #[error("bad endpoint index")]
    BadEndpoint,
    /// No board with that index or address.
    #[error("board not found")]
    BoardNotFound,
    /// The driver or its device file is absent.
    #[error("no driver or device")]
    NoDevice,
    /// A kernel-side allocation failed.
    #[error("out of system resources")]
    NoSystemResources,
    /// A library-side allocation failed.
    #[error("out of resources")]
    NoResources,
    /// The endpoint slot (or region id) is already in use.
    #[error("busy")]
    Busy,
    /// `match_info` carries bits outside `match_mask`.
    #[error("match info does not fit match mask")]
    BadMatchMask,
    /// The posted mask does not cover the context-id bits.
    #[error("match mask does not cover the context id bits")]
    BadMatchingForContextIdMask,
    /// A segment list exceeded the per-request segment limit.
    #[error("too many segments")]
    SegmentsBadCount,
    /// The peer table has no entry for that address.
    #[error("peer not found")]
    PeerNotFound,
    /// No board with that NIC id exists in the peer table.
    #[error("nic id not found")]
    NicIdNotFound,
    /// A bounded wait elapsed.
    #[error("timeout")]
    Timeout,
    /// A synchronous connect was refused because of a key mismatch.
    #[error("connection key mismatch")]
    BadConnectionKey,
    /// The request is not in a cancellable state.
    #[error("request cannot be cancelled")]
    BadRequest,
    /// The call is forbidden from inside the unexpected handler.
    #[error("not supported from the unexpected handler")]
    NotSupportedInHandler,
    /// The operation is not implemented.
    #[error("not implemented")]
    NotImplemented,
    /// The library and driver disagree on the ABI version.
    #[error("kernel ABI mismatch")]
    BadKernelAbi,
    /// Endpoints were still open when `finalize` was called.
    #[error("endpoints still open")]
    EndpointsRemain,
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Busy => Self::NoSystemResources,
            DriverError::NoDevice => Self::NoDevice,
            DriverError::BadAddress | DriverError::Invalid => Self::BadEndpoint,
            DriverError::BadEndpoint => Self::BoardNotFound,
            DriverError::EndpointBusy => Self::Busy,
            DriverError::Io(_) => Self::NoSystemResources,
        }
    }
}

/// Crate-internal marker for a transient resource shortage; the request
/// stays parked and the delayed-request pass retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MissingResources;

pub(crate) type SubmitResult = Result<(), MissingResources>;
