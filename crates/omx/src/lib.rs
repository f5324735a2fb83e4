//! User-space Myrinet-Express-style message passing over raw Ethernet.
//!
//! An application opens an [`Endpoint`] on a board, connects to peer
//! endpoints, and exchanges matched messages: sends and receives carry a
//! 64-bit match value, receives additionally a mask, and an inbound
//! message is delivered to the first posted receive satisfying
//! `incoming & mask == posted`. Payloads range from a few bytes
//! (carried inline in the submission) to multi-megabyte transfers
//! served by a rendezvous handshake and a driver-side RDMA-style pull.
//!
//! The kernel driver owns the wire: this library builds the protocol
//! state machines (per-partner sequence numbers, acknowledgement and
//! retransmission timers, matching queues, registered-region cache) and
//! talks to the driver through the command/event contract of
//! [`omx_driver`]. Everything progresses cooperatively from
//! [`Endpoint::progress`], which every submission and wait entry point
//! runs as a matter of course.
//!
//! ```no_run
//! # fn main() -> Result<(), omx::Error> {
//! omx::init()?;
//! let mut ep = omx::open_endpoint(0, 0, 0x1234, omx::EndpointParams::default())?;
//! let peer = ep.connect(0x0011_2233_4455, 1, 0x1234, Some(1000))?;
//! let payload = b"hello".to_vec();
//! let send = unsafe { ep.isend(&payload, peer, 0x42, 0)? };
//! ep.wait(send, Some(1000))?;
//! # Ok(()) }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

mod ack;
mod addr;
mod config;
mod connect;
mod endpoint;
mod error;
mod large;
mod partner;
mod progress;
mod queue;
mod recv;
mod region;
mod request;
mod segment;
mod send;
mod wait;

pub use {
    addr::EndpointAddr,
    config::Config,
    connect::default_request_timeout_ms,
    endpoint::{Endpoint, EndpointParams, UnexpHandler, UnexpHandlerAction, UnexpMessage},
    error::{Error, Status},
    request::{Completion, RequestId},
    segment::{Segment, SegmentList},
};

/// Re-export of the driver contract, for opening endpoints over a
/// specific backend (kernel driver or the simulated fabric).
pub use omx_driver as driver;

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static OPEN_ENDPOINTS: AtomicUsize = AtomicUsize::new(0);

/// Initializes the library: parses the environment tunables (first call
/// only) and arms endpoint opening.
pub fn init() -> Result<(), Error> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(Error::AlreadyInitialized);
    }
    // force the one-shot environment parse now, not at first use
    let _ = Config::get();
    Ok(())
}

/// Tears the library down. Safe to call repeatedly, but refuses while
/// endpoints are still open.
pub fn finalize() -> Result<(), Error> {
    if OPEN_ENDPOINTS.load(Ordering::SeqCst) != 0 {
        return Err(Error::EndpointsRemain);
    }
    INITIALIZED.store(false, Ordering::SeqCst);
    Ok(())
}

pub(crate) fn ensure_initialized() -> Result<(), Error> {
    if INITIALIZED.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(Error::NotInitialized)
    }
}

pub(crate) fn register_endpoint() {
    OPEN_ENDPOINTS.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn unregister_endpoint() {
    OPEN_ENDPOINTS.fetch_sub(1, Ordering::SeqCst);
}

/// Opens an endpoint over the kernel driver.
#[cfg(unix)]
pub fn open_endpoint(
    board_index: u32,
    endpoint_index: u32,
    key: u32,
    params: EndpointParams,
) -> Result<Endpoint, Error> {
    ensure_initialized()?;
    let kernel = omx_driver::kernel::KernelEndpoint::open(board_index, endpoint_index)?;
    if kernel.abi_version() != omx_driver::abi::ABI_VERSION {
        return Err(Error::BadKernelAbi);
    }
    Endpoint::open(Box::new(kernel), key, params)
}
