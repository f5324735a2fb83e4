//! The contract between the omx messaging engine and the kernel driver
//! that owns the Ethernet wire.
//!
//! The engine builds protocol state machines in user space; the driver
//! transmits frames, performs DMA, and deposits event records into two
//! memory-mapped rings. This crate defines that boundary three times
//! over:
//!
//! - [`abi`]: the raw command structures, ioctl numbers, ring layouts
//!   and limits, exactly as the driver sees them;
//! - [`Driver`]: the typed facade the engine programs against;
//! - two implementations: [`kernel::KernelEndpoint`] over the character
//!   device (Unix only), and [`sim`] — an in-process fabric with loss
//!   injection and a virtual clock, used by the test suite and for
//!   driverless development.

pub mod abi;
mod driver;
mod events;
#[cfg(unix)]
pub mod kernel;
pub mod ring;
pub mod sim;

pub use {
    driver::{BoardInfo, Driver, DriverError},
    events::{Event, MsgInfo},
};

/// Re-export of the wire-protocol definitions the contract is phrased
/// in.
pub use omx_wire as wire;
