//! Wire-protocol definitions for omx, a user-space Myrinet-Express-style
//! message-passing stack running over raw Ethernet frames of EtherType
//! [`ETHERTYPE`].
//!
//! This crate only defines the types that cross the wire and their codec;
//! it performs no I/O. The actual frame transmission is owned by the kernel
//! driver (or by the simulated fabric in `omx_driver::sim`), which is why
//! everything here is plain data.

mod seq;
mod ty;

pub use {seq::*, ty::*};

/// EtherType of all omx frames.
pub const ETHERTYPE: u16 = 0x86DF;
