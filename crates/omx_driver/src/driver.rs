//! The command/event contract between the messaging engine and whatever
//! owns the wire.
//!
//! The engine never touches Ethernet itself: it posts typed commands and
//! drains typed events through this trait. Two implementations exist:
//! [`KernelEndpoint`](crate::kernel::KernelEndpoint) over the character
//! device of the kernel driver, and [`SimDriver`](crate::sim::SimDriver)
//! over an in-process fabric used by the test suite and for local
//! development without the driver.

use std::borrow::Cow;

use crate::{
    abi::{
        CreateUserRegion, Pull, RegionSegment, SendConnectReply, SendConnectRequest, SendLiback,
        SendMediumSqFrag, SendMediumVa, SendNotify, SendRndv, SendSmall, SendTiny, WaitEvent,
    },
    events::Event,
};

/// Failure of a driver command.
///
/// Only [`DriverError::Busy`] is transient; the engine converts it into
/// its internal missing-resources marker and retries from the delayed
/// queue. Everything else is reported.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// The driver is out of buffers right now; try again later.
    #[error("driver temporarily out of resources")]
    Busy,
    /// The device file or the driver itself is absent.
    #[error("driver or device not available")]
    NoDevice,
    /// A user buffer could not be read or pinned.
    #[error("bad user buffer address")]
    BadAddress,
    /// The command arguments were rejected.
    #[error("invalid command argument")]
    Invalid,
    /// The target (board or endpoint index) does not exist.
    #[error("no such board or endpoint")]
    BadEndpoint,
    /// The endpoint slot is already open.
    #[error("endpoint busy")]
    EndpointBusy,
    /// Any other errno.
    #[error("driver I/O error (errno {0})")]
    Io(i32),
}

/// Static identity of the board an endpoint is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    /// 48-bit Ethernet address of the board.
    pub addr: u64,
    /// Hostname the board is published under in the peer table.
    pub hostname: String,
    /// Kernel interface name.
    pub ifacename: String,
    /// Interface MTU.
    pub mtu: u32,
    /// NUMA node the board is attached to, or -1.
    pub numa_node: i32,
}

/// One open endpoint's view of the driver: the §6 command set, the two
/// event rings, and the shared descriptor pages.
pub trait Driver {
    /// Identity of the board this endpoint is attached to.
    fn board_info(&self) -> &BoardInfo;

    /// Index of this endpoint on its board.
    fn endpoint_index(&self) -> u8;

    /// Session id of this endpoint incarnation, drawn by the driver at
    /// open time.
    fn session_id(&self) -> u32;

    /// Most endpoints per board, from the driver descriptor.
    fn endpoint_max(&self) -> u32;

    /// Current driver tick.
    fn jiffies(&self) -> u64;

    /// Driver ticks per second.
    fn hz(&self) -> u32;

    /// Reads and clears the endpoint descriptor status bits.
    fn take_status(&mut self) -> u32;

    /// Publishes the next jiffies at which the library wants a wakeup
    /// even without an event.
    fn set_wakeup_jiffies(&mut self, jiffies: u64);

    /// Bumps the user event counter so sleepers observe library-level
    /// progress that produced no driver event.
    fn notify_user_event(&mut self);

    /// Current value of the user event counter.
    fn user_event_count(&self) -> u32;

    /// Resolves a board address to its peer table index.
    fn peer_addr_to_index(&self, board_addr: u64) -> Option<u16>;

    /// Resolves a peer table index to its board address.
    fn peer_index_to_addr(&self, index: u16) -> Option<u64>;

    /// Posts a tiny message.
    fn send_tiny(&mut self, cmd: &SendTiny) -> Result<(), DriverError>;

    /// Posts a small message; the payload behind `vaddr` is copied
    /// synchronously.
    fn send_small(&mut self, cmd: &SendSmall) -> Result<(), DriverError>;

    /// Posts one staged medium fragment; completion arrives as
    /// [`Event::MediumSqFragDone`].
    fn send_mediumsq_frag(&mut self, cmd: &SendMediumSqFrag) -> Result<(), DriverError>;

    /// Posts a whole medium message gathered from user segments.
    fn send_mediumva(&mut self, cmd: &SendMediumVa) -> Result<(), DriverError>;

    /// Posts a rendezvous advertisement.
    fn send_rndv(&mut self, cmd: &SendRndv) -> Result<(), DriverError>;

    /// Posts a pull-completion notification.
    fn send_notify(&mut self, cmd: &SendNotify) -> Result<(), DriverError>;

    /// Posts a connection handshake request.
    fn send_connect_request(&mut self, cmd: &SendConnectRequest) -> Result<(), DriverError>;

    /// Posts a connection handshake reply.
    fn send_connect_reply(&mut self, cmd: &SendConnectReply) -> Result<(), DriverError>;

    /// Posts an explicit cumulative ack.
    fn send_liback(&mut self, cmd: &SendLiback) -> Result<(), DriverError>;

    /// Initiates a large-message pull; completion arrives as
    /// [`Event::PullDone`] carrying `cmd.lib_cookie`.
    fn pull(&mut self, cmd: &Pull) -> Result<(), DriverError>;

    /// Pins and registers a multi-segment user buffer under a
    /// library-chosen region id.
    fn create_user_region(
        &mut self,
        cmd: &CreateUserRegion,
        segments: &[RegionSegment],
    ) -> Result<(), DriverError>;

    /// Releases a registered region.
    fn destroy_user_region(&mut self, id: u8) -> Result<(), DriverError>;

    /// Takes the next record from the unexpected event ring.
    fn poll_unexp(&mut self) -> Option<Event>;

    /// Takes the next record from the expected event ring.
    fn poll_exp(&mut self) -> Option<Event>;

    /// Mutable view of one send-queue slot, for staging medium fragments.
    fn sendq_slot_mut(&mut self, index: u16) -> &mut [u8];

    /// Payload bytes a small/medium event points at through its
    /// `recvq_offset`.
    fn recvq_data(&mut self, offset: u32, len: usize) -> Cow<'_, [u8]>;

    /// Blocks until an event ring advances past the indices in `wait`,
    /// the user event counter moves, the timeout passes, or a wakeup is
    /// posted. `wait.status` reports which.
    fn wait_event(&mut self, wait: &mut WaitEvent) -> Result<(), DriverError>;

    /// Wakes every thread sleeping in [`Driver::wait_event`] on this
    /// endpoint.
    fn wakeup(&mut self, status: u32) -> Result<(), DriverError>;
}
