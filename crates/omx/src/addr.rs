//! The opaque address an application holds for a remote endpoint.

/// Address of a (possibly remote) endpoint, produced by a successful
/// connect and attached to every completion.
///
/// The address pins one *incarnation* of the remote endpoint: it carries
/// the session id obtained during the handshake, so messages sent
/// through it after the remote restarts are refused with a session NACK
/// until the application reconnects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointAddr {
    pub(crate) peer_index: u16,
    pub(crate) endpoint_index: u8,
    pub(crate) board_addr: u64,
    pub(crate) session_id: u32,
}

impl EndpointAddr {
    /// The 48-bit board address (NIC id) of the remote endpoint.
    #[must_use]
    pub fn nic_id(&self) -> u64 {
        self.board_addr
    }

    /// The endpoint index on the remote board.
    #[must_use]
    pub fn endpoint_id(&self) -> u32 {
        u32::from(self.endpoint_index)
    }

    /// The session id of the remote incarnation this address targets.
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id
    }
}
