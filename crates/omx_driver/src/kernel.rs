//! `Driver` implementation over the character device of the kernel
//! driver: ioctls for the command set, mmap for the four per-endpoint
//! queues and the two descriptor pages.

use std::{
    borrow::Cow,
    ffi::CStr,
    io,
    os::unix::io::RawFd,
    ptr,
};

use crate::{
    abi::{
        self, ioctl, CreateUserRegion, DestroyUserRegion, DriverDesc, EndpointDesc, GetBoardInfo,
        GetCounters, GetEndpointInfo, OpenEndpoint, PeerAdd, PeerEntry, PeerTableState, Pull,
        RegionSegment, SendConnectReply, SendConnectRequest, SendLiback, SendMediumSqFrag,
        SendMediumVa, SendNotify, SendRndv, SendSmall, SendTiny, SetHostname, WaitEvent, Wakeup,
        EVENTQ_ENTRY_NR, EVENT_SLOT_SIZE, RECVQ_ENTRY_NR, RECVQ_ENTRY_SIZE, SENDQ_ENTRY_NR,
        SENDQ_ENTRY_SIZE,
    },
    driver::{BoardInfo, Driver, DriverError},
    events::Event,
    ring::{EventRing, RecvQueue, SendQueue},
};

/// Path of the driver character device.
pub const DEVICE_PATH: &str = "/dev/open-mx";

/// mmap offset of the read-mostly driver descriptor page, after the
/// per-endpoint regions.
const DRIVER_DESC_FILE_OFFSET: i64 = abi::DESC_FILE_OFFSET + 4096;

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn errno_to_error(errno: i32) -> DriverError {
    match errno {
        libc::EAGAIN | libc::ENOBUFS | libc::ENOMEM => DriverError::Busy,
        libc::ENODEV | libc::ENOENT | libc::ENXIO => DriverError::NoDevice,
        libc::EFAULT => DriverError::BadAddress,
        libc::EINVAL => DriverError::Invalid,
        libc::EBUSY => DriverError::EndpointBusy,
        libc::ERANGE => DriverError::BadEndpoint,
        other => DriverError::Io(other),
    }
}

fn device_open() -> Result<RawFd, DriverError> {
    let path = CStr::from_bytes_with_nul(b"/dev/open-mx\0").expect("static path");
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if fd < 0 {
        Err(errno_to_error(errno()))
    } else {
        Ok(fd)
    }
}

unsafe fn device_ioctl<T>(fd: RawFd, request: u64, arg: *mut T) -> Result<(), DriverError> {
    let rc = libc::ioctl(fd, request as libc::c_ulong, arg);
    if rc < 0 {
        Err(errno_to_error(errno()))
    } else {
        Ok(())
    }
}

fn device_mmap(fd: RawFd, offset: i64, len: usize) -> Result<*mut u8, DriverError> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        Err(errno_to_error(errno()))
    } else {
        Ok(ptr.cast())
    }
}

fn cstr_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Process-wide control handle: board enumeration and peer-table
/// administration, independent of any endpoint.
pub struct KernelControl {
    fd: RawFd,
}

impl KernelControl {
    /// Opens the control device.
    pub fn open() -> Result<Self, DriverError> {
        Ok(Self { fd: device_open()? })
    }

    /// Number of boards the driver manages.
    pub fn board_count(&self) -> Result<u32, DriverError> {
        let mut count: u32 = 0;
        unsafe { device_ioctl(self.fd, ioctl::GET_BOARD_COUNT, &mut count)? };
        Ok(count)
    }

    /// Identity of one board.
    pub fn board_info(&self, board_index: u32) -> Result<BoardInfo, DriverError> {
        let mut info = GetBoardInfo {
            board_index,
            pad: 0,
            addr: 0,
            mtu: 0,
            numa_node: 0,
            status: 0,
            pad2: 0,
            hostname: [0; 80],
            ifacename: [0; 16],
        };
        unsafe { device_ioctl(self.fd, ioctl::GET_BOARD_INFO, &mut info)? };
        Ok(BoardInfo {
            addr: info.addr,
            hostname: cstr_field(&info.hostname),
            ifacename: cstr_field(&info.ifacename),
            mtu: info.mtu,
            numa_node: info.numa_node as i32,
        })
    }

    /// Whether an endpoint slot is currently open.
    pub fn endpoint_open(&self, board_index: u32, endpoint_index: u32) -> Result<bool, DriverError> {
        let mut info = GetEndpointInfo {
            board_index,
            endpoint_index,
            open: 0,
            pad: 0,
        };
        unsafe { device_ioctl(self.fd, ioctl::GET_ENDPOINT_INFO, &mut info)? };
        Ok(info.open != 0)
    }

    /// Adds a peer to the driver table.
    pub fn peer_add(&self, board_addr: u64, hostname: &str) -> Result<(), DriverError> {
        let mut cmd = PeerAdd {
            board_addr,
            hostname: [0; 80],
        };
        let n = hostname.len().min(79);
        cmd.hostname[..n].copy_from_slice(&hostname.as_bytes()[..n]);
        unsafe { device_ioctl(self.fd, ioctl::PEER_ADD, &mut cmd) }
    }

    /// Resolves a peer index to its address.
    pub fn peer_from_index(&self, index: u16) -> Result<u64, DriverError> {
        let mut entry = PeerEntry {
            board_addr: 0,
            index,
            pad: [0; 6],
            hostname: [0; 80],
        };
        unsafe { device_ioctl(self.fd, ioctl::PEER_FROM_INDEX, &mut entry)? };
        Ok(entry.board_addr)
    }

    /// Resolves a peer address to its index.
    pub fn peer_from_addr(&self, board_addr: u64) -> Result<u16, DriverError> {
        let mut entry = PeerEntry {
            board_addr,
            index: 0,
            pad: [0; 6],
            hostname: [0; 80],
        };
        unsafe { device_ioctl(self.fd, ioctl::PEER_FROM_ADDR, &mut entry)? };
        Ok(entry.index)
    }

    /// Resolves a peer hostname to its address and index.
    pub fn peer_from_hostname(&self, hostname: &str) -> Result<(u64, u16), DriverError> {
        let mut entry = PeerEntry {
            board_addr: 0,
            index: 0,
            pad: [0; 6],
            hostname: [0; 80],
        };
        let n = hostname.len().min(79);
        entry.hostname[..n].copy_from_slice(&hostname.as_bytes()[..n]);
        unsafe { device_ioctl(self.fd, ioctl::PEER_FROM_HOSTNAME, &mut entry)? };
        Ok((entry.board_addr, entry.index))
    }

    /// Empties the driver peer table.
    pub fn peer_table_clear(&self) -> Result<(), DriverError> {
        unsafe { device_ioctl(self.fd, ioctl::PEER_TABLE_CLEAR, std::ptr::null_mut::<u8>()) }
    }

    /// Reads the peer-table configuration state.
    pub fn peer_table_state(&self) -> Result<PeerTableState, DriverError> {
        let mut state = PeerTableState::default();
        unsafe { device_ioctl(self.fd, ioctl::PEER_TABLE_GET_STATE, &mut state)? };
        Ok(state)
    }

    /// Publishes the peer-table configuration state.
    pub fn set_peer_table_state(&self, state: &PeerTableState) -> Result<(), DriverError> {
        let mut state = *state;
        unsafe { device_ioctl(self.fd, ioctl::PEER_TABLE_SET_STATE, &mut state) }
    }

    /// Changes the hostname a board is published under.
    pub fn set_hostname(&self, board_index: u32, hostname: &str) -> Result<(), DriverError> {
        let mut cmd = SetHostname {
            board_index,
            pad: 0,
            hostname: [0; 80],
        };
        let n = hostname.len().min(79);
        cmd.hostname[..n].copy_from_slice(&hostname.as_bytes()[..n]);
        unsafe { device_ioctl(self.fd, ioctl::SET_HOSTNAME, &mut cmd) }
    }

    /// Reads (and optionally clears) the per-board driver counters.
    pub fn counters(&self, board_index: u32, clear: bool) -> Result<Vec<u64>, DriverError> {
        let mut cmd = GetCounters {
            board_index,
            clear: u32::from(clear),
            counters: [0; 64],
        };
        unsafe { device_ioctl(self.fd, ioctl::GET_COUNTERS, &mut cmd)? };
        let valid = (cmd.board_index as usize).min(cmd.counters.len());
        Ok(cmd.counters[..valid].to_vec())
    }
}

impl Drop for KernelControl {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// One endpoint attached through the kernel driver.
pub struct KernelEndpoint {
    fd: RawFd,
    endpoint_index: u8,
    board: BoardInfo,
    desc: *mut EndpointDesc,
    driver_desc: *const DriverDesc,
    sendq: SendQueue,
    recvq: RecvQueue,
    exp_ring: EventRing,
    unexp_ring: EventRing,
}

// All raw pointers refer to mappings owned by `fd`.
unsafe impl Send for KernelEndpoint {}

impl KernelEndpoint {
    /// Opens `endpoint_index` on `board_index` and maps its queues.
    pub fn open(board_index: u32, endpoint_index: u32) -> Result<Self, DriverError> {
        let control = KernelControl::open()?;
        let board = control.board_info(board_index)?;

        let fd = device_open()?;
        let mut cmd = OpenEndpoint {
            board_index,
            endpoint_index,
        };
        if let Err(err) = unsafe { device_ioctl(fd, ioctl::OPEN_ENDPOINT, &mut cmd) } {
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let sendq_len = SENDQ_ENTRY_NR * SENDQ_ENTRY_SIZE;
        let recvq_len = RECVQ_ENTRY_NR * RECVQ_ENTRY_SIZE;
        let eventq_len = EVENTQ_ENTRY_NR * EVENT_SLOT_SIZE;

        let sendq = device_mmap(fd, abi::SENDQ_FILE_OFFSET, sendq_len)?;
        let recvq = device_mmap(fd, abi::RECVQ_FILE_OFFSET, recvq_len)?;
        let expq = device_mmap(fd, abi::EXP_EVENTQ_FILE_OFFSET, eventq_len)?;
        let unexpq = device_mmap(fd, abi::UNEXP_EVENTQ_FILE_OFFSET, eventq_len)?;
        let desc = device_mmap(fd, abi::DESC_FILE_OFFSET, 4096)?;
        let driver_desc = device_mmap(fd, DRIVER_DESC_FILE_OFFSET, 4096)?;

        Ok(Self {
            fd,
            endpoint_index: endpoint_index as u8,
            board,
            desc: desc.cast(),
            driver_desc: driver_desc.cast_const().cast(),
            sendq: unsafe { SendQueue::new(sendq, sendq_len) },
            recvq: unsafe { RecvQueue::new(recvq, recvq_len) },
            exp_ring: unsafe { EventRing::new(expq, EVENTQ_ENTRY_NR) },
            unexp_ring: unsafe { EventRing::new(unexpq, EVENTQ_ENTRY_NR) },
        })
    }

    /// ABI version advertised by the driver.
    #[must_use]
    pub fn abi_version(&self) -> u32 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.driver_desc).abi_version)) }
    }
}

impl Driver for KernelEndpoint {
    fn board_info(&self) -> &BoardInfo {
        &self.board
    }

    fn endpoint_index(&self) -> u8 {
        self.endpoint_index
    }

    fn session_id(&self) -> u32 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.desc).session_id)) }
    }

    fn endpoint_max(&self) -> u32 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.driver_desc).endpoint_max)) }
    }

    fn jiffies(&self) -> u64 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.driver_desc).jiffies)) }
    }

    fn hz(&self) -> u32 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.driver_desc).hz)) }
    }

    fn take_status(&mut self) -> u32 {
        unsafe {
            let status = ptr::read_volatile(ptr::addr_of!((*self.desc).status));
            ptr::write_volatile(ptr::addr_of_mut!((*self.desc).status), 0);
            status
        }
    }

    fn set_wakeup_jiffies(&mut self, jiffies: u64) {
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.desc).wakeup_jiffies), jiffies) };
    }

    fn notify_user_event(&mut self) {
        unsafe {
            let p = ptr::addr_of_mut!((*self.desc).user_event_count);
            ptr::write_volatile(p, ptr::read_volatile(p).wrapping_add(1));
        }
    }

    fn user_event_count(&self) -> u32 {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.desc).user_event_count)) }
    }

    fn peer_addr_to_index(&self, board_addr: u64) -> Option<u16> {
        let mut entry = PeerEntry {
            board_addr,
            index: 0,
            pad: [0; 6],
            hostname: [0; 80],
        };
        unsafe { device_ioctl(self.fd, ioctl::PEER_FROM_ADDR, &mut entry).ok()? };
        Some(entry.index)
    }

    fn peer_index_to_addr(&self, index: u16) -> Option<u64> {
        let mut entry = PeerEntry {
            board_addr: 0,
            index,
            pad: [0; 6],
            hostname: [0; 80],
        };
        unsafe { device_ioctl(self.fd, ioctl::PEER_FROM_INDEX, &mut entry).ok()? };
        Some(entry.board_addr)
    }

    fn send_tiny(&mut self, cmd: &SendTiny) -> Result<(), DriverError> {
        let mut cmd = *cmd;
        unsafe { device_ioctl(self.fd, ioctl::SEND_TINY, &mut cmd) }
    }

    fn send_small(&mut self, cmd: &SendSmall) -> Result<(), DriverError> {
        let mut cmd = *cmd;
        unsafe { device_ioctl(self.fd, ioctl::SEND_SMALL, &mut cmd) }
    }

    fn send_mediumsq_frag(&mut self, cmd: &SendMediumSqFrag) -> Result<(), DriverError> {
        let mut cmd = *cmd;
        unsafe { device_ioctl(self.fd, ioctl::SEND_MEDIUMSQ_FRAG, &mut cmd) }
    }

    fn send_mediumva(&mut self, cmd: &SendMediumVa) -> Result<(), DriverError> {
        let mut cmd = *cmd;
        unsafe { device_ioctl(self.fd, ioctl::SEND_MEDIUMVA, &mut cmd) }
    }

    fn send_rndv(&mut self, cmd: &SendRndv) -> Result<(), DriverError> {
        let mut cmd = *cmd;
        unsafe { device_ioctl(self.fd, ioctl::SEND_RNDV, &mut cmd) }
    }

    fn send_notify(&mut self, cmd: &SendNotify) -> Result<(), DriverError> {
        let mut cmd = *cmd;
        unsafe { device_ioctl(self.fd, ioctl::SEND_NOTIFY, &mut cmd) }
    }

    fn send_connect_request(&mut self, cmd: &SendConnectRequest) -> Result<(), DriverError> {
        let mut cmd = *cmd;
        unsafe { device_ioctl(self.fd, ioctl::SEND_CONNECT_REQUEST, &mut cmd) }
    }

    fn send_connect_reply(&mut self, cmd: &SendConnectReply) -> Result<(), DriverError> {
        let mut cmd = *cmd;
        unsafe { device_ioctl(self.fd, ioctl::SEND_CONNECT_REPLY, &mut cmd) }
    }

    fn send_liback(&mut self, cmd: &SendLiback) -> Result<(), DriverError> {
        let mut cmd = *cmd;
        unsafe { device_ioctl(self.fd, ioctl::SEND_LIBACK, &mut cmd) }
    }

    fn pull(&mut self, cmd: &Pull) -> Result<(), DriverError> {
        let mut cmd = *cmd;
        unsafe { device_ioctl(self.fd, ioctl::PULL, &mut cmd) }
    }

    fn create_user_region(
        &mut self,
        cmd: &CreateUserRegion,
        segments: &[RegionSegment],
    ) -> Result<(), DriverError> {
        let mut cmd = CreateUserRegion {
            nr_segments: segments.len() as u32,
            segments: segments.as_ptr() as u64,
            ..*cmd
        };
        unsafe { device_ioctl(self.fd, ioctl::CREATE_USER_REGION, &mut cmd) }
    }

    fn destroy_user_region(&mut self, id: u8) -> Result<(), DriverError> {
        let mut cmd = DestroyUserRegion { id, pad: [0; 3] };
        unsafe { device_ioctl(self.fd, ioctl::DESTROY_USER_REGION, &mut cmd) }
    }

    fn poll_unexp(&mut self) -> Option<Event> {
        self.unexp_ring.pop()
    }

    fn poll_exp(&mut self) -> Option<Event> {
        self.exp_ring.pop()
    }

    fn sendq_slot_mut(&mut self, index: u16) -> &mut [u8] {
        self.sendq.slot_mut(index)
    }

    fn recvq_data(&mut self, offset: u32, len: usize) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.recvq.data(offset, len))
    }

    fn wait_event(&mut self, wait: &mut WaitEvent) -> Result<(), DriverError> {
        wait.next_exp_event_index = self.exp_ring.next_index();
        wait.next_unexp_event_index = self.unexp_ring.next_index();
        unsafe { device_ioctl(self.fd, ioctl::WAIT_EVENT, wait) }
    }

    fn wakeup(&mut self, status: u32) -> Result<(), DriverError> {
        let mut cmd = Wakeup { status, pad: 0 };
        unsafe { device_ioctl(self.fd, ioctl::WAKEUP, &mut cmd) }
    }
}

impl Drop for KernelEndpoint {
    fn drop(&mut self) {
        unsafe {
            libc::ioctl(self.fd, ioctl::CLOSE_ENDPOINT as libc::c_ulong);
            libc::close(self.fd);
        }
    }
}
