//! Zero-copy receive and transmit over a single `AF_XDP` NIC queue.
//!
//! This crate is the user-space half of the kernel's `AF_XDP` zero-copy
//! packet path: a page-aligned packet buffer ([`Umem`]) shared with the
//! kernel, the four control rings that hand frame addresses and packet
//! descriptors back and forth, and a [`Socket`] bound to one
//! `(interface, queue)` pair that drives the receive and transmit loops.
//!
//! It does not load the `XDP`/`eBPF` program that steers frames to a
//! socket's queue (the "classifier"), does not offer a protocol stack above
//! raw frames, and does not fan a single socket out across multiple queues —
//! one [`Socket`] serves exactly one NIC queue; an application that wants
//! several queues creates several sockets, optionally sharing one [`Umem`].
use std::fmt;

pub mod xdp;
mod xsk;

pub use xsk::{
    get_nic_queues, set_nic_promisc, BufIdx, Complete, DeviceQueue, Fill, Frame, IfInfo,
    RecvOutcome, Receive, RingCons, RingProd, RingRx, RingSetup, RingTx, Socket, SocketConfig,
    Transmit, Umem, UmemConfig,
};

/// Errors surfaced by construction and bind-time operations.
///
/// Hot-path conditions (no free frame, ring under pressure) are deliberately
/// *not* represented here: they are expected steady state, reported through
/// return values (a `transmit` call enqueueing fewer packets than given) or
/// through [`Socket::stats`], never as an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `socket(AF_XDP, ...)` failed, or a required ring-size setsockopt was
    /// rejected by the kernel.
    #[error("kernel does not support AF_XDP, or rejected a required socket option: {0}")]
    UnsupportedKernel(#[source] Errno),

    /// A ring or `Umem` `mmap` was rejected.
    #[error("failed to map a ring into this process: {0}")]
    MmapFailed(#[source] Errno),

    /// `bind(2)` rejected the `(ifindex, queue_id, flags)` tuple: already
    /// bound, queue out of range, or insufficient privilege.
    #[error("failed to bind to the requested interface queue: {0}")]
    BindFailed(#[source] Errno),

    /// The `XDP_UMEM_REG` setsockopt was rejected.
    #[error("failed to register the Umem buffer with the kernel: {0}")]
    RegistrationFailed(#[source] Errno),

    /// A configuration value violates a documented precondition (ring size
    /// not a power of two, frame size not a multiple of the page size, an
    /// interface name that does not fit `IFNAMSIZ`, `fill_size` exceeding
    /// the Umem's total frame count, ...). Detected before any kernel call.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A raw syscall failed outside of the cases above (e.g. an interface
    /// lookup, an `ioctl` against the control socket used by the device
    /// helpers).
    #[error(transparent)]
    Errno(#[from] Errno),
}

pub(crate) struct LastErrno;

/// A raw `errno` value, formatted via `strerror(3)`.
///
/// Kept distinct from [`Error`] because many internal call sites just need
/// "the last OS error", the way the teacher's bindings do throughout; it is
/// wrapped into the richer [`Error`] at the public boundary once the calling
/// context (registration vs. bind vs. ...) is known.
pub struct Errno(libc::c_int);

impl From<LastErrno> for Errno {
    fn from(LastErrno: LastErrno) -> Self {
        Errno::new()
    }
}

impl Errno {
    pub(crate) fn new() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }

    /// Wrap an already-known `errno` value, e.g. one this crate rejects a
    /// request with before any syscall that would set the real one.
    pub(crate) fn from_raw(errno: libc::c_int) -> Self {
        Errno(errno)
    }

    /// The raw `errno` value.
    pub fn raw(&self) -> libc::c_int {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { core::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}

impl std::error::Error for Errno {}
