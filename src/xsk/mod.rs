//! Internals of the `AF_XDP` socket and ring bindings.
//!
//! This module groups the pieces that only make sense together: the shared
//! ring representation (`ring`), the `Umem` allocator and free-frame pool
//! (`umem`), the per-queue socket and its rx/tx loop (`socket`, `user`), the
//! interface/statistics queries (`iface`), and the two device-control
//! helpers that sit outside the socket family proper (`device`).
//!
//! Nothing here is process-global: an `IfInfo`, a `Umem`, and a `Socket` are
//! all explicit values the caller constructs and owns.
use std::sync::Arc;

mod device;
mod iface;
mod ring;
mod socket;
mod umem;
mod user;

pub use device::{get_nic_queues, set_nic_promisc};
pub use ring::{BufIdx, Complete, Fill, Receive, RingCons, RingProd, Transmit};
pub use socket::{RingSetup, Socket, SocketConfig};
pub use umem::{Frame, Umem, UmemConfig};
pub use user::{DeviceQueue, RecvOutcome, RingRx, RingTx};

/// Socket-level option number for the `XDP` option namespace.
///
/// Not part of `libc`: the kernel's `AF_XDP` socket options are not
/// upstreamed into the crate, so — matching how the teacher crate treats
/// every other XDP-specific constant — this is defined locally.
pub(crate) const SOL_XDP: libc::c_int = 283;

/// A network device queue, identified the same way the kernel identifies it
/// for binding and for the per-network-namespace cookie comparison used to
/// detect "is this the same queue" across repeated binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct IfCtx {
    pub ifindex: u32,
    pub queue_id: u32,
    pub netnscookie: u64,
}

/// Identifies a network interface, and optionally a specific queue of it.
///
/// Construct with [`IfInfo::invalid`] and fill in with [`IfInfo::from_name`]
/// or [`IfInfo::from_ifindex`], then optionally refine the queue with
/// [`IfInfo::set_queue`].
#[derive(Debug, Clone, Copy)]
pub struct IfInfo {
    pub(crate) ctx: IfCtx,
    pub(crate) ifname: [libc::c_char; libc::IFNAMSIZ],
}

/// An owned `AF_XDP` file descriptor, closed on drop.
///
/// Potentially shared by several [`Socket`]s and a [`Umem`] when they are
/// configured to share the same underlying kernel socket (`with_shared`,
/// shared-Umem binds).
#[derive(Debug)]
pub(crate) struct SocketFd(pub libc::c_int);

impl SocketFd {
    /// Read a socket option into `val`, returning the number of bytes the
    /// kernel actually wrote.
    pub(crate) fn get_opt<T>(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        val: &T,
    ) -> Result<libc::socklen_t, crate::Errno> {
        let mut len = core::mem::size_of::<T>() as libc::socklen_t;
        let err = unsafe {
            libc::getsockopt(
                self.0,
                level,
                name,
                val as *const T as *mut libc::c_void,
                &mut len,
            )
        };

        if err != 0 {
            return Err(crate::Errno::new());
        }

        Ok(len)
    }
}

impl Clone for SocketFd {
    /// Duplicate the underlying file descriptor via `dup(2)`.
    ///
    /// Used where several owners (a `Umem` and the sockets bound against
    /// it) each need an independently closeable handle to the same kernel
    /// object.
    fn clone(&self) -> Self {
        let fd = unsafe { libc::dup(self.0) };
        debug_assert!(fd >= 0, "dup of a supposedly valid fd failed");
        SocketFd(fd)
    }
}

impl Drop for SocketFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// A set of device queues currently claimed by some `DeviceQueue`, used to
/// refuse a second fill/completion pair on the same `(ifindex, queue_id)`.
pub(crate) trait ControlSet: Send + Sync {
    fn insert(&self, ctx: IfCtx) -> bool;
    #[allow(dead_code)]
    fn contains(&self, ctx: &IfCtx) -> bool;
    fn remove(&self, ctx: &IfCtx);
}

#[derive(Clone)]
pub(crate) struct DeviceControl {
    inner: Arc<dyn ControlSet>,
}

impl core::ops::Deref for DeviceControl {
    type Target = dyn ControlSet;
    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

/// The byte length of a `NonNull<[u8]>`'s pointee, without requiring the
/// unstable metadata APIs.
pub(crate) fn ptr_len(ptr: *mut [u8]) -> usize {
    // Safety: we only ever read the fat pointer's length metadata.
    unsafe { (*(ptr as *const [u8])).len() }
}
