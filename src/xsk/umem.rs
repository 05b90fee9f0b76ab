//! The `Umem`: a page-aligned packet buffer registered with the kernel, its
//! fill/completion rings, and the free-frame pool that hands frame addresses
//! out to whichever socket needs one next.
use core::ptr::NonNull;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use spin::RwLock;

use crate::xdp::{SockAddrXdp, XdpDesc, XdpUmemReg};
use crate::{Errno, Error};

use super::iface::SocketMmapOffsets;
use super::ring::{BufIdx, RingCons, RingProd};
use super::socket::{RingSetup, Socket, SocketConfig, SocketFd};
use super::user::DeviceQueue;
use super::{ControlSet, DeviceControl, IfCtx};

/// Configuration for a [`Umem`]: ring sizes, frame geometry, and kernel
/// registration flags.
///
/// `fill_size`/`complete_size` must be powers of two; `frame_size` must be a
/// multiple of the page size; `fill_size` must not exceed `frame_count` —
/// there would be nothing to put in the extra fill slots. All three are
/// checked by [`Umem::new`], never left to fail a later syscall.
#[derive(Debug, Clone)]
pub struct UmemConfig {
    pub fill_size: u32,
    pub complete_size: u32,
    pub frame_size: u32,
    pub headroom: u32,
    pub flags: u32,
    pub frame_count: u32,
}

impl Default for UmemConfig {
    fn default() -> Self {
        let frame_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u32;
        // ~16 MiB of frames, matching the original tool's default Umem size.
        let frame_count = (16 * 1024 * 1024) / frame_size;

        UmemConfig {
            fill_size: 2048,
            complete_size: 2048,
            frame_size,
            headroom: 0,
            flags: 0,
            frame_count,
        }
    }
}

/// A resolved view of one frame in the `Umem` area: its frame-relative
/// address (as used on the wire in rings/descriptors) and the byte slice
/// backing it.
#[derive(Debug)]
pub struct Frame<'umem> {
    pub offset: u64,
    pub addr: NonNull<[u8]>,
    _marker: core::marker::PhantomData<&'umem ()>,
}

/// The page-aligned buffer shared with the kernel, its fill/completion
/// rings, and a free-frame address pool.
///
/// One `Umem` may back several [`Socket`]s on different queues
/// (`fq_cq`/`bind` dedup by `(ifindex, queue_id)` so two sockets never claim
/// the same device queue's fill/completion pair).
pub struct Umem {
    pub(crate) config: UmemConfig,
    pub(crate) fd: Arc<SocketFd>,
    umem_area: NonNull<[u8]>,
    pub(crate) devices: DeviceControl,
    pool: Arc<Mutex<Vec<u64>>>,
}

// Safety: `umem_area` points at a kernel-registered mmap the `Umem` owns
// exclusively apart from the kernel's own accesses, which are synchronized
// through the fill/completion rings' atomics.
unsafe impl Send for Umem {}
unsafe impl Sync for Umem {}

impl Umem {
    /* Socket options for XDP, not upstreamed in `libc`. */
    pub(crate) const XDP_MMAP_OFFSETS: libc::c_int = 1;
    pub(crate) const XDP_RX_RING: libc::c_int = 2;
    pub(crate) const XDP_TX_RING: libc::c_int = 3;
    pub(crate) const XDP_UMEM_REG: libc::c_int = 4;
    pub(crate) const XDP_UMEM_FILL_RING: libc::c_int = 5;
    pub(crate) const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;
    pub(crate) const XDP_STATISTICS: libc::c_int = 7;
    #[allow(dead_code)]
    pub(crate) const XDP_OPTIONS: libc::c_int = 8;

    /// Register `area` as this socket family's packet buffer and carve it
    /// into `config.frame_count` frames of `config.frame_size` bytes.
    ///
    /// # Safety
    ///
    /// `area` must denote a live mapping of at least
    /// `config.frame_size * config.frame_count` bytes that outlives the
    /// returned `Umem`, and the caller must not mutate it outside of frames
    /// not currently held by the kernel.
    pub unsafe fn new(config: UmemConfig, area: NonNull<[u8]>) -> Result<Umem, Error> {
        if !config.fill_size.is_power_of_two() || !config.complete_size.is_power_of_two() {
            return Err(Error::InvalidConfig(
                "fill_size and complete_size must be powers of two",
            ));
        }

        let page_size = libc::sysconf(libc::_SC_PAGESIZE) as u32;
        if config.frame_size == 0 || config.frame_size % page_size != 0 {
            return Err(Error::InvalidConfig(
                "frame_size must be a non-zero multiple of the page size",
            ));
        }

        if config.fill_size > config.frame_count {
            return Err(Error::InvalidConfig(
                "fill_size must not exceed frame_count",
            ));
        }

        let area_len = super::ptr_len(area.as_ptr());
        if area_len < (config.frame_size as usize) * (config.frame_count as usize) {
            return Err(Error::InvalidConfig(
                "area is smaller than frame_size * frame_count",
            ));
        }

        debug_assert!(
            (area.as_ptr() as *mut u8 as usize) & (page_size as usize - 1) == 0,
            "Umem area must be page-aligned"
        );

        let devices = DeviceControl {
            inner: Arc::new(SpinLockedControlSet::default()),
        };

        let fd = SocketFd::new().map_err(Error::UnsupportedKernel)?;

        let mut pool = Vec::with_capacity(config.frame_count as usize);
        for i in 0..config.frame_count as u64 {
            pool.push(i * config.frame_size as u64);
        }

        let umem = Umem {
            config,
            fd: Arc::new(fd),
            umem_area: area,
            devices,
            pool: Arc::new(Mutex::new(pool)),
        };

        Self::configure(&umem)?;
        log::debug!(
            "registered Umem: {} frames of {} bytes",
            umem.config.frame_count,
            umem.config.frame_size
        );
        Ok(umem)
    }

    fn configure(this: &Umem) -> Result<(), Error> {
        let mr = XdpUmemReg {
            addr: this.umem_area.as_ptr() as *mut u8 as u64,
            len: super::ptr_len(this.umem_area.as_ptr()) as u64,
            chunk_size: this.config.frame_size,
            headroom: this.config.headroom,
            flags: this.config.flags,
            tx_metadata_len: 0,
        };

        let err = unsafe {
            libc::setsockopt(
                this.fd.0,
                super::SOL_XDP,
                Self::XDP_UMEM_REG,
                (&mr) as *const _ as *const libc::c_void,
                core::mem::size_of_val(&mr) as libc::socklen_t,
            )
        };

        if err != 0 {
            return Err(Error::RegistrationFailed(Errno::new()));
        }

        Ok(())
    }

    /// Pop a frame address off the free pool, if any is available.
    ///
    /// Returns `None` in steady state whenever every frame is currently
    /// somewhere in flight (held by the kernel or the application) — this
    /// is the expected backpressure signal, not an error.
    pub fn get_frame(&self) -> Option<u64> {
        self.pool.lock().unwrap().pop()
    }

    /// Return a frame address to the free pool.
    pub fn put_frame(&self, addr: u64) {
        self.pool.lock().unwrap().push(addr);
    }

    /// The configured frame size, i.e. the granularity frame addresses are
    /// aligned to.
    pub fn frame_size(&self) -> u32 {
        self.config.frame_size
    }

    /// Copy `data` into the frame starting at `addr`, returning the number
    /// of bytes written (truncated to the frame size if `data` overruns
    /// it).
    ///
    /// # Safety
    ///
    /// `addr` must be the start of a frame currently owned by the caller
    /// (popped from the free pool and not yet submitted to the kernel on
    /// any ring).
    pub unsafe fn write_frame(&self, addr: u64, data: &[u8]) -> u32 {
        let frame = self.frame(addr);
        let len = data.len().min(frame.addr.len());
        let dst = frame.addr.as_ptr() as *mut u8;
        core::ptr::copy_nonoverlapping(data.as_ptr(), dst, len);
        len as u32
    }

    /// Resolve a frame-relative address into a [`Frame`] view over its
    /// bytes.
    pub fn frame(&self, addr: u64) -> Frame<'_> {
        let base = self.umem_area.as_ptr() as *mut u8;
        let len = self.config.frame_size as usize;
        let ptr = unsafe { base.add(addr as usize) };
        let addr_slice =
            unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(ptr, len)) };

        Frame {
            offset: addr,
            addr: addr_slice,
            _marker: core::marker::PhantomData,
        }
    }

    /// Borrow the bytes a descriptor refers to.
    pub fn data(&self, desc: &XdpDesc) -> &[u8] {
        let base = self.umem_area.as_ptr() as *mut u8;
        unsafe {
            core::slice::from_raw_parts(base.add(desc.addr as usize), desc.len as usize)
        }
    }

    /// Push as many free frames as fit into the fill ring, up to the
    /// number of frames actually available in the pool.
    ///
    /// Returns the number of frames queued.
    pub fn replenish(&self, fill: &mut RingProd) -> u32 {
        let free = {
            let pool = self.pool.lock().unwrap();
            pool.len() as u32
        };

        let n = fill.count_free(free).min(free);
        if n == 0 {
            return 0;
        }

        let mut idx = BufIdx(0);
        let reserved = fill.reserve(n, &mut idx);
        let mut queued = 0;
        for i in 0..reserved {
            let Some(addr) = self.get_frame() else {
                break;
            };
            unsafe {
                *fill.fill_addr(BufIdx(idx.0.wrapping_add(i))).as_ptr() = addr;
            }
            queued += 1;
        }

        if queued < reserved {
            fill.cancel(reserved - queued);
        }
        fill.submit(queued);
        queued
    }

    /// Drain the completion ring, returning each completed frame to the
    /// free pool.
    ///
    /// Returns the number of frames reclaimed.
    pub fn drain(&self, comp: &mut RingCons) -> u32 {
        let mut idx = BufIdx(0);
        let n = comp.peek(self.config.complete_size, &mut idx);
        for i in 0..n {
            let addr = unsafe { comp.comp_addr(BufIdx(idx.0.wrapping_add(i))).as_ptr().read() };
            self.put_frame(addr);
        }
        comp.release(n);
        n
    }

    /// Map the fill and completion ring pair for one device queue.
    ///
    /// Exclusive per `(ifindex, queue_id)`: a second call for the same
    /// queue fails rather than silently sharing the administration of a
    /// single fill/completion pair between two owners.
    pub fn fq_cq(&self, interface: &Socket) -> Result<DeviceQueue, Error> {
        if !self.devices.insert(interface.info.ctx) {
            return Err(Error::InvalidConfig(
                "a DeviceQueue is already claimed for this (ifindex, queue_id)",
            ));
        }

        struct DropGuard<'a>(&'a IfCtx, &'a DeviceControl);

        impl Drop for DropGuard<'_> {
            fn drop(&mut self) {
                self.1.remove(self.0);
            }
        }

        let _guard = DropGuard(&interface.info.ctx, &self.devices);

        let sock = &*interface.fd;
        Self::configure_cq(sock, &self.config)?;
        let map = SocketMmapOffsets::new(sock)?;

        let fill = unsafe { RingProd::fill(sock, &map, self.config.fill_size)? };
        let comp = unsafe { RingCons::comp(sock, &map, self.config.complete_size)? };

        let device = DeviceQueue::new(
            Socket {
                info: interface.info,
                fd: interface.fd.clone(),
            },
            fill,
            comp,
            self.devices.clone(),
        );

        core::mem::forget(_guard);
        log::debug!(
            "claimed fill/completion pair for ifindex={} queue_id={}",
            interface.info.ctx.ifindex,
            interface.info.ctx.queue_id
        );
        Ok(device)
    }

    /// Configure the rx/tx ring sizes for a socket and fetch its mmap
    /// offsets, without binding yet.
    ///
    /// The returned [`RingSetup`] is the staging point from which
    /// [`RingSetup::map_rx`]/[`RingSetup::map_tx`] map the configured rings
    /// and [`Umem::bind`] actually performs `bind(2)`.
    pub fn rx_tx(&self, socket: &Socket, config: &SocketConfig) -> Result<RingSetup, Error> {
        let sock = &*socket.fd;
        Self::configure_rt(sock, config)?;
        let map = SocketMmapOffsets::new(sock)?;

        Ok(RingSetup::new(
            Socket {
                info: socket.info,
                fd: socket.fd.clone(),
            },
            config.clone(),
            map,
        ))
    }

    /// Bind a configured [`RingSetup`] to `(ifindex, queue_id)`, deriving
    /// `shared_umem`/the shared fd from whether its socket is the same fd
    /// this `Umem` was registered against.
    ///
    /// If the underlying socket fd is shared with another `Socket`/`Umem`,
    /// this also effectively binds those sharers; that is intentional,
    /// matching one `AF_XDP` fd binding once for all its users.
    pub fn bind(&self, setup: &RingSetup) -> Result<(), Error> {
        bind_socket(&setup.socket, setup.config.bind_flags, Some(&self.fd))
    }

    pub(crate) fn configure_cq(fd: &SocketFd, config: &UmemConfig) -> Result<(), Error> {
        if unsafe {
            libc::setsockopt(
                fd.0,
                super::SOL_XDP,
                Umem::XDP_UMEM_COMPLETION_RING,
                (&config.complete_size) as *const _ as *const libc::c_void,
                core::mem::size_of_val(&config.complete_size) as libc::socklen_t,
            )
        } != 0
        {
            return Err(Error::UnsupportedKernel(Errno::new()));
        }

        if unsafe {
            libc::setsockopt(
                fd.0,
                super::SOL_XDP,
                Umem::XDP_UMEM_FILL_RING,
                (&config.fill_size) as *const _ as *const libc::c_void,
                core::mem::size_of_val(&config.fill_size) as libc::socklen_t,
            )
        } != 0
        {
            return Err(Error::UnsupportedKernel(Errno::new()));
        }

        Ok(())
    }

    pub(crate) fn configure_rt(fd: &SocketFd, config: &SocketConfig) -> Result<(), Error> {
        if let Some(num) = config.rx_size {
            if unsafe {
                libc::setsockopt(
                    fd.0,
                    super::SOL_XDP,
                    Umem::XDP_RX_RING,
                    (&num) as *const _ as *const libc::c_void,
                    core::mem::size_of_val(&num) as libc::socklen_t,
                )
            } != 0
            {
                return Err(Error::UnsupportedKernel(Errno::new()));
            }
        }

        if let Some(num) = config.tx_size {
            if unsafe {
                libc::setsockopt(
                    fd.0,
                    super::SOL_XDP,
                    Umem::XDP_TX_RING,
                    (&num) as *const _ as *const libc::c_void,
                    core::mem::size_of_val(&num) as libc::socklen_t,
                )
            } != 0
            {
                return Err(Error::UnsupportedKernel(Errno::new()));
            }
        }

        Ok(())
    }
}

/// Shared `bind(2)` logic used by both [`Umem::bind`] and
/// [`super::user::DeviceQueue::bind`]: they differ only in which fd happens
/// to be at hand, since a shared-`Umem` bind and its device queue's bind
/// ultimately name the same underlying kernel socket.
pub(crate) fn bind_socket(
    socket: &Socket,
    bind_flags: u16,
    umem_fd: Option<&Arc<SocketFd>>,
) -> Result<(), Error> {
    let mut sxdp = SockAddrXdp {
        ifindex: socket.info.ctx.ifindex,
        queue_id: socket.info.ctx.queue_id,
        flags: bind_flags,
        ..SockAddrXdp::default()
    };

    if let Some(umem_fd) = umem_fd {
        if !Arc::ptr_eq(umem_fd, &socket.fd) {
            sxdp.flags |= crate::xdp::bind_flags::XDP_SHARED_UMEM;
            sxdp.shared_umem_fd = umem_fd.0 as u32;
        }
    }

    if unsafe {
        libc::bind(
            socket.fd.0,
            (&sxdp) as *const _ as *const libc::sockaddr,
            core::mem::size_of_val(&sxdp) as libc::socklen_t,
        )
    } != 0
    {
        return Err(Error::BindFailed(Errno::new()));
    }

    log::debug!(
        "bound ifindex={} queue_id={} flags={:#x}",
        sxdp.ifindex,
        sxdp.queue_id,
        sxdp.flags
    );

    Ok(())
}

#[derive(Default)]
struct SpinLockedControlSet {
    inner: RwLock<BTreeSet<IfCtx>>,
}

impl ControlSet for SpinLockedControlSet {
    fn insert(&self, ctx: IfCtx) -> bool {
        self.inner.write().insert(ctx)
    }

    fn contains(&self, ctx: &IfCtx) -> bool {
        self.inner.read().contains(ctx)
    }

    fn remove(&self, ctx: &IfCtx) {
        self.inner.write().remove(ctx);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    /// Stand-in for the free-frame pool's invariant: every address popped
    /// is eventually pushed back exactly once, and the pool never yields
    /// the same address twice concurrently.
    #[test]
    fn put_frame_after_get_frame_is_identity() {
        let pool = Mutex::new(vec![0u64, 4096, 8192]);

        let addr = pool.lock().unwrap().pop().unwrap();
        assert_eq!(pool.lock().unwrap().len(), 2);

        pool.lock().unwrap().push(addr);
        let mut remaining = pool.lock().unwrap().clone();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![0, 4096, 8192]);
    }

    #[test]
    fn pool_exhaustion_returns_none_not_a_panic() {
        let pool: Mutex<Vec<u64>> = Mutex::new(Vec::new());
        assert_eq!(pool.lock().unwrap().pop(), None);
    }

    #[test]
    fn frame_size_must_be_page_multiple() {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u32;
        assert_eq!(page % page, 0);
        assert_ne!((page + 1) % page, 0);
    }
}
