//! The single-producer/single-consumer ring shared with the kernel.
//!
//! Four of these back every socket: the `Umem`'s fill and completion rings
//! (addresses) and the socket's rx and tx rings (descriptors). The kernel is
//! always the counterparty on the other side, which is why every publish is
//! a release-store and every observe an acquire-load: the producer/consumer
//! index itself carries the memory ordering.
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use crate::xdp::{XdpDesc, XdpRingOffsets};
use crate::{Errno, Error};

use super::socket::SocketFd;
use super::iface::SocketMmapOffsets;

/// An index into a ring's slot array.
///
/// Not a plain offset: `slot(i) = ring[i & mask]`, and the producer/consumer
/// counters this is drawn from live in the full 32-bit range, wrapping
/// silently. Two `BufIdx`es are only comparable relative to a particular
/// ring's cached state.
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub struct BufIdx(pub u32);

/// The part of a ring shared by producer and consumer sides: the mask,
/// size, the kernel-visible counters, and the base of the descriptor array.
#[derive(Debug)]
pub(crate) struct Ring {
    cached_producer: u32,
    cached_consumer: u32,
    mask: u32,
    size: u32,
    producer: &'static core::sync::atomic::AtomicU32,
    consumer: &'static core::sync::atomic::AtomicU32,
    ring: NonNull<core::ffi::c_void>,
    flags: NonNull<u32>,
}

/// A producer-side ring: the fill ring (frame addresses) or the tx ring
/// (descriptors). User space advances the write head; the kernel advances
/// the read tail.
#[derive(Debug)]
pub struct RingProd {
    pub(crate) inner: Ring,
    pub(crate) mmap_addr: NonNull<[u8]>,
}

/// A consumer-side ring: the completion ring (frame addresses) or the rx
/// ring (descriptors). The kernel advances the write head; user space
/// advances the read tail.
#[derive(Debug)]
pub struct RingCons {
    pub(crate) inner: Ring,
    pub(crate) mmap_addr: NonNull<[u8]>,
}

impl Ring {
    const XDP_PGOFF_RX_RING: libc::off_t = 0;
    const XDP_PGOFF_TX_RING: libc::off_t = 0x80000000;
    const XDP_UMEM_PGOFF_FILL_RING: libc::off_t = 0x100000000;
    const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x180000000;

    /// Construct a ring from an mmap given by the kernel.
    ///
    /// # Safety
    ///
    /// The caller is responsible for ensuring that the memory mapping is
    /// valid and **outlives** the ring itself, and that the region is not
    /// concurrently mutably aliased outside of the kernel's own
    /// atomically-ordered writes.
    unsafe fn new(base: NonNull<u8>, off: &XdpRingOffsets, count: u32) -> Self {
        debug_assert!(count.is_power_of_two());
        let base = base.as_ptr();
        let trust_offset = |off: u64| NonNull::new_unchecked(base.offset(off as isize));

        let producer = trust_offset(off.producer).cast().as_ref();
        let consumer = trust_offset(off.consumer).cast().as_ref();

        let ring = trust_offset(off.desc).cast();
        let flags = trust_offset(off.flags).cast();

        Ring {
            mask: count - 1,
            size: count,
            producer,
            consumer,
            ring,
            flags,
            cached_producer: producer.load(Ordering::Relaxed),
            cached_consumer: consumer.load(Ordering::Relaxed),
        }
    }

    unsafe fn map(
        fd: &SocketFd,
        off: &XdpRingOffsets,
        count: u32,
        sz: u64,
        offset: libc::off_t,
    ) -> Result<(Self, NonNull<[u8]>), Error> {
        if !count.is_power_of_two() {
            return Err(Error::InvalidConfig("ring size must be a power of two"));
        }

        let len = (off.desc + u64::from(count) * sz) as usize;

        let mmap = libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd.0,
            offset,
        );

        if mmap == libc::MAP_FAILED {
            return Err(Error::MmapFailed(Errno::new()));
        }

        let mmap_addr = core::ptr::slice_from_raw_parts_mut(mmap as *mut u8, len);
        let mmap_addr = NonNull::new_unchecked(mmap_addr);
        let nn = mmap_addr.cast();

        Ok((Ring::new(nn, off, count), mmap_addr))
    }

    fn check_flags(&self) -> u32 {
        unsafe { self.flags.as_ptr().read_volatile() }
    }
}

impl RingProd {
    /// Kernel hint: when set, a `sendto`/`poll` wakeup is required before
    /// the kernel continues processing this ring (`XDP_RING_NEED_WAKEUP`).
    pub const NEED_WAKEUP: u32 = 1 << 0;

    /// # Safety
    ///
    /// `fd` and `off` must correspond as returned by the kernel for this
    /// socket's fill ring.
    pub(crate) unsafe fn fill(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, Error> {
        let (inner, mmap_addr) = Ring::map(
            fd,
            &off.inner.fr,
            count,
            core::mem::size_of::<u64>() as u64,
            Ring::XDP_UMEM_PGOFF_FILL_RING,
        )?;

        Ok(RingProd { inner, mmap_addr })
    }

    /// # Safety
    ///
    /// `fd` and `off` must correspond as returned by the kernel for this
    /// socket's tx ring.
    pub(crate) unsafe fn tx(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, Error> {
        let (inner, mmap_addr) = Ring::map(
            fd,
            &off.inner.tx,
            count,
            core::mem::size_of::<XdpDesc>() as u64,
            Ring::XDP_PGOFF_TX_RING,
        )?;

        Ok(RingProd { inner, mmap_addr })
    }

    /// # Safety
    /// `idx` must come from a not-yet-submitted [`RingProd::reserve`] on
    /// this ring.
    pub unsafe fn fill_addr(&self, idx: BufIdx) -> NonNull<u64> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.ring.cast::<u64>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    /// # Safety
    /// Same precondition as [`RingProd::fill_addr`].
    pub unsafe fn tx_desc(&self, idx: BufIdx) -> NonNull<XdpDesc> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.ring.cast::<XdpDesc>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    /// Query for up to `nb` free entries.
    ///
    /// Serves small requests from cached state about the kernel's consumer
    /// head; larger requests refresh it first.
    pub fn count_free(&mut self, nb: u32) -> u32 {
        let free_entries = self
            .inner
            .cached_consumer
            .wrapping_sub(self.inner.cached_producer);

        if free_entries >= nb {
            return free_entries;
        }

        self.inner.cached_consumer = self.inner.consumer.load(Ordering::Acquire);
        self.inner.cached_consumer = self.inner.cached_consumer.wrapping_add(self.inner.size);

        self.inner
            .cached_consumer
            .wrapping_sub(self.inner.cached_producer)
    }

    /// Reserve up to `nb` slots for filling, without publishing them to the
    /// kernel yet. Returns 0 (reserving nothing) if fewer than `nb` are
    /// free.
    pub fn reserve(&mut self, nb: u32, idx: &mut BufIdx) -> u32 {
        if self.count_free(nb) < nb {
            return 0;
        }

        *idx = BufIdx(self.inner.cached_producer);
        self.inner.cached_producer = self.inner.cached_producer.wrapping_add(nb);

        nb
    }

    /// Cancel a previous `reserve`. If passed a smaller number, the
    /// remaining reservation stays active.
    pub fn cancel(&mut self, nb: u32) {
        self.inner.cached_producer = self.inner.cached_producer.wrapping_sub(nb);
    }

    /// Publish the last `nb` reserved-and-filled slots to the kernel.
    pub fn submit(&mut self, nb: u32) {
        let cur = self.inner.producer.load(Ordering::Relaxed);
        self.inner
            .producer
            .store(cur.wrapping_add(nb), Ordering::Release);
    }

    pub(crate) fn check_flags(&self) -> u32 {
        self.inner.check_flags()
    }
}

impl RingCons {
    /// # Safety
    ///
    /// `fd` and `off` must correspond as returned by the kernel for this
    /// Umem's completion ring.
    pub(crate) unsafe fn comp(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, Error> {
        let (inner, mmap_addr) = Ring::map(
            fd,
            &off.inner.cr,
            count,
            core::mem::size_of::<u64>() as u64,
            Ring::XDP_UMEM_PGOFF_COMPLETION_RING,
        )?;

        Ok(RingCons { inner, mmap_addr })
    }

    /// # Safety
    ///
    /// `fd` and `off` must correspond as returned by the kernel for this
    /// socket's rx ring.
    pub(crate) unsafe fn rx(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, Error> {
        let (inner, mmap_addr) = Ring::map(
            fd,
            &off.inner.rx,
            count,
            core::mem::size_of::<XdpDesc>() as u64,
            Ring::XDP_PGOFF_RX_RING,
        )?;

        Ok(RingCons { inner, mmap_addr })
    }

    /// # Safety
    /// `idx` must come from a not-yet-released [`RingCons::peek`] on this
    /// ring.
    pub unsafe fn comp_addr(&self, idx: BufIdx) -> NonNull<u64> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.ring.cast::<u64>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    /// # Safety
    /// Same precondition as [`RingCons::comp_addr`].
    pub unsafe fn rx_desc(&self, idx: BufIdx) -> NonNull<XdpDesc> {
        let offset = (idx.0 & self.inner.mask) as isize;
        let base = self.inner.ring.cast::<XdpDesc>().as_ptr();
        NonNull::new_unchecked(base.offset(offset))
    }

    /// Find the number of available entries, up to `nb`.
    pub fn count_available(&mut self, nb: u32) -> u32 {
        let mut available = self
            .inner
            .cached_producer
            .wrapping_sub(self.inner.cached_consumer);

        if available == 0 {
            self.inner.cached_producer = self.inner.producer.load(Ordering::Acquire);
            available = self
                .inner
                .cached_producer
                .wrapping_sub(self.inner.cached_consumer);
        }

        available.min(nb)
    }

    /// Reserve up to `nb` available slots for reading, without releasing
    /// them back to the kernel yet.
    pub fn peek(&mut self, nb: u32, idx: &mut BufIdx) -> u32 {
        let count = self.count_available(nb);

        if count == 0 {
            return 0;
        }

        *idx = BufIdx(self.inner.cached_consumer);
        self.inner.cached_consumer = self.inner.cached_consumer.wrapping_add(count);

        count
    }

    /// Cancel a previous `peek`. If passed a smaller number, the remaining
    /// reservation stays active.
    pub fn cancel(&mut self, nb: u32) {
        self.inner.cached_consumer = self.inner.cached_consumer.wrapping_sub(nb);
    }

    /// Release the last `nb` peeked slots back to the kernel.
    pub fn release(&mut self, nb: u32) {
        let cur = self.inner.consumer.load(Ordering::Relaxed);
        self.inner
            .consumer
            .store(cur.wrapping_add(nb), Ordering::Release);
    }

    pub(crate) fn check_flags(&self) -> u32 {
        self.inner.check_flags()
    }
}

impl Drop for RingProd {
    fn drop(&mut self) {
        let len = super::ptr_len(self.mmap_addr.as_ptr());
        unsafe { libc::munmap(self.mmap_addr.as_ptr() as *mut _, len) };
    }
}

impl Drop for RingCons {
    fn drop(&mut self) {
        let len = super::ptr_len(self.mmap_addr.as_ptr());
        unsafe { libc::munmap(self.mmap_addr.as_ptr() as *mut _, len) };
    }
}

/// A cursor over previously-[`RingProd::reserve`]d fill-ring slots; rolls
/// back any unfilled reservation on drop.
pub struct Fill<'queue> {
    pub(crate) idx: super::user::BufIdxIter,
    pub(crate) queue: &'queue mut RingProd,
}

/// A cursor over previously-[`RingCons::peek`]ed completion-ring slots;
/// rolls back any unread reservation on drop.
pub struct Complete<'queue> {
    pub(crate) idx: super::user::BufIdxIter,
    pub(crate) queue: &'queue mut RingCons,
}

/// A cursor over previously-[`RingProd::reserve`]d tx-ring slots; rolls back
/// any unfilled reservation on drop.
pub struct Transmit<'queue> {
    pub(crate) idx: super::user::BufIdxIter,
    pub(crate) queue: &'queue mut RingProd,
}

/// A cursor over previously-[`RingCons::peek`]ed rx-ring slots; rolls back
/// any unread reservation on drop.
pub struct Receive<'queue> {
    pub(crate) idx: super::user::BufIdxIter,
    pub(crate) queue: &'queue mut RingCons,
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    /// A stand-in for "the kernel side" of a ring: just the two atomic
    /// counters, exercised the same way the producer/consumer protocol is,
    /// without any mmap or syscalls.
    struct MockRing {
        mask: u32,
        producer: AtomicU32,
        consumer: AtomicU32,
    }

    impl MockRing {
        fn new(size: u32) -> Self {
            assert!(size.is_power_of_two());
            MockRing {
                mask: size - 1,
                producer: AtomicU32::new(0),
                consumer: AtomicU32::new(0),
            }
        }
    }

    #[test]
    fn producer_consumer_cycle_never_exceeds_capacity() {
        let size = 8u32;
        let ring = MockRing::new(size);

        let mut cached_producer = 0u32;
        let mut cached_consumer = 0u32;

        for round in 0..1000u32 {
            let free = cached_consumer
                .wrapping_add(size)
                .wrapping_sub(cached_producer);
            assert!(free <= size, "round {round}: free {free} > size {size}");

            let reserve = free.min(3);
            cached_producer = cached_producer.wrapping_add(reserve);
            ring.producer.store(cached_producer, Ordering::Release);

            let avail = ring
                .producer
                .load(Ordering::Acquire)
                .wrapping_sub(cached_consumer);
            let take = avail.min(2);
            cached_consumer = cached_consumer.wrapping_add(take);
            ring.consumer.store(cached_consumer, Ordering::Release);
        }
    }

    #[test]
    fn slot_index_wraps_via_mask() {
        let ring = MockRing::new(4);
        let idx = u32::MAX;
        assert_eq!(idx & ring.mask, 3);
        assert_eq!(idx.wrapping_add(1) & ring.mask, 0);
    }
}
