//! The per-queue handles built on top of the raw rings: the fill/completion
//! pair ([`DeviceQueue`]), the rx/tx pair ([`RingRx`]/[`RingTx`]), and the
//! reservation cursors ([`super::Fill`] etc.) that make filling/draining
//! them safe.
use crate::xdp::XdpDesc;
use crate::Error;

use super::ring::{BufIdx, Complete, Fill, Receive, RingCons, RingProd, Transmit};
use super::socket::{RingSetup, Socket};
use super::umem::{bind_socket, Umem};
use super::DeviceControl;

/// The fill and completion rings for one `(interface, queue)` pair, bound
/// to a [`super::Umem`].
///
/// Exactly one `DeviceQueue` may exist for a given `(ifindex, queue_id)` at
/// a time — a second [`super::Umem::fq_cq`] call against the same queue is
/// rejected with [`Error::InvalidConfig`], and dropping this one frees the
/// queue back up.
pub struct DeviceQueue {
    pub(crate) socket: Socket,
    pub(crate) fill: RingProd,
    pub(crate) comp: RingCons,
    pub(crate) devices: DeviceControl,
}

impl DeviceQueue {
    pub(crate) fn new(
        socket: Socket,
        fill: RingProd,
        comp: RingCons,
        devices: DeviceControl,
    ) -> Self {
        DeviceQueue {
            socket,
            fill,
            comp,
            devices,
        }
    }

    /// Bind this queue's underlying socket to the `(interface, queue)` it
    /// was set up for.
    ///
    /// Equivalent to [`super::Umem::bind`] when this queue shares its
    /// `Umem`'s socket fd (the common case); kept as its own method because
    /// a [`DeviceQueue`] may also be the only handle left once the `Umem`
    /// that created it has been dropped.
    pub fn bind(&self, setup: &RingSetup) -> Result<(), Error> {
        bind_socket(&setup.socket, setup.config.bind_flags, Some(&self.socket.fd))
    }

    /// Reserve up to `n` fill-ring slots to hand frame addresses to the
    /// kernel.
    pub fn fill(&mut self, n: u32) -> Fill<'_> {
        Fill {
            idx: BufIdxIter::reserve(&mut self.fill, n),
            queue: &mut self.fill,
        }
    }

    /// Reap up to `n` frame addresses the kernel has finished transmitting.
    pub fn complete(&mut self, n: u32) -> Complete<'_> {
        Complete {
            idx: BufIdxIter::peek(&mut self.comp, n),
            queue: &mut self.comp,
        }
    }

    /// Frames the kernel has made available on the completion ring but
    /// this queue has not yet drained.
    pub fn available(&mut self) -> u32 {
        self.comp.count_available(u32::MAX)
    }

    /// Push as many of `umem`'s free frames as fit into the fill ring.
    ///
    /// Returns the number of frames queued; see
    /// [`super::Umem::replenish`].
    pub fn replenish(&mut self, umem: &super::Umem) -> u32 {
        umem.replenish(&mut self.fill)
    }

    /// Drain the completion ring, returning each completed frame to
    /// `umem`'s free pool.
    ///
    /// Returns the number of frames reclaimed; see [`super::Umem::drain`].
    pub fn drain_completions(&mut self, umem: &super::Umem) -> u32 {
        umem.drain(&mut self.comp)
    }

    /// Fill-ring slots reserved by this queue but not yet submitted.
    pub fn pending(&mut self) -> u32 {
        self.fill.count_free(u32::MAX)
    }

    /// The raw fd of the socket this fill/completion pair lives on.
    pub fn as_raw_fd(&self) -> libc::c_int {
        self.socket.fd.0
    }

    /// Whether the kernel requires a wakeup ([`DeviceQueue::wake`]) before
    /// it continues consuming the fill ring.
    pub fn needs_wakeup(&self) -> bool {
        self.fill.check_flags() & RingProd::NEED_WAKEUP != 0
    }

    /// Wake the kernel's fill-ring consumer via a zero-timeout `poll`.
    pub fn wake(&mut self) {
        let mut poll = libc::pollfd {
            fd: self.socket.fd.0,
            events: 0,
            revents: 0,
        };

        let ret = unsafe { libc::poll(&mut poll as *mut _, 1, 0) };
        if ret < 0 {
            log::debug!("fill ring wakeup poll failed: {}", crate::Errno::new());
        }
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.devices.remove(&self.socket.info.ctx);
    }
}

/// The rx ring for one `(interface, queue)` pair.
pub struct RingRx {
    socket: Socket,
    ring: RingCons,
}

impl RingRx {
    pub(crate) fn new(socket: Socket, ring: RingCons) -> Self {
        RingRx { socket, ring }
    }

    /// Reserve up to `n` received descriptors for reading.
    pub fn receive(&mut self, n: u32) -> Receive<'_> {
        Receive {
            idx: BufIdxIter::peek(&mut self.ring, n),
            queue: &mut self.ring,
        }
    }

    /// Descriptors the kernel has made available but not yet read.
    pub fn available(&mut self) -> u32 {
        self.ring.count_available(u32::MAX)
    }

    /// The raw fd of the socket this rx ring lives on.
    pub fn as_raw_fd(&self) -> libc::c_int {
        self.socket.fd.0
    }

    /// Drain whatever is currently on the rx ring, handing each descriptor
    /// to `handler`, then replenish the fill ring with frames the handler
    /// released back (`RecvOutcome::Recycle`).
    ///
    /// Does not block: call [`RingRx::poll_once`] first if the caller wants
    /// to wait for packets to arrive. Returns the number of descriptors
    /// handled.
    pub fn handle_recv(
        &mut self,
        umem: &Umem,
        fill: &mut DeviceQueue,
        max: u32,
        mut handler: impl FnMut(&Umem, XdpDesc) -> RecvOutcome,
    ) -> usize {
        let mut n = 0usize;
        {
            let mut reader = self.receive(max);
            while let Some(desc) = reader.read() {
                n += 1;
                let frame_size = umem.frame_size() as u64;
                let frame_addr = desc.addr - (desc.addr % frame_size);
                match handler(umem, desc) {
                    RecvOutcome::Recycle => umem.put_frame(frame_addr),
                    RecvOutcome::Retain => {}
                }
            }
            reader.release();
        }
        umem.replenish(&mut fill.fill);
        n
    }

    /// Block (if `timeout_ms >= 0`) until the rx socket becomes readable,
    /// or a `need_wakeup` tx/fill condition subsides.
    ///
    /// Returns whether the socket is readable; a `false` return with a
    /// non-negative timeout means the wait simply elapsed.
    pub fn poll_once(&self, timeout_ms: libc::c_int) -> Result<bool, Error> {
        let mut poll = libc::pollfd {
            fd: self.socket.fd.0,
            events: libc::POLLIN,
            revents: 0,
        };

        let ret = unsafe { libc::poll(&mut poll as *mut _, 1, timeout_ms) };
        if ret < 0 {
            return Err(crate::Errno::new())?;
        }

        Ok(poll.revents & libc::POLLIN != 0)
    }
}

/// The tx ring for one `(interface, queue)` pair.
pub struct RingTx {
    socket: Socket,
    ring: RingProd,
}

impl RingTx {
    pub(crate) fn new(socket: Socket, ring: RingProd) -> Self {
        RingTx { socket, ring }
    }

    /// Reserve up to `n` tx-ring slots to hand descriptors to the kernel.
    pub fn transmit(&mut self, n: u32) -> Transmit<'_> {
        Transmit {
            idx: BufIdxIter::reserve(&mut self.ring, n),
            queue: &mut self.ring,
        }
    }

    /// Tx-ring slots reserved but not yet submitted to the kernel.
    pub fn pending(&mut self) -> u32 {
        self.ring.count_free(u32::MAX)
    }

    /// Whether the kernel requires a wakeup ([`RingTx::wake`]) before it
    /// continues consuming the tx ring.
    pub fn needs_wakeup(&self) -> bool {
        self.ring.check_flags() & RingProd::NEED_WAKEUP != 0
    }

    /// Wake the kernel's tx-ring consumer via a zero-length, non-blocking
    /// `sendto`.
    pub fn wake(&self) {
        let ret = unsafe {
            libc::sendto(
                self.socket.fd.0,
                core::ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                core::ptr::null(),
                0,
            )
        };
        if ret < 0 {
            log::debug!("tx ring wakeup sendto failed: {}", crate::Errno::new());
        }
    }

    /// The raw fd of the socket this tx ring lives on.
    pub fn as_raw_fd(&self) -> libc::c_int {
        self.socket.fd.0
    }

    /// Drain whatever the kernel has finished transmitting back to the
    /// free pool, then copy each of `payloads` into a freshly popped frame
    /// and enqueue it on the tx ring.
    ///
    /// Returns the number of payloads actually enqueued: fewer than
    /// `payloads.len()` whenever the tx ring or the free pool runs out,
    /// which is expected backpressure rather than an error.
    pub fn transmit_batch(
        &mut self,
        umem: &Umem,
        comp: &mut DeviceQueue,
        payloads: &[&[u8]],
    ) -> usize {
        umem.drain(&mut comp.comp);

        let mut writer = self.transmit(payloads.len() as u32);
        let mut queued = 0usize;

        for payload in payloads {
            let Some(addr) = umem.get_frame() else {
                break;
            };

            let len = unsafe { umem.write_frame(addr, payload) };
            let desc = XdpDesc {
                addr,
                len,
                options: 0,
            };

            if writer.insert_once(desc) == 0 {
                umem.put_frame(addr);
                break;
            }
            queued += 1;
        }

        writer.commit();
        drop(writer);

        if queued > 0 && self.needs_wakeup() {
            self.wake();
        }

        queued
    }

    /// Enqueue a single, already-prepared descriptor (e.g. a retransmit of
    /// a `RecvOutcome::Retain`ed frame) onto the tx ring.
    pub fn transmit_desc(&mut self, desc: XdpDesc) -> bool {
        let mut writer = self.transmit(1);
        let inserted = writer.insert_once(desc) == 1;
        writer.commit();
        drop(writer);

        if inserted && self.needs_wakeup() {
            self.wake();
        }

        inserted
    }
}

/// What a receive handler decided to do with the frame it was just handed.
///
/// Returned from the closure passed to [`Socket::handle_recv`]-style loops
/// so callers that hold on to a frame past the handler's return (queueing
/// it for later retransmission, say) can opt out of the default recycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Return the frame to the `Umem`'s free pool once the handler returns.
    Recycle,
    /// The handler has taken ownership of the frame; it is the caller's
    /// responsibility to eventually call [`super::Umem::put_frame`].
    Retain,
}

pub(crate) struct BufIdxIter {
    base: BufIdx,
    buffers: u32,
    remain: u32,
}

impl Iterator for BufIdxIter {
    type Item = BufIdx;
    fn next(&mut self) -> Option<BufIdx> {
        let next = self.remain.checked_sub(1)?;
        self.remain = next;
        let ret = self.base;
        self.base.0 = self.base.0.wrapping_add(1);
        Some(ret)
    }
}

impl BufIdxIter {
    fn peek(queue: &mut RingCons, n: u32) -> Self {
        let mut this = BufIdxIter {
            buffers: 0,
            remain: 0,
            base: BufIdx(0),
        };
        this.buffers = queue.peek(n, &mut this.base);
        this.remain = this.buffers;
        this
    }

    fn reserve(queue: &mut RingProd, n: u32) -> Self {
        let mut this = BufIdxIter {
            buffers: 0,
            remain: 0,
            base: BufIdx(0),
        };
        this.buffers = queue.reserve(n, &mut this.base);
        this.remain = this.buffers;
        this
    }

    fn commit_prod(&mut self, queue: &mut RingProd) {
        if self.buffers > 0 {
            let count = self.buffers - self.remain;
            queue.submit(count);
            self.buffers -= count;
            self.base.0 = self.base.0.wrapping_add(count);
        }
    }

    fn release_cons(&mut self, queue: &mut RingCons) {
        if self.buffers > 0 {
            let count = self.buffers - self.remain;
            queue.release(count);
            self.buffers -= count;
            self.base.0 = self.base.0.wrapping_add(count);
        }
    }
}

impl Fill<'_> {
    /// The total number of reserved slots.
    pub fn capacity(&self) -> u32 {
        self.idx.buffers
    }

    /// Fill one reserved slot with a frame address.
    pub fn insert_once(&mut self, addr: u64) -> u32 {
        self.insert(core::iter::once(addr))
    }

    /// Fill reserved slots from an iterator of frame addresses. Stops at
    /// whichever of the iterator or the reservation runs out first.
    pub fn insert(&mut self, it: impl Iterator<Item = u64>) -> u32 {
        let mut n = 0;
        for (item, bufidx) in it.zip(self.idx.by_ref()) {
            n += 1;
            unsafe { *self.queue.fill_addr(bufidx).as_ptr() = item };
        }
        n
    }

    /// Publish the filled slots to the kernel.
    pub fn commit(&mut self) {
        self.idx.commit_prod(self.queue)
    }
}

impl Drop for Fill<'_> {
    fn drop(&mut self) {
        if self.idx.buffers != 0 {
            self.queue.cancel(self.idx.buffers)
        }
    }
}

impl Complete<'_> {
    /// The total number of available buffers.
    pub fn capacity(&self) -> u32 {
        self.idx.buffers
    }

    /// Read the next completed frame address.
    pub fn read(&mut self) -> Option<u64> {
        let bufidx = self.idx.next()?;
        Some(unsafe { *self.queue.comp_addr(bufidx).as_ptr() })
    }

    /// Release the read buffers back to the kernel.
    pub fn release(&mut self) {
        self.idx.release_cons(self.queue)
    }
}

impl Drop for Complete<'_> {
    fn drop(&mut self) {
        if self.idx.buffers != 0 {
            self.queue.cancel(self.idx.buffers)
        }
    }
}

impl Transmit<'_> {
    /// The total number of reserved slots.
    pub fn capacity(&self) -> u32 {
        self.idx.buffers
    }

    /// Fill one reserved slot with a descriptor.
    pub fn insert_once(&mut self, desc: XdpDesc) -> u32 {
        self.insert(core::iter::once(desc))
    }

    /// Fill reserved slots from an iterator of descriptors. Stops at
    /// whichever of the iterator or the reservation runs out first.
    pub fn insert(&mut self, it: impl Iterator<Item = XdpDesc>) -> u32 {
        let mut n = 0;
        for (item, bufidx) in it.zip(self.idx.by_ref()) {
            n += 1;
            unsafe { *self.queue.tx_desc(bufidx).as_ptr() = item };
        }
        n
    }

    /// Publish the filled slots to the kernel.
    pub fn commit(&mut self) {
        self.idx.commit_prod(self.queue);
    }
}

impl Drop for Transmit<'_> {
    fn drop(&mut self) {
        if self.idx.buffers != 0 {
            self.queue.cancel(self.idx.buffers)
        }
    }
}

impl Receive<'_> {
    /// The total number of available descriptors.
    pub fn capacity(&self) -> u32 {
        self.idx.buffers
    }

    /// Read the next received descriptor.
    pub fn read(&mut self) -> Option<XdpDesc> {
        let bufidx = self.idx.next()?;
        Some(unsafe { *self.queue.rx_desc(bufidx).as_ptr() })
    }

    /// Release the read descriptors back to the kernel.
    pub fn release(&mut self) {
        self.idx.release_cons(self.queue)
    }
}

impl Drop for Receive<'_> {
    fn drop(&mut self) {
        if self.idx.buffers != 0 {
            self.queue.cancel(self.idx.buffers)
        }
    }
}

/// `Send`/`Sync`: every field is either `Send`/`Sync` itself or, like the
/// raw pointers backing a ring's mmap, only ever dereferenced behind the
/// acquire/release protocol the ring methods already enforce.
unsafe impl Send for DeviceQueue {}
unsafe impl Send for RingRx {}
unsafe impl Send for RingTx {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_outcome_equality() {
        assert_eq!(RecvOutcome::Recycle, RecvOutcome::Recycle);
        assert_ne!(RecvOutcome::Recycle, RecvOutcome::Retain);
    }
}
