//! The `AF_XDP` socket handle, its construction, and the staged rx/tx ring
//! setup that precedes `bind(2)`.
use core::num::NonZeroU32;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::xdp::{XdpStatistics, XdpStatisticsV2};
use crate::{Errno, Error, LastErrno};

use super::iface::{self, SocketMmapOffsets};
use super::ring::{RingCons, RingProd};
use super::user::{RingRx, RingTx};
use super::{IfInfo, SocketFd};

/// An owned `AF_XDP` file descriptor paired with the interface it was
/// created against.
///
/// Cheap to clone: the inner fd is reference counted, matching the several
/// owners (a [`super::Umem`], a [`RingSetup`], a [`super::DeviceQueue`])
/// that may share one kernel socket when `with_shared`/shared-`Umem` binds
/// are in play.
#[derive(Clone)]
pub struct Socket {
    pub(crate) info: IfInfo,
    pub(crate) fd: Arc<SocketFd>,
}

/// Configuration for [`Umem::rx_tx`](super::Umem::rx_tx): which rings to
/// set up, and the `bind(2)` flags to use.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub rx_size: Option<NonZeroU32>,
    pub tx_size: Option<NonZeroU32>,
    pub bind_flags: u16,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            rx_size: NonZeroU32::new(2048),
            tx_size: NonZeroU32::new(2048),
            bind_flags: 0,
        }
    }
}

/// The rx/tx ring sizes configured on a socket and its mmap offsets,
/// staged but not yet bound.
///
/// Obtained from [`Umem::rx_tx`](super::Umem::rx_tx); map whichever rings
/// were configured with [`RingSetup::map_rx`]/[`RingSetup::map_tx`], then
/// hand this to [`Umem::bind`](super::Umem::bind) (or
/// [`super::DeviceQueue::bind`] when binding through a shared device) to
/// actually call `bind(2)`.
pub struct RingSetup {
    pub(crate) socket: Socket,
    pub(crate) config: SocketConfig,
    pub(crate) map: SocketMmapOffsets,
}

impl RingSetup {
    pub(crate) fn new(socket: Socket, config: SocketConfig, map: SocketMmapOffsets) -> Self {
        RingSetup {
            socket,
            config,
            map,
        }
    }

    /// The raw fd this setup's socket is on.
    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.fd.0
    }

    /// Map the rx ring, if `rx_size` was configured.
    pub fn map_rx(&self) -> Result<RingRx, Error> {
        let size = self
            .config
            .rx_size
            .ok_or(Error::InvalidConfig("no rx_size configured"))?;
        let ring = unsafe { RingCons::rx(&self.socket.fd, &self.map, size.get())? };
        Ok(RingRx::new(self.socket.clone(), ring))
    }

    /// Map the tx ring, if `tx_size` was configured.
    pub fn map_tx(&self) -> Result<RingTx, Error> {
        let size = self
            .config
            .tx_size
            .ok_or(Error::InvalidConfig("no tx_size configured"))?;
        let ring = unsafe { RingProd::tx(&self.socket.fd, &self.map, size.get())? };
        Ok(RingTx::new(self.socket.clone(), ring))
    }
}

impl Socket {
    const SO_NETNS_COOKIE: libc::c_int = 71;
    const INIT_NS: u64 = 1;

    /// Open a fresh `AF_XDP` socket for `interface`.
    pub fn new(interface: &IfInfo) -> Result<Self, Error> {
        let fd = Arc::new(SocketFd::new().map_err(Error::UnsupportedKernel)?);
        Self::with_xdp_socket(interface, fd)
    }

    /// Reuse `umem`'s fd: rx/tx and the fill/completion pair then live on
    /// the same kernel socket, which is required for a shared-`Umem` bind.
    pub fn with_shared(interface: &IfInfo, umem: &super::Umem) -> Result<Self, Error> {
        Self::with_xdp_socket(interface, umem.fd.clone())
    }

    fn with_xdp_socket(interface: &IfInfo, fd: Arc<SocketFd>) -> Result<Self, Error> {
        let mut info = *interface;

        let mut netnscookie: u64 = 0;
        let mut optlen: libc::socklen_t = core::mem::size_of_val(&netnscookie) as libc::socklen_t;
        let err = unsafe {
            libc::getsockopt(
                fd.0,
                libc::SOL_SOCKET,
                Self::SO_NETNS_COOKIE,
                (&mut netnscookie) as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };

        match err {
            0 => {}
            libc::ENOPROTOOPT => netnscookie = Self::INIT_NS,
            _ => return Err(Errno::from(LastErrno).into()),
        }

        info.ctx.netnscookie = netnscookie;

        Ok(Socket { fd, info })
    }

    /// The raw fd underlying this socket.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.0
    }

    /// The interface/queue this socket was created for.
    pub fn info(&self) -> &IfInfo {
        &self.info
    }

    /// Read the kernel's per-socket `AF_XDP` counters.
    ///
    /// Falls back to the pre-5.9 [`XdpStatistics`] shape transparently;
    /// callers that need the newer fields should call
    /// [`Socket::stats_v2`] directly and handle its own fallback.
    pub fn stats(&self) -> Result<XdpStatistics, Errno> {
        iface::read_statistics(&self.fd)
    }

    /// Read the kernel's per-socket `AF_XDP` counters, in the >= Linux 5.9
    /// shape.
    pub fn stats_v2(&self) -> Result<XdpStatisticsV2, Errno> {
        iface::read_statistics_v2(&self.fd)
    }
}

impl SocketFd {
    pub(crate) fn new() -> Result<Self, Errno> {
        let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(LastErrno)?;
        }
        Ok(SocketFd(fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_config_has_both_rings() {
        let config = SocketConfig::default();
        assert!(config.rx_size.is_some());
        assert!(config.tx_size.is_some());
        assert_eq!(config.bind_flags, 0);
    }
}
