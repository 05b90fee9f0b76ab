//! Interface lookup and socket-level mmap-offset/statistics queries.
use core::ffi::CStr;

use crate::xdp::{
    XdpMmapOffsets, XdpMmapOffsetsV1, XdpRingOffsets, XdpRingOffsetsV1, XdpStatistics,
    XdpStatisticsV2,
};
use crate::{Errno, LastErrno};

use super::socket::SocketFd;
use super::{IfCtx, IfInfo};

impl IfInfo {
    /// Create an info referring to no device.
    ///
    /// This allows allocating an info to overwrite with more specific
    /// information via [`IfInfo::from_name`] or [`IfInfo::from_ifindex`].
    pub fn invalid() -> Self {
        IfInfo {
            ctx: IfCtx {
                ifindex: 0,
                queue_id: 0,
                netnscookie: 0,
            },
            ifname: [b'\0' as libc::c_char; libc::IFNAMSIZ],
        }
    }

    /// Set the information from an interface, by name.
    ///
    /// Common interface names are `enp8s0`, `lo`, `wg0`, etc. — the same
    /// name-to-index pair `ip link show` reports.
    pub fn from_name(&mut self, st: &CStr) -> Result<(), Errno> {
        let bytes = st.to_bytes_with_nul();

        if bytes.len() > self.ifname.len() {
            return Err(Errno(libc::EINVAL));
        }

        let bytes = unsafe { &*(bytes as *const _ as *const [libc::c_char]) };
        let index = unsafe { libc::if_nametoindex(st.as_ptr()) };

        if index == 0 {
            return Err(LastErrno)?;
        }

        self.ctx.ifindex = index;
        self.ctx.queue_id = 0;
        self.ctx.netnscookie = 0;
        self.ifname[..bytes.len()].copy_from_slice(bytes);

        Ok(())
    }

    /// Set the information from an interface, by its numeric identifier.
    ///
    /// See [`Self::from_name`].
    pub fn from_ifindex(&mut self, index: libc::c_uint) -> Result<(), Errno> {
        let err = unsafe { libc::if_indextoname(index, self.ifname.as_mut_ptr()) };

        if err.is_null() {
            return Err(LastErrno)?;
        }

        self.ctx.ifindex = index;
        self.ctx.queue_id = 0;
        self.ctx.netnscookie = 0;

        Ok(())
    }

    /// Configure the queue ID to bind to.
    ///
    /// This does not itself validate that the queue exists; that is only
    /// discovered at bind time (any earlier check would be subject to
    /// TOCTOU races against interface reconfiguration anyway).
    pub fn set_queue(&mut self, queue_id: u32) {
        self.ctx.queue_id = queue_id;
    }

    /// The kernel's numeric `ifindex` for the identified interface.
    pub fn ifindex(&self) -> u32 {
        self.ctx.ifindex
    }

    /// The queue ID previously set with [`IfInfo::set_queue`].
    pub fn queue_id(&self) -> u32 {
        self.ctx.queue_id
    }
}

/// The negotiated mmap offsets for one socket's four rings, normalized to
/// the latest kernel struct shape regardless of which version actually
/// answered the `getsockopt`.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct SocketMmapOffsets {
    pub(crate) inner: XdpMmapOffsets,
}

impl SocketMmapOffsets {
    const OPT_V1: libc::socklen_t = core::mem::size_of::<XdpMmapOffsetsV1>() as libc::socklen_t;
    const OPT_LATEST: libc::socklen_t = core::mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;

    /// Query the socket mmap offsets of an `AF_XDP` socket.
    pub(crate) fn new(sock: &SocketFd) -> Result<Self, Errno> {
        SocketMmapOffsets::try_from(sock)
    }
}

impl TryFrom<&SocketFd> for SocketMmapOffsets {
    type Error = Errno;

    /// Read the socket mmap offsets of an `AF_XDP` socket, negotiating the
    /// V1 (<= Linux 5.3) shape down to the current one when that's all the
    /// kernel returns.
    fn try_from(sock: &SocketFd) -> Result<Self, Self::Error> {
        fn fixup_v1(v1: XdpRingOffsetsV1) -> XdpRingOffsets {
            XdpRingOffsets {
                producer: v1.producer,
                consumer: v1.consumer,
                desc: v1.desc,
                flags: v1.consumer + core::mem::size_of::<u32>() as u64,
            }
        }

        union Offsets {
            v1: XdpMmapOffsetsV1,
            latest: XdpMmapOffsets,
            init: (),
        }

        let mut this = Self::default();

        let off = Offsets { init: () };
        match sock
            .clone()
            .get_opt(super::SOL_XDP, super::umem::Umem::XDP_MMAP_OFFSETS, &off)?
        {
            Self::OPT_V1 => {
                let v1 = unsafe { off.v1 };

                this.inner = XdpMmapOffsets {
                    rx: fixup_v1(v1.rx),
                    tx: fixup_v1(v1.tx),
                    fr: fixup_v1(v1.fr),
                    cr: fixup_v1(v1.cr),
                };

                Ok(this)
            }
            Self::OPT_LATEST => {
                this.inner = unsafe { off.latest };
                Ok(this)
            }
            _ => Err(Errno(-libc::EINVAL)),
        }
    }
}

pub(crate) fn read_statistics(sock: &SocketFd) -> Result<XdpStatistics, Errno> {
    let this = XdpStatistics::default();

    sock.clone()
        .get_opt(super::SOL_XDP, super::umem::Umem::XDP_STATISTICS, &this)?;
    Ok(this)
}

pub(crate) fn read_statistics_v2(sock: &SocketFd) -> Result<XdpStatisticsV2, Errno> {
    let this = XdpStatisticsV2::default();

    sock.clone()
        .get_opt(super::SOL_XDP, super::umem::Umem::XDP_STATISTICS, &this)?;
    Ok(this)
}
