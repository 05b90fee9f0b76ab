// Please see the respective Linux documentation instead.
#![allow(missing_docs)]

/// Rx/Tx descriptor.
///
/// The layout of this struct is part of the kernel interface.
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpDesc {
    /// Full address of this descriptor.
    pub addr: u64,
    /// Logical length of the buffer referenced by the descriptor.
    pub len: u32,
    /// A bitfield of options.
    pub options: u32,
}

/// Argument to `setsockopt(_, SOL_XDP, XDP_UMEM_REG)`.
///
/// Note that this struct's size determines the kernel interpretation of the option. In particular,
/// padding passes garbage to the kernel while indicating said garbage as values!
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpUmemReg {
    pub addr: u64,
    pub len: u64,
    pub chunk_size: u32,
    pub headroom: u32,
    pub flags: u32,
    pub tx_metadata_len: u32,
}

const _NO_PADDING: () = {
    assert!(
        core::mem::size_of::<XdpUmemReg>()
        // For each field. Keep in sync.
            == (core::mem::size_of::<u64>()
                + core::mem::size_of::<u64>()
                + core::mem::size_of::<u32>()
                + core::mem::size_of::<u32>()
                + core::mem::size_of::<u32>()
                + core::mem::size_of::<u32>())
    );
};

/// The mmap-offsets to use for mapping one ring of an XDP socket.
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpRingOffsets {
    /// the relative address of the producer.
    pub producer: u64,
    /// the relative address of the consumer.
    pub consumer: u64,
    /// the relative address of the descriptor.
    pub desc: u64,
    /// the relative address of the flags area.
    pub flags: u64,
}

/// The different offsets as returned by the kernel, for all rings of a socket.
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpMmapOffsets {
    pub rx: XdpRingOffsets,
    pub tx: XdpRingOffsets,
    /// Fill ring offset.
    pub fr: XdpRingOffsets,
    /// Completion ring offset.
    pub cr: XdpRingOffsets,
}

/// Prior version of XdpMmapOffsets (<= Linux 5.3).
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpRingOffsetsV1 {
    /// the relative address of the producer.
    pub producer: u64,
    /// the relative address of the consumer.
    pub consumer: u64,
    /// the relative address of the descriptor.
    pub desc: u64,
}

/// Prior version of XdpMmapOffsets (<= Linux 5.3).
#[repr(C)]
#[derive(Default, Debug, Copy, Clone)]
pub struct XdpMmapOffsetsV1 {
    /// Offsets for the receive ring (kernel produced).
    pub rx: XdpRingOffsetsV1,
    /// Offsets for the transmit ring (user produced).
    pub tx: XdpRingOffsetsV1,
    /// Offsets for the fill ring (user produced).
    pub fr: XdpRingOffsetsV1,
    /// Offsets for the completion ring (kernel produced).
    pub cr: XdpRingOffsetsV1,
}

#[repr(C)]
#[doc(alias = "sockaddr_xdp")]
#[derive(Debug, Copy, Clone)]
pub struct SockAddrXdp {
    #[doc(alias = "sxdp_family")]
    pub family: u16,
    #[doc(alias = "sxdp_flags")]
    pub flags: u16,
    #[doc(alias = "sxdp_ifindex")]
    pub ifindex: u32,
    #[doc(alias = "sxdp_queue_id")]
    pub queue_id: u32,
    #[doc(alias = "sxdp_shared_umem_fd")]
    pub shared_umem_fd: u32,
}

/// Prior version of XdpStatisticsV2 that only contains fields present from <= Linux 5.8
#[repr(C)]
#[doc(alias = "xdp_statistics")]
#[derive(Debug, Default, Copy, Clone)]
pub struct XdpStatistics {
    pub rx_dropped: u64,
    pub rx_invalid_descs: u64,
    pub tx_invalid_descs: u64,
}

#[repr(C)]
#[doc(alias = "xdp_statistics")]
#[derive(Debug, Default, Copy, Clone)]
#[non_exhaustive]
pub struct XdpStatisticsV2 {
    pub rx_dropped: u64,
    pub rx_invalid_descs: u64,
    pub tx_invalid_descs: u64,
    // Only set on >= Linux 5.9
    pub rx_ring_full: u64,
    // Only set on >= Linux 5.9
    pub rx_fill_ring_empty_descs: u64,
    // Only set on >= Linux 5.9
    pub tx_ring_empty_descs: u64,
}

impl Default for SockAddrXdp {
    fn default() -> Self {
        SockAddrXdp {
            family: libc::AF_XDP as u16,
            flags: 0,
            ifindex: 0,
            queue_id: 0,
            shared_umem_fd: 0,
        }
    }
}

/// Bind flags (`sxdp_flags`). At most one of `COPY`/`ZERO_COPY` may be set;
/// `SHARED_UMEM` and `USE_NEED_WAKEUP` may combine freely with either.
pub mod bind_flags {
    /// Force the copy path (no zero-copy DMA from the NIC into `Umem`).
    pub const XDP_COPY: u16 = 1 << 1;
    /// Require the zero-copy path; bind fails if the driver cannot provide it.
    pub const XDP_ZEROCOPY: u16 = 1 << 2;
    /// This socket shares its fill/completion rings with another socket's `Umem`.
    pub const XDP_SHARED_UMEM: u16 = 1 << 0;
    /// Ask the kernel to signal, via the ring flags word, when a wakeup
    /// (`poll`/`sendto`) is needed to make further progress.
    pub const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;
}

/// `ethtool` `ETHTOOL_GCHANNELS` ioctl payload (`struct ethtool_channels`).
///
/// Laid out to match the kernel UAPI so it can be pointed at by an `ifreq`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct EthtoolChannels {
    pub cmd: u32,
    pub max_rx: u32,
    pub max_tx: u32,
    pub max_other: u32,
    pub max_combined: u32,
    pub rx_count: u32,
    pub tx_count: u32,
    pub other_count: u32,
    pub combined_count: u32,
}

/// `ETHTOOL_GCHANNELS`, queries the current/maximum channel (queue) counts.
pub const ETHTOOL_GCHANNELS: u32 = 0x0000003c;

/// A Linux `struct ifreq`, specialised to the two shapes this crate needs:
/// a generic `ioctl` data pointer (used for `SIOCETHTOOL`) and a 16-bit
/// flags word (used for `SIOCGIFFLAGS`/`SIOCSIFFLAGS`).
#[repr(C)]
pub union IfreqData {
    pub flags: libc::c_short,
    pub ifru_data: *mut core::ffi::c_void,
}

#[repr(C)]
pub struct Ifreq {
    pub ifrn_name: [libc::c_char; libc::IFNAMSIZ],
    pub ifru: IfreqData,
}

impl Ifreq {
    /// Build an `ifreq` naming `ifname`, with the union payload zeroed.
    ///
    /// Fails if the name (plus NUL) does not fit `IFNAMSIZ`, matching the
    /// original's `ifreq.SetIfrn` bounds check.
    pub fn for_name(ifname: &core::ffi::CStr) -> Option<Self> {
        let bytes = ifname.to_bytes_with_nul();
        if bytes.len() > libc::IFNAMSIZ {
            return None;
        }

        let mut ifrn_name = [0 as libc::c_char; libc::IFNAMSIZ];
        for (dst, &src) in ifrn_name.iter_mut().zip(bytes.iter()) {
            *dst = src as libc::c_char;
        }

        Some(Ifreq {
            ifrn_name,
            ifru: IfreqData { flags: 0 },
        })
    }
}
