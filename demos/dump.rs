//! Bind an `AF_XDP` socket to an interface queue and dump received packets
//! to stderr until interrupted.
use core::cell::UnsafeCell;
use core::{num::NonZeroU32, ptr::NonNull};

use xsk_queue::{IfInfo, RecvOutcome, Socket, SocketConfig, Umem, UmemConfig};

#[repr(align(4096))]
struct PacketMap(UnsafeCell<[u8; 1 << 20]>);
// Safety: no instance used for unsynchronized data access.
unsafe impl Sync for PacketMap {}

static MEM: PacketMap = PacketMap(UnsafeCell::new([0; 1 << 20]));

fn main() {
    env_logger::init();
    let args = <Args as clap::Parser>::parse();

    let mem = NonNull::new(MEM.0.get() as *mut [u8]).unwrap();
    // Safety: the mapping is static, page-aligned, and outlives the Umem.
    let umem = unsafe { Umem::new(UmemConfig::default(), mem) }.unwrap();

    let info = ifinfo(&args).unwrap();
    let sock = Socket::with_shared(&info, &umem).unwrap();
    let mut device = umem.fq_cq(&sock).unwrap();

    let rxtx = umem
        .rx_tx(
            &sock,
            &SocketConfig {
                rx_size: NonZeroU32::new(2048),
                tx_size: None,
                bind_flags: 0,
            },
        )
        .unwrap();

    umem.bind(&rxtx).unwrap();
    let mut rx = rxtx.map_rx().unwrap();

    // Prime the fill ring so the kernel has somewhere to put incoming frames.
    device.replenish(&umem);

    eprintln!("Listening on {}...", args.ifname);

    let mut total = 0u64;
    let max_packets = args.total.unwrap_or(u32::MAX) as u64;

    while total < max_packets {
        if !rx.poll_once(100).unwrap() {
            continue;
        }

        let handled = rx.handle_recv(&umem, &mut device, 256, |umem, desc| {
            let data = umem.data(&desc);
            eprintln!("rx {} bytes: {:02x?}", data.len(), &data[..data.len().min(32)]);
            RecvOutcome::Recycle
        });

        total += handled as u64;
    }

    let stats = sock.stats().unwrap();
    eprintln!(
        "done: {total} packets; rx_dropped={} rx_invalid={}",
        stats.rx_dropped, stats.rx_invalid_descs
    );
}

#[derive(clap::Parser)]
struct Args {
    /// The name of the interface to use.
    ifname: String,
    /// Overwrite the queue_id.
    #[arg(long = "queue-id")]
    queue_id: Option<u32>,
    /// Stop after receiving this many packets.
    #[arg(long = "packets-total")]
    total: Option<u32>,
}

fn ifinfo(args: &Args) -> Result<IfInfo, xsk_queue::Errno> {
    let mut bytes = String::from(&args.ifname);
    bytes.push('\0');
    let bytes = bytes.as_bytes();
    let name = core::ffi::CStr::from_bytes_with_nul(bytes).unwrap();

    let mut info = IfInfo::invalid();
    info.from_name(name)?;
    if let Some(q) = args.queue_id {
        info.set_queue(q);
    }

    Ok(info)
}
