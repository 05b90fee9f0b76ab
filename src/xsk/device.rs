//! Device-level helpers that sit outside the `AF_XDP` socket family proper:
//! queue-count discovery and promiscuous mode, both driven through the
//! classic `ethtool`/`ioctl` interfaces rather than anything `XDP`-specific.
use crate::xdp::{EthtoolChannels, Ifreq, ETHTOOL_GCHANNELS};
use crate::Errno;

/// Open a throwaway `AF_INET`/`SOCK_DGRAM` socket to issue interface
/// `ioctl`s against, the same way `ethtool`/`ip` do — no traffic is ever
/// sent on it.
fn control_socket() -> Result<libc::c_int, Errno> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(Errno::new());
    }
    Ok(fd)
}

/// Query the current and maximum combined queue count of a network
/// interface, via `ETHTOOL_GCHANNELS`.
///
/// Drivers that do not implement the channel-count ethtool op (or report a
/// maximum of zero combined channels) are treated as single-queue devices:
/// this returns `(1, 1)`, matching the behavior of the original
/// `ethtool`-based tooling this crate's device helpers are modeled on.
pub fn get_nic_queues(ifname: &str) -> Result<(u32, u32), Errno> {
    let name = std::ffi::CString::new(ifname).map_err(|_| Errno::from_raw(libc::EINVAL))?;
    let mut ifr = Ifreq::for_name(&name).ok_or_else(|| Errno::from_raw(libc::EINVAL))?;

    let mut channels = EthtoolChannels {
        cmd: ETHTOOL_GCHANNELS,
        ..EthtoolChannels::default()
    };
    ifr.ifru.ifru_data = (&mut channels as *mut EthtoolChannels).cast();

    let fd = control_socket()?;
    let ret = unsafe { libc::ioctl(fd, libc::SIOCETHTOOL, &mut ifr as *mut Ifreq) };
    let errno = if ret < 0 { unsafe { *libc::__errno_location() } } else { 0 };
    unsafe { libc::close(fd) };

    if errno != 0 && errno != libc::EOPNOTSUPP {
        return Err(Errno::from_raw(errno));
    }

    if errno != 0 || channels.max_combined == 0 {
        return Ok((1, 1));
    }

    Ok((channels.combined_count, channels.max_combined))
}

/// Enable or disable promiscuous mode on a network interface, via
/// `SIOCGIFFLAGS`/`SIOCSIFFLAGS` and the `IFF_PROMISC` flag.
///
/// Requires `CAP_NET_ADMIN` in the interface's network namespace; absent
/// that, the `SIOCSIFFLAGS` call fails with `EPERM`.
pub fn set_nic_promisc(ifname: &str, on: bool) -> Result<(), Errno> {
    let name = std::ffi::CString::new(ifname).map_err(|_| Errno::from_raw(libc::EINVAL))?;
    let mut ifr = Ifreq::for_name(&name).ok_or_else(|| Errno::from_raw(libc::EINVAL))?;

    let fd = control_socket()?;

    let get_ret = unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut ifr as *mut Ifreq) };
    if get_ret < 0 {
        let err = Errno::new();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let flags = unsafe { ifr.ifru.flags };
    let new_flags = if on {
        flags | (libc::IFF_PROMISC as libc::c_short)
    } else {
        flags & !(libc::IFF_PROMISC as libc::c_short)
    };
    ifr.ifru.flags = new_flags;

    let set_ret = unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS, &mut ifr as *mut Ifreq) };
    let err = if set_ret < 0 { Some(Errno::new()) } else { None };
    unsafe { libc::close(fd) };

    match err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ifname_too_long_for_ifnamsiz() {
        let long_name = "x".repeat(libc::IFNAMSIZ + 4);
        let err = get_nic_queues(&long_name).unwrap_err();
        assert_eq!(err.raw(), libc::EINVAL);
    }

    #[test]
    fn missing_interface_does_not_panic() {
        // No network namespace is guaranteed to have this name; either
        // branch (ENODEV from the ioctl, or an interface that happens to
        // exist) must come back as a `Result`, never a panic/abort.
        let _ = get_nic_queues("xsk-queue-test-missing-if0");
        let _ = set_nic_promisc("xsk-queue-test-missing-if0", true);
    }
}
