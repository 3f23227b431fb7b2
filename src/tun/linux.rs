//! Linux TUN backend (`/dev/net/tun` + iproute2)

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use super::{run_command, InterfaceSpec};
use crate::error::{Error, Result};

// TUNSETIFF = _IOW('T', 202, c_int)
// PowerPC encodes ioctl direction bits differently from x86/ARM.
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_UP: u32 = 0x1;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// Allocate a TUN device. An empty or missing name lets the kernel pick `tunN`.
pub fn create(name: Option<&str>) -> Result<(OwnedFd, String)> {
    let raw = unsafe {
        libc::open(
            b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
            libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
        )
    };
    if raw < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::ENODEV) => {
                Error::PlatformUnsupported(format!("TUN driver not available: {}", err))
            }
            _ => Error::from_os("Failed to open /dev/net/tun", err),
        });
    }
    // SAFETY: `raw` is a freshly opened descriptor owned by nobody else
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut req = Ifreq {
        ifr_name: [0u8; IFNAMSIZ],
        ifr_flags: IFF_TUN | IFF_NO_PI,
        _pad: [0u8; 22],
    };
    if let Some(name) = name {
        let bytes = name.as_bytes();
        let len = bytes.len().min(IFNAMSIZ - 1);
        req.ifr_name[..len].copy_from_slice(&bytes[..len]);
    }

    let ret = unsafe { libc::ioctl(raw, TUNSETIFF as _, &mut req as *mut Ifreq) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => Error::PermissionDenied(format!(
                "creating a TUN device needs CAP_NET_ADMIN: {}",
                err
            )),
            Some(libc::EBUSY) => Error::Interface(format!(
                "device {} is busy: {}",
                name.unwrap_or("tun"),
                err
            )),
            _ => Error::Interface(format!("ioctl TUNSETIFF failed: {}", err)),
        });
    }

    let actual_name = std::str::from_utf8(&req.ifr_name)
        .unwrap_or_default()
        .trim_end_matches('\0')
        .to_string();
    tracing::debug!("Allocated TUN device {}", actual_name);

    Ok((fd, actual_name))
}

/// Assign the address, set the MTU and bring the interface up
pub fn configure(name: &str, spec: &InterfaceSpec) -> Result<()> {
    let cidr = format!("{}/{}", spec.address, spec.prefix_len());
    run_command("ip", &["addr", "add", &cidr, "dev", name])?;

    if let Err(e) = run_command("ip", &["link", "set", "dev", name, "mtu", &spec.mtu.to_string()]) {
        tracing::warn!("Failed to set MTU on {}: {}", name, e);
    }

    run_command("ip", &["link", "set", "dev", name, "up"])
}

/// Read the interface flags from sysfs
pub fn is_up(name: &str) -> bool {
    std::fs::read_to_string(format!("/sys/class/net/{}/flags", name))
        .ok()
        .and_then(|flags| u32::from_str_radix(flags.trim().trim_start_matches("0x"), 16).ok())
        .map(|flags| flags & IFF_UP != 0)
        .unwrap_or(false)
}

pub fn read_packet(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

pub fn write_packet(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
