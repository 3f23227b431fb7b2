//! macOS utun backend
//!
//! utun devices are kernel control sockets; the kernel picks the unit
//! index, so the preferred name is ignored. Every packet on the socket
//! carries a 4-byte protocol family header that is stripped on read and
//! added on write.

use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use super::{ip_version, run_command, InterfaceSpec};
use crate::error::{Error, Result};
use crate::forwarder::MAX_PACKET_SIZE;

const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";
const AF_HEADER_LEN: usize = 4;
/// Units tried before giving up
const MAX_UNITS: u32 = 256;

pub fn create(name: Option<&str>) -> Result<(OwnedFd, String)> {
    if let Some(name) = name {
        tracing::debug!("Ignoring preferred interface name {} on macOS", name);
    }

    let raw = unsafe { libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL) };
    if raw < 0 {
        return Err(Error::from_os("Failed to open utun control socket", io::Error::last_os_error()));
    }
    // SAFETY: `raw` is a freshly created socket owned by nobody else
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut info: libc::ctl_info = unsafe { mem::zeroed() };
    for (dst, src) in info.ctl_name.iter_mut().zip(UTUN_CONTROL_NAME) {
        *dst = *src as libc::c_char;
    }
    if unsafe { libc::ioctl(raw, libc::CTLIOCGINFO, &mut info as *mut libc::ctl_info) } < 0 {
        return Err(Error::Interface(format!(
            "CTLIOCGINFO failed: {}",
            io::Error::last_os_error()
        )));
    }

    let mut connected = None;
    for unit in 0..MAX_UNITS {
        let addr = libc::sockaddr_ctl {
            sc_len: mem::size_of::<libc::sockaddr_ctl>() as libc::c_uchar,
            sc_family: libc::AF_SYSTEM as libc::c_uchar,
            ss_sysaddr: libc::AF_SYS_CONTROL as u16,
            sc_id: info.ctl_id,
            sc_unit: unit + 1,
            sc_reserved: [0; 5],
        };
        let ret = unsafe {
            libc::connect(
                raw,
                &addr as *const libc::sockaddr_ctl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ctl>() as libc::socklen_t,
            )
        };
        if ret == 0 {
            connected = Some(unit);
            break;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EBUSY) => continue,
            Some(libc::EPERM) | Some(libc::EACCES) => {
                return Err(Error::PermissionDenied(format!("creating a utun device needs root: {}", err)))
            }
            _ => return Err(Error::Interface(format!("utun connect failed: {}", err))),
        }
    }
    let unit = connected.ok_or(Error::DeviceExhausted)?;

    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::Interface(format!(
            "Failed to make utun non-blocking: {}",
            io::Error::last_os_error()
        )));
    }

    Ok((fd, format!("utun{}", unit)))
}

pub fn configure(name: &str, spec: &InterfaceSpec) -> Result<()> {
    let address = spec.address.to_string();
    let netmask = spec.netmask.to_string();
    let mtu = spec.mtu.to_string();
    run_command(
        "ifconfig",
        &[name, &address, &address, "netmask", &netmask, "mtu", &mtu, "up"],
    )
}

pub fn is_up(name: &str) -> bool {
    std::process::Command::new("ifconfig")
        .arg(name)
        .output()
        .map(|out| {
            let text = String::from_utf8_lossy(&out.stdout);
            out.status.success() && text.contains("<UP")
        })
        .unwrap_or(false)
}

pub fn read_packet(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut frame = [0u8; AF_HEADER_LEN + MAX_PACKET_SIZE];
    let len = buf.len().min(MAX_PACKET_SIZE) + AF_HEADER_LEN;
    let n = unsafe { libc::read(fd, frame.as_mut_ptr() as *mut libc::c_void, len) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let n = n as usize;
    if n <= AF_HEADER_LEN {
        // Header-only frame, nothing to deliver
        return Err(io::ErrorKind::WouldBlock.into());
    }
    let payload = &frame[AF_HEADER_LEN..n];
    buf[..payload.len()].copy_from_slice(payload);
    Ok(payload.len())
}

pub fn write_packet(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let family = match ip_version(buf) {
        Some(6) => libc::AF_INET6,
        _ => libc::AF_INET,
    };
    let mut frame = Vec::with_capacity(AF_HEADER_LEN + buf.len());
    frame.extend_from_slice(&(family as u32).to_be_bytes());
    frame.extend_from_slice(buf);

    let n = unsafe { libc::write(fd, frame.as_ptr() as *const libc::c_void, frame.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((n as usize).saturating_sub(AF_HEADER_LEN))
}
