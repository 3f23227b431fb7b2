//! Virtual Interface
//!
//! Opens a kernel TUN device, assigns the tunnel address and brings it up.
//! The returned [`TunDevice`] is an async duplex handle where one read
//! yields exactly one IP packet.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as sys;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
use macos as sys;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod sys {
    use std::os::fd::{OwnedFd, RawFd};

    use super::InterfaceSpec;
    use crate::error::{Error, Result};

    pub fn create(_name: Option<&str>) -> Result<(OwnedFd, String)> {
        Err(Error::PlatformUnsupported(format!(
            "virtual interfaces are not supported on {}",
            std::env::consts::OS
        )))
    }

    pub fn configure(_name: &str, _spec: &InterfaceSpec) -> Result<()> {
        Ok(())
    }

    pub fn is_up(_name: &str) -> bool {
        false
    }

    pub fn read_packet(_fd: RawFd, _buf: &mut [u8]) -> std::io::Result<usize> {
        Err(std::io::ErrorKind::Unsupported.into())
    }

    pub fn write_packet(_fd: RawFd, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::ErrorKind::Unsupported.into())
    }
}

/// Parameters for opening a virtual interface
#[derive(Debug, Clone)]
pub struct InterfaceSpec {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Preferred name; ignored where the kernel allocates names
    pub name: Option<String>,
    pub mtu: u16,
}

impl InterfaceSpec {
    pub fn new(address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            address,
            netmask,
            name: None,
            mtu: 1500,
        }
    }

    /// Prefix length of the netmask
    pub fn prefix_len(&self) -> u32 {
        u32::from(self.netmask).count_ones()
    }
}

/// An open, configured TUN device
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
    address: Ipv4Addr,
    netmask: Ipv4Addr,
}

/// Open a TUN device and bring it up with the requested address
pub fn open(spec: &InterfaceSpec) -> Result<TunDevice> {
    let (fd, name) = sys::create(spec.name.as_deref())?;
    sys::configure(&name, spec)?;

    let fd = AsyncFd::new(fd).map_err(|e| Error::from_os("Failed to register TUN descriptor", e))?;
    tracing::info!("TUN device {} up at {}/{}", name, spec.address, spec.prefix_len());

    Ok(TunDevice {
        fd,
        name,
        address: spec.address,
        netmask: spec.netmask,
    })
}

impl TunDevice {
    /// Get the interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    /// Whether the device is administratively up
    pub fn is_up(&self) -> bool {
        sys::is_up(&self.name)
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("fd", &self.fd.as_raw_fd())
            .field("name", &self.name)
            .field("address", &self.address)
            .field("netmask", &self.netmask)
            .finish()
    }
}

impl AsyncRead for TunDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| sys::read_packet(inner.as_raw_fd(), unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for TunDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| sys::write_packet(inner.as_raw_fd(), buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        tracing::debug!("Closing TUN device {}", self.name);
    }
}

/// Run an interface configuration command, failing on a non-zero exit
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run_command(program: &str, args: &[&str]) -> Result<()> {
    let status = std::process::Command::new(program)
        .args(args)
        .status()
        .map_err(|e| Error::from_os(&format!("Failed to run {}", program), e))?;
    if !status.success() {
        return Err(Error::Interface(format!("`{} {}` exited with {}", program, args.join(" "), status)));
    }
    Ok(())
}

/// Extract the IP version nibble from a raw packet
pub fn ip_version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

/// Extract the destination IPv4 address from a raw IP packet
pub fn get_dest_ip(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || ip_version(packet) != Some(4) {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_len() {
        let spec = InterfaceSpec::new(Ipv4Addr::new(10, 8, 0, 1), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(spec.prefix_len(), 24);
        let spec = InterfaceSpec::new(Ipv4Addr::new(10, 8, 0, 1), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(spec.prefix_len(), 16);
    }

    #[test]
    fn test_packet_headers() {
        let mut packet = [0u8; 20];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&[10, 8, 0, 2]);
        assert_eq!(ip_version(&packet), Some(4));
        assert_eq!(get_dest_ip(&packet), Some(Ipv4Addr::new(10, 8, 0, 2)));

        packet[0] = 0x60;
        assert_eq!(get_dest_ip(&packet), None);
        assert_eq!(get_dest_ip(&packet[..10]), None);
        assert_eq!(ip_version(&[]), None);
    }

    // Needs CAP_NET_ADMIN: `sudo -E cargo test -- --ignored`
    #[cfg(target_os = "linux")]
    #[tokio::test]
    #[ignore]
    async fn test_open_assigns_address_and_brings_up() {
        let mut spec = InterfaceSpec::new(Ipv4Addr::new(10, 231, 0, 1), Ipv4Addr::new(255, 255, 255, 0));
        spec.name = Some("diablotest0".into());

        let device = open(&spec).unwrap();
        assert_eq!(device.name(), "diablotest0");
        assert_eq!(device.address(), spec.address);
        assert_eq!(device.netmask(), spec.netmask);
        assert!(device.is_up());
    }
}
