//! Interface address lookup
//!
//! The VPN interface appears (and gets its address) only after the network
//! controller authorized this member, so a missing interface is just "not
//! ready yet".

use super::{AddressSource, InterfaceHandle, NetworkAddress, Readiness, ReadinessError};

/// Longest interface name the kernel accepts, excluding the trailing NUL
const MAX_INTERFACE_NAME: usize = 15;

/// Looks up addresses of local network interfaces
#[derive(Debug, Default, Clone)]
pub struct InterfaceAddresses;

impl InterfaceAddresses {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl AddressSource for InterfaceAddresses {
    async fn lookup(&self, interface: &str) -> Result<Readiness<NetworkAddress>, ReadinessError> {
        validate_name(interface)?;

        let Some(index) = sys::interface_index(interface) else {
            return Ok(Readiness::NotReady);
        };

        let ip = sys::interface_ipv4_addrs(interface)?
            .into_iter()
            .find(|ip| super::is_unicast(*ip));

        match ip {
            Some(ip) => {
                let handle = InterfaceHandle {
                    name: interface.to_string(),
                    index,
                };
                NetworkAddress::new(ip, handle).map(Readiness::Ready)
            }
            None => Ok(Readiness::NotReady),
        }
    }
}

/// Names that can never match an interface are malformed, not "not ready"
fn validate_name(name: &str) -> Result<(), ReadinessError> {
    if name.is_empty() || name.len() > MAX_INTERFACE_NAME || name.contains(['\0', '/']) {
        return Err(ReadinessError::Malformed(format!(
            "invalid interface name '{}'",
            name.escape_debug()
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
mod sys {
    use std::ffi::{CStr, CString};
    use std::io;
    use std::net::Ipv4Addr;

    pub fn interface_index(name: &str) -> Option<u32> {
        let c_name = CString::new(name).ok()?;
        // SAFETY: `c_name` is a valid NUL terminated string for the duration of the call.
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        (index != 0).then_some(index)
    }

    /// All IPv4 addresses of `name`, in kernel order
    pub fn interface_ipv4_addrs(name: &str) -> io::Result<Vec<Ipv4Addr>> {
        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
        // SAFETY: on success `head` points to a list we release with freeifaddrs below.
        if unsafe { libc::getifaddrs(&mut head) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut addrs = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            // SAFETY: `cursor` is a non-null node of the list returned by getifaddrs.
            let entry = unsafe { &*cursor };
            cursor = entry.ifa_next;

            if entry.ifa_name.is_null() || entry.ifa_addr.is_null() {
                continue;
            }
            // SAFETY: ifa_name is a NUL terminated string owned by the list.
            let entry_name = unsafe { CStr::from_ptr(entry.ifa_name) };
            if entry_name.to_bytes() != name.as_bytes() {
                continue;
            }
            // SAFETY: ifa_addr is non-null and starts with a sockaddr header.
            let family = unsafe { (*entry.ifa_addr).sa_family };
            if i32::from(family) != libc::AF_INET {
                continue;
            }
            // SAFETY: AF_INET addresses are sockaddr_in.
            let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
            addrs.push(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
        }

        // SAFETY: `head` came from a successful getifaddrs call and is freed once.
        unsafe { libc::freeifaddrs(head) };
        Ok(addrs)
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;
    use std::net::Ipv4Addr;

    pub fn interface_index(_name: &str) -> Option<u32> {
        None
    }

    pub fn interface_ipv4_addrs(_name: &str) -> io::Result<Vec<Ipv4Addr>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interface lookup is only supported on Linux",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("zt0").is_ok());
        assert!(validate_name("ztabcdef12").is_ok());

        for bad in ["", "a/b", "nul\0byte", "this-name-is-far-too-long"] {
            assert!(
                matches!(validate_name(bad), Err(ReadinessError::Malformed(_))),
                "{:?} should be malformed",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_missing_interface_is_not_ready() {
        let source = InterfaceAddresses::new();
        let result = source.lookup("cellnoif0").await.unwrap();
        assert_eq!(result, Readiness::NotReady);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_loopback_has_no_unicast_address() {
        // lo only carries 127.0.0.1, which never qualifies as a discovery scope
        let source = InterfaceAddresses::new();
        let result = source.lookup("lo").await.unwrap();
        assert_eq!(result, Readiness::NotReady);
    }
}
