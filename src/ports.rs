//! Host port allocation for per-VM forwards.
//!
//! Allocation is check-then-bind: a port found free here can still be taken
//! by an unrelated process before the hypervisor binds it. That surfaces as a
//! launch error. Ports already recorded for other VMs are passed in as
//! `reserved` so stopped VMs keep their claims.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};

use crate::error::NidoError;
use crate::state::VmStateRecord;

/// Return the first port in `start..=end` that is not reserved and on which a
/// loopback listener can be opened.
pub fn find_available_port(
    start: u16,
    end: u16,
    reserved: &HashSet<u16>,
) -> Result<u16, NidoError> {
    for port in start..=end {
        if port == 0 || reserved.contains(&port) {
            continue;
        }
        if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok() {
            tracing::debug!(port, "allocated host port");
            return Ok(port);
        }
    }
    Err(NidoError::PortsExhausted { start, end })
}

/// Ports recorded by every VM other than `except`.
pub fn reserved_ports<'a>(
    records: impl IntoIterator<Item = &'a VmStateRecord>,
    except: &str,
) -> HashSet<u16> {
    let mut reserved = HashSet::new();
    for record in records.into_iter().filter(|r| r.name != except) {
        if record.ssh_port != 0 {
            reserved.insert(record.ssh_port);
        }
        reserved.extend(record.vnc_port);
        reserved.extend(record.qmp_port);
    }
    reserved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn returns_bindable_port_in_range() {
        let start = free_port();
        let port = find_available_port(start, start.saturating_add(20), &HashSet::new()).unwrap();
        assert!(port >= start && port <= start.saturating_add(20));
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).expect("returned port is bindable");
    }

    #[test]
    fn skips_reserved_ports() {
        let start = free_port();
        let end = start.saturating_add(10);
        let reserved: HashSet<u16> = [start].into();
        let port = find_available_port(start, end, &reserved).unwrap();
        assert_ne!(port, start);
    }

    #[test]
    fn skips_ports_in_use() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = held.local_addr().unwrap().port();
        let err = find_available_port(busy, busy, &HashSet::new()).unwrap_err();
        assert!(matches!(err, NidoError::PortsExhausted { .. }));
    }

    #[test]
    fn fully_reserved_range_is_exhausted() {
        let start = free_port();
        let reserved: HashSet<u16> = [start].into();
        let err = find_available_port(start, start, &reserved).unwrap_err();
        assert!(matches!(err, NidoError::PortsExhausted { start: s, end: e } if s == start && e == start));
    }

    #[test]
    fn empty_range_is_exhausted() {
        assert!(find_available_port(6000, 5999, &HashSet::new()).is_err());
    }

    #[test]
    fn reserved_ports_excludes_self() {
        let mut a = VmStateRecord::new("a", "vmuser");
        a.ssh_port = 50022;
        a.vnc_port = Some(5900);
        let mut b = VmStateRecord::new("b", "vmuser");
        b.ssh_port = 50023;
        let reserved = reserved_ports([&a, &b], "b");
        assert_eq!(reserved, [50022, 5900].into());
    }
}
