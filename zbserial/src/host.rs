//! Host-side utilities for serial port discovery.

use crate::{
    natural::natural_cmp,
    port::{NativePortEnumerator, PortEnumerator},
};

/// Discover all serial ports on this host, naturally ordered and deduplicated.
#[must_use]
pub fn discover_ports() -> Vec<String> {
    discover_with::<NativePortEnumerator>()
}

/// Discover ports through a specific enumerator.
#[must_use]
pub fn discover_with<E: PortEnumerator>() -> Vec<String> {
    let ports = sort_ports(E::enumerate());
    log::debug!("Discovered {} serial port(s)", ports.len());
    ports
}

/// Natural sort followed by removal of adjacent duplicates.
#[must_use]
pub fn sort_ports(mut ports: Vec<String>) -> Vec<String> {
    ports.sort_by(|a, b| natural_cmp(a, b));
    ports.dedup();
    ports
}
