use std::collections::HashSet;
use std::net::TcpListener;

use crate::error::FleetError;

/// Find the first free port in the inclusive range, skipping ports in
/// `already_assigned` and ports bound by any process on the host.
///
/// The bind probe catches ports claimed outside this tool; the assigned set
/// lets a batch of concurrent spawns avoid each other before any of their
/// servers has started listening. The probe listener is dropped immediately,
/// releasing the port for the caller.
pub fn find_available_port(
    start: u16,
    end: u16,
    already_assigned: &HashSet<u16>,
) -> Result<u16, FleetError> {
    for port in start..=end {
        if already_assigned.contains(&port) {
            continue;
        }
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(FleetError::PortsExhausted { start, end })
}
