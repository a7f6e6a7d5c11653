//! Local network helpers shared by the port mapping engines: enumerating
//! local IPv4 addresses and a small UDP socket wrapper. Deliberately
//! IPv4-only and non-monitoring, since that's all a port mapping client
//! needs.

pub mod interfaces;
mod udp;

pub use interfaces::{LocalAddressProvider, SystemAddressProvider};
pub use udp::UdpSocket;
