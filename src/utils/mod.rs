//! Shared helpers

pub mod net;
pub mod throttle;

pub use net::{bind_tcp_listener, bind_udp_socket, local_ip_addresses};
pub use throttle::LogThrottler;
