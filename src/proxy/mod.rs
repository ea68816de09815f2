//! Proxy implementations: blind TCP forwarding and UDP-association relay.

pub mod tcp;
pub mod udp;

