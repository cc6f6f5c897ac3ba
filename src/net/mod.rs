//! Host-level network inventory: interface enumeration and name/address
//! lookup.

pub mod addrinfo;
pub mod ifaddrs;

pub use addrinfo::{addr, addrs, name};
pub use ifaddrs::{IfAddrs, Interface};
