//! Forwarders (spec §4.C/D/E/F): the async-task side of every flow the network stack
//! announces, plus the host-forward listeners that run the same direction in reverse.

pub mod host_forward;
pub mod icmp;
pub mod tcp;
pub mod udp;
