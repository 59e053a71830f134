pub mod allocator;
pub mod types;

pub use allocator::{
    PortAllocator, find_available_ports, find_port_pairs, find_port_sets, is_port_available,
};
pub use types::{PortError, PortPair, VncPorts};
