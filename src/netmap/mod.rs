pub mod host;
pub mod mac;
pub mod network_map;
pub mod port_info;
pub mod probes;
pub mod summary;

pub use host::*;
pub use mac::*;
pub use network_map::*;
pub use port_info::*;
pub use probes::*;
pub use summary::*;
