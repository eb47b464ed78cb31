pub mod capture;
pub mod config;
pub mod error;
pub mod handshake;
pub mod logger;
pub mod netmap;
pub mod runtime;
pub mod scan_manager;
pub mod store;

pub use config::Config;
pub use error::{CaptureError, ScanError, StoreError};
pub use scan_manager::{ScanManager, ScanPhase};
pub use store::Store;
