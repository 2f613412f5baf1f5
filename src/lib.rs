// Library exports for packet-lens
pub mod analysis;
pub mod broadcast;
pub mod capture;
pub mod config;
pub mod session;
pub mod supervisor;
pub mod utils;

pub use analysis::{header_parser, protocols};
pub use broadcast::hub;
pub use capture::pcap_engine;
pub use config::settings;
pub use supervisor::{ShutdownReport, Supervisor, SupervisorError};
pub use utils::formatting;

// Error types
pub use anyhow::Result;
