pub mod config;
pub mod error;
pub mod logger;
pub mod plugin;
pub mod process;
pub mod schema;

pub use cluster_ipc;
