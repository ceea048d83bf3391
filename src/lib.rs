//! wpaudit: chunked upload intake and LLM-backed review of WordPress site
//! files.

pub mod analysis;
pub mod app;
pub mod client;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod scan;
pub mod store;
pub mod uploads;

pub use app::App;
pub use config::Config;
