//! HTTP surface: the scrape endpoint and health reporting.

pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
