//! Configuration module.
//!
//! Settings are read from environment variables (optionally seeded from a
//! `.env` file) and validated once at startup.

mod settings;

pub use settings::Settings;
