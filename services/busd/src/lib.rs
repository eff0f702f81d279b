// busd: Library entry point.
// Exposes the config loader for the integration suites.

pub mod config;
pub mod logging;
