/// Tracing subscriber setup for the binary.
pub mod logging;
/// TOML configuration with validation.
pub mod toml_config;
