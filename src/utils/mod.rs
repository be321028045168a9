/// TOML configuration, validation and hot reloading.
pub mod toml_config;
