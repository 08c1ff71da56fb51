pub mod commands;
pub mod config;
pub mod prompt_loader;
