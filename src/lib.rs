pub mod config;
pub mod context;
pub mod dns_utils;
pub mod error;
pub mod plugins;
pub mod registry;
pub mod sequence;
pub mod server;
pub mod upstream;
pub mod watcher;
