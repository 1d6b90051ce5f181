pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod event_loop;
pub mod frame;
pub mod parser;
pub mod server;
pub mod store;

pub use config::Config;
pub use server::Server;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
