pub mod ai;
pub mod chat_server;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod handler;
pub mod profiles;
pub mod protocol;
pub mod server;
pub mod store;
pub mod types;
pub mod utils;
