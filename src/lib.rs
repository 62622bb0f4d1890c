pub mod channel;
pub mod config;
pub mod constants;
pub mod error;
pub mod maze;
pub mod protocol;
pub mod questions;
pub mod registry;
pub mod rng;
pub mod server;
pub mod session;
pub mod types;
pub mod visibility;
