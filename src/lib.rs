pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod mac;
pub mod options;
pub mod packet;
pub mod security;
pub mod server;
pub mod store;

pub use config::Config;
pub use engine::LeaseEngine;
pub use error::{Error, Result};
pub use handler::ProtocolHandler;
pub use mac::MacAddr;
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use security::SecurityValidator;
pub use server::DhcpServer;
pub use store::{Lease, LeaseStore};
