#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod config;
pub mod error;
pub mod socket;
pub mod transport;

pub use config::ConnectionConfig;
pub use error::Error;
pub use socket::{ChannelInfo, Connection, RegistryView, SoleSocket};
pub use transport::{Ack, Channel, SocketEvent, SocketState, Transport, WsTransport};

pub type Result<T> = std::result::Result<T, Error>;
