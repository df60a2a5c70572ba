pub mod bridge;
pub mod config;
pub mod error;
pub mod message;
pub mod packet;
pub mod session;
pub mod test_util;
pub mod transport;
pub mod tun;

pub use error::{Result, TunnelError};
