pub mod ack;
pub mod config;
pub mod connection;
pub mod driver;
pub mod reliability;
pub mod stream;
pub mod tls;
pub mod types;

pub use config::{Config, Event};
pub use connection::Connection;
pub use driver::Driver;
pub use types::{ConnectionState, Role};
