pub mod broker;
pub mod claims;
pub mod client;
pub mod codec;
pub mod connection;
pub mod isupport;
pub mod message;
pub mod nick;
pub mod pool;
pub mod reply;
pub mod scheduler;
pub mod transport;
