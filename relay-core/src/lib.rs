pub mod auth;
pub mod channels;
pub mod connection;
pub mod directory;
pub mod exchange;
pub mod frame;
pub mod pool;
pub mod queue;
pub mod store;
pub mod transport;
