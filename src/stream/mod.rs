pub mod buffer;
pub mod clock;
pub mod connection;
pub mod core;
pub mod lifecycle;
pub mod persistence;
pub mod pipeline;
pub mod scheduler;
pub mod transport;
pub mod types;
