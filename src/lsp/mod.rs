pub mod client;
pub mod codec;
pub mod coords;
pub mod language;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod transcript;
