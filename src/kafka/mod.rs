pub mod client;
pub mod rd;
pub mod zookeeper;
