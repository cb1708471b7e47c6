//! Persistent class hierarchy tables and their client/server synchronization.

pub mod class_info;
pub mod client;
pub mod server;
pub mod table;

pub use class_info::{ChTableUpdate, PersistentClassInfo, SerializedClassInfo};
pub use client::ClientChTable;
pub use server::ServerChTable;
pub use table::PersistentChTable;
