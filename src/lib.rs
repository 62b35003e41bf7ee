pub mod config;
pub mod controller;
pub mod identity_db;
pub mod log_sink;
pub mod marker;
pub mod parse_mounts;
pub mod privdrop;
pub mod remap;
pub mod utils;
pub mod walk;
