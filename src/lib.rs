pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod marc;
pub mod matchkey;
pub mod oai;
pub mod server;
pub mod storage;
