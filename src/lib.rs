pub mod config;
pub mod dispatch;
pub mod error;
pub mod media;
pub mod parsers;
pub mod providers;
pub mod response;
pub mod server;
pub mod tools;
