pub mod app;
pub mod cache;
pub mod config;
pub mod helper;
pub mod http;
pub mod modules;
pub mod sqlite;
