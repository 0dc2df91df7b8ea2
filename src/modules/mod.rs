// Data Module
pub mod cache;
pub mod store;

// Route Module
pub mod health;
pub mod page;
pub mod visit;
