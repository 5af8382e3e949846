pub mod adapters;
pub mod catalog;
pub mod core;
pub mod fx;
pub mod mock;
pub mod stores;
pub mod vault;
