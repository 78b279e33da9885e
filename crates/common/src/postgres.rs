mod client;
mod config;
mod device_repository;
mod error;
mod reading_repository;
mod schema;

pub use client::*;
pub use config::*;
pub use device_repository::*;
pub use reading_repository::*;
pub use schema::*;
