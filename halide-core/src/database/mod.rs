//! Storage ports and their Postgres / in-memory implementations.

pub mod gateway;
pub mod memory;
pub mod postgres;

pub use gateway::{BatchStore, CatalogGateway, JobStore, NewImage, TagPrediction};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
