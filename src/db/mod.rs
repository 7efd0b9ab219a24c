pub mod models;
pub mod server_store;
mod writer;

pub use server_store::{ServerStore, StoreError};
