pub mod client;
pub mod database;
pub mod memory;
pub mod store;

pub use client::DBClient;
pub use memory::MemoryStore;
pub use store::{StoreError, UnitOfWork, WithdrawalStore};
