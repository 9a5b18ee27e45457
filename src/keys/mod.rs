// src/keys/mod.rs
//
// The credential pool: per-service providers own their key records, the pool
// routes by target service, and a background checker per provider keeps
// capability sets and revocation flags current.

pub mod anthropic;
pub mod checker;
pub mod google;
pub mod openai;
pub mod pool;
pub mod provider;
pub mod record;
pub mod store;

pub use checker::KeyChecker;
pub use pool::KeyPool;
pub use provider::KeyProvider;
pub use record::{BoundKey, KeyPatch, KeyRecord, KeyView, Service};
