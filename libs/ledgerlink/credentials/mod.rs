//! Token lifecycle: fetch, cache, refresh ahead of expiry, persist.

pub mod manager;
pub mod store;

pub use manager::{
    CredentialManager, CredentialOptions, TokenFetcher, TokenRecord, DEFAULT_BUFFER_RATIO,
};
pub use store::{FileTokenStore, MemoryTokenStore, TokenStore};
