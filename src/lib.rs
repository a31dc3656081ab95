pub mod api;
pub mod authenticator;
pub mod caveat;
pub mod challenger;
pub mod config;
pub mod error;
pub mod invoice_tracker;
pub mod lnd;
pub mod mint;
pub mod satisfier;
pub mod secret_store;
pub mod upstream;
