//! Persistence: the TOML application config and the JSON peer state files.

pub mod config;
pub mod peer_store;
