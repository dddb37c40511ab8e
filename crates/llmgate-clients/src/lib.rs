pub mod config;
pub mod store;

pub use config::ClientConfig;
pub use store::{
    extract_presented_key, ChainedStore, ClientStore, LegacyFlatStore, RemoteTableError,
    RemoteTableStore, StaticJsonStore,
};
