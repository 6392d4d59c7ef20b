//! vbus-state: persisted bus flags and service configuration

mod error;
pub use error::{Result, StateError, StoreError};

mod keys;
pub use keys::StateKey;

mod store;
pub use store::{Flags, JsonFileStore, MemoryStore, StateStore, StoredValue};

mod state;
pub use state::PersistedState;

mod config;
pub use config::{
    load_config, parse_number, CanConfig, DriverBackend, FilterConfig, J1708Config, VbsConfig,
};
