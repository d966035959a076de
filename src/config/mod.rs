//! Configuration management
//!
//! Node tunables: listen host, mining and difficulty parameters, chain selection,
//! protocol limits. Loaded from defaults, a TOML file, or `PEERCHAIN_*` variables.

pub mod settings;

pub use settings::{ChainSelection, NodeConfig, GLOBAL_CONFIG};
