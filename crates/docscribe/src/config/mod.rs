pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str, resolve_config_path, CONFIG_ENV_VAR};
pub use schema::{
    Config, ConversionConfig, InferenceConfig, LeaseConfig, ProofreadingConfig, StorageConfig,
    WorkerConfig,
};
