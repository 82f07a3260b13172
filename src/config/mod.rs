// Configuration module
// Public interface for configuration loading

mod loader;
mod settings;

pub use loader::{default_config_path, load_config, load_config_from_str};
pub use settings::{
    CheckpointSettings, DataSettings, DeviceSettings, DistributedSettings, LoraSettings,
    ModelFamily, ModelSettings, TaskConfig, TrackingSettings, TrainingSettings, ValSetSize,
    NO_ADAPTER,
};
