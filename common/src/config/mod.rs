mod file;

pub use file::{
    expand_path, load_config, DatabaseSection, OrchestratorSection, StorageSection, ToolConfig,
};
