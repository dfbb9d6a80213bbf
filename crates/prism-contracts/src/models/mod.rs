mod registry;
mod selectors;

pub use registry::{InputRule, Modality, ModelRegistry, ModelSpec};
pub use selectors::{ModelSelection, ModelSelector};
