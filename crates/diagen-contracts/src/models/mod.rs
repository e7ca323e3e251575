mod registry;
mod selectors;

pub use registry::{list_available_models, ModelCatalog, ModelDescriptor};
pub use selectors::{ModelSelection, ModelSelector};
