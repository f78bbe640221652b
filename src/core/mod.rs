pub mod app_state;
pub mod settings;

pub use app_state::{DepotContext, ModelEntry, ModelStatus};
pub use settings::{Settings, SettingsManager};
