pub mod config;
pub mod sessions;

pub use config::{get_config, update_config};
pub use sessions::{close_session, list_sessions};
