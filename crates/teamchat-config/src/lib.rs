//! Discovery and persistence of the `.teamchatrc` credential cache.
//!
//! Searched in `./` then `~/.config/teamchat/`. The core client is handed
//! already-resolved installation/credential values and never reads this
//! file itself — it exists for the CLI and other external collaborators.

pub mod loader;
pub mod schema;

pub use {
    loader::{ConfigError, config_dir, discover_and_load, find_or_default_config_path, load, save},
    schema::{ApiBlock, TeamchatRc, UserBlock},
};
