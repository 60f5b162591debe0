use std::path::{Path, PathBuf};

use tracing::debug;

use crate::schema::TeamchatRc;

const RC_FILENAME: &str = ".teamchatrc";
const RC_FILENAME_GLOBAL: &str = "teamchatrc.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Discover and load `.teamchatrc` from standard locations.
///
/// Search order:
/// 1. `./.teamchatrc` (project-local)
/// 2. `~/.config/teamchat/teamchatrc.json` (user-global)
///
/// Returns `TeamchatRc::default()` if no file is found.
pub fn discover_and_load() -> TeamchatRc {
    match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading teamchatrc");
            load(&path).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "failed to load teamchatrc, using defaults");
                TeamchatRc::default()
            })
        },
        None => {
            debug!("no teamchatrc found, using defaults");
            TeamchatRc::default()
        },
    }
}

/// Load a `.teamchatrc` file from an explicit path.
pub fn load(path: &Path) -> Result<TeamchatRc, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(RC_FILENAME);
    if local.exists() {
        return Some(local);
    }

    let global = config_dir()?.join(RC_FILENAME_GLOBAL);
    global.exists().then_some(global)
}

/// Returns the user-global config directory (`~/.config/teamchat/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "teamchat").map(|d| d.config_dir().to_path_buf())
}

/// Returns the path of an existing `.teamchatrc`, or the default
/// project-local path if none exists yet.
pub fn find_or_default_config_path() -> PathBuf {
    find_config_file().unwrap_or_else(|| PathBuf::from(RC_FILENAME))
}

/// Serialize `rc` to JSON and write it to `path`, creating parent
/// directories as needed.
pub fn save(rc: &TeamchatRc, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_string_pretty(rc).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "saved teamchatrc");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::schema::{ApiBlock, UserBlock};

    #[test]
    fn round_trips_through_json() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(".teamchatrc");

        let rc = TeamchatRc {
            user: Some(UserBlock {
                api: ApiBlock {
                    installation: "https://digitalcrew.teamwork.com".into(),
                    auth: secrecy::SecretString::from("tok-123".to_string()),
                },
            }),
            rooms: vec![],
            people: vec![],
        };
        save(&rc, &path).expect("save");

        let loaded = load(&path).expect("load");
        let user = loaded.user.expect("user block present");
        assert_eq!(user.api.installation, "https://digitalcrew.teamwork.com");
    }

    #[test]
    fn missing_file_is_not_an_error_for_discover() {
        let original = std::env::current_dir().expect("cwd");
        let dir = tempdir().expect("tempdir");
        std::env::set_current_dir(dir.path()).expect("chdir");
        let rc = discover_and_load();
        std::env::set_current_dir(original).expect("restore cwd");
        assert!(rc.user.is_none());
    }
}
