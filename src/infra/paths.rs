use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const STATE_ROOT_ENV: &str = "DERUN_STATE_ROOT";

const ROOT_DIR_NAME: &str = "derun";

#[derive(Debug, Error)]
pub enum ResolveStateRootError {
    #[error("home directory not found")]
    HomeDirNotFound,
}

pub fn resolve_state_root() -> Result<PathBuf, ResolveStateRootError> {
    resolve_state_root_from(
        env::var(STATE_ROOT_ENV).ok(),
        env::var("XDG_STATE_HOME").ok(),
        dirs::state_dir(),
        dirs::home_dir(),
    )
}

fn resolve_state_root_from(
    explicit: Option<String>,
    xdg_state_home: Option<String>,
    platform_state_dir: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Result<PathBuf, ResolveStateRootError> {
    if let Some(explicit) = non_empty(explicit) {
        return Ok(PathBuf::from(explicit));
    }
    if let Some(xdg) = non_empty(xdg_state_home) {
        return Ok(PathBuf::from(xdg).join(ROOT_DIR_NAME));
    }
    if let Some(state_dir) = platform_state_dir {
        return Ok(state_dir.join(ROOT_DIR_NAME));
    }
    let Some(home) = home else {
        return Err(ResolveStateRootError::HomeDirNotFound);
    };
    Ok(home.join(".local").join("state").join(ROOT_DIR_NAME))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Creates `path` (and parents) and restricts it to the owner.
pub fn ensure_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    set_private_mode(path, 0o700)
}

#[cfg(unix)]
pub fn set_private_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_private_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
