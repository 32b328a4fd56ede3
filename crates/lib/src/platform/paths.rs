//! Per-user default locations.

use std::env;
use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Default content cache: `$XDG_CACHE_HOME/kiln` on Unix and
/// `%LOCALAPPDATA%\kiln\cache` on Windows.
pub fn cache_dir() -> PathBuf {
  #[cfg(windows)]
  {
    local_app_data().join(APP_NAME).join("cache")
  }
  #[cfg(not(windows))]
  {
    xdg_dir("XDG_CACHE_HOME", &[".cache"]).join(APP_NAME)
  }
}

/// Default root for built artifacts: `$XDG_DATA_HOME/kiln/out` on Unix and
/// `%LOCALAPPDATA%\kiln\out` on Windows.
pub fn output_dir() -> PathBuf {
  #[cfg(windows)]
  {
    local_app_data().join(APP_NAME).join("out")
  }
  #[cfg(not(windows))]
  {
    xdg_dir("XDG_DATA_HOME", &[".local", "share"]).join(APP_NAME).join("out")
  }
}

#[cfg(not(windows))]
fn xdg_dir(var: &str, under_home: &[&str]) -> PathBuf {
  if let Some(dir) = env::var_os(var).filter(|dir| !dir.is_empty()) {
    return PathBuf::from(dir);
  }
  let home = env::var_os("HOME").map(PathBuf::from).unwrap_or_else(env::temp_dir);
  under_home.iter().fold(home, |dir, part| dir.join(part))
}

#[cfg(windows)]
fn local_app_data() -> PathBuf {
  env::var_os("LOCALAPPDATA")
    .map(PathBuf::from)
    .or_else(|| env::var_os("USERPROFILE").map(|home| PathBuf::from(home).join("AppData").join("Local")))
    .unwrap_or_else(env::temp_dir)
}
