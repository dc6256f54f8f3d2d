//! Settings and data file path resolution.
//!
//! Priority for the config directory:
//! 1. `MAPLEPILOT_CONFIG_DIR` (explicit override)
//! 2. `<platform config dir>/maplepilot`
//! 3. `~/.maplepilot` (home directory fallback)
//! 4. `<temp>/maplepilot` (last resort)
//!
//! The data directory (where the seed lives) follows the same order with
//! `MAPLEPILOT_DATA_DIR` and the platform data dir.

use std::env;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "maplepilot";

fn env_dir(var: &str) -> Option<PathBuf> {
    env::var(var)
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
}

fn fallback_dir() -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        return home.join(".maplepilot");
    }
    env::temp_dir().join(APP_DIR)
}

/// Config directory with priority fallback. Empty env values are ignored.
pub fn get_config_dir() -> PathBuf {
    env_dir("MAPLEPILOT_CONFIG_DIR")
        .or_else(|| dirs::config_dir().map(|dir| dir.join(APP_DIR)))
        .unwrap_or_else(fallback_dir)
}

/// Data directory with priority fallback. Empty env values are ignored.
pub fn get_data_dir() -> PathBuf {
    env_dir("MAPLEPILOT_DATA_DIR")
        .or_else(|| dirs::data_dir().map(|dir| dir.join(APP_DIR)))
        .unwrap_or_else(fallback_dir)
}

/// Settings file: `--config`, then `MAPLEPILOT_CONFIG`, then
/// `settings.toml` in the config directory.
pub fn get_settings_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    env_dir("MAPLEPILOT_CONFIG").unwrap_or_else(|| get_config_dir().join("settings.toml"))
}

pub fn get_seed_path() -> PathBuf {
    get_data_dir().join("seed")
}

/// Create `dir` with owner-only permissions (0700 on Unix).
pub fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;

    // Env var manipulation is not thread-safe, so tests touching it run serially.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Saves and restores env vars, holding the mutex for its lifetime.
    pub(crate) struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
        _lock: std::sync::MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        pub(crate) fn new(var_names: &[&str]) -> Self {
            let lock = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), std::env::var(name).ok()))
                .collect();
            Self { vars, _lock: lock }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                // SAFETY: We hold ENV_MUTEX, so no other test thread is modifying env vars
                unsafe {
                    match value {
                        Some(v) => std::env::set_var(name, v),
                        None => std::env::remove_var(name),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_dir_explicit_override() {
        let _guard = EnvGuard::new(&["MAPLEPILOT_CONFIG_DIR"]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe { std::env::set_var("MAPLEPILOT_CONFIG_DIR", "/custom/config") };

        assert_eq!(get_config_dir(), PathBuf::from("/custom/config"));
    }

    #[test]
    fn test_config_dir_ignores_empty() {
        let _guard = EnvGuard::new(&["MAPLEPILOT_CONFIG_DIR"]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe { std::env::set_var("MAPLEPILOT_CONFIG_DIR", "") };

        let dir = get_config_dir();
        assert_ne!(dir, PathBuf::from(""));
        assert!(dir.to_string_lossy().contains("maplepilot"));
    }

    #[test]
    fn test_settings_path_priority() {
        let _guard = EnvGuard::new(&["MAPLEPILOT_CONFIG", "MAPLEPILOT_CONFIG_DIR"]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe {
            std::env::set_var("MAPLEPILOT_CONFIG", "/etc/mp.toml");
            std::env::set_var("MAPLEPILOT_CONFIG_DIR", "/cfg");
        }

        assert_eq!(
            get_settings_path(Some(Path::new("/cli/flag.toml"))),
            PathBuf::from("/cli/flag.toml")
        );
        assert_eq!(get_settings_path(None), PathBuf::from("/etc/mp.toml"));

        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe { std::env::remove_var("MAPLEPILOT_CONFIG") };
        assert_eq!(get_settings_path(None), PathBuf::from("/cfg/settings.toml"));
    }

    #[test]
    fn test_seed_path_in_data_dir() {
        let _guard = EnvGuard::new(&["MAPLEPILOT_DATA_DIR"]);
        // SAFETY: We hold ENV_MUTEX via _guard
        unsafe { std::env::set_var("MAPLEPILOT_DATA_DIR", "/var/lib/mp") };

        assert_eq!(get_seed_path(), PathBuf::from("/var/lib/mp/seed"));
    }

    #[test]
    fn test_ensure_private_dir_creates_nested() {
        let temp = tempfile::tempdir().unwrap();
        let nested = temp.path().join("a").join("b");
        ensure_private_dir(&nested).unwrap();
        assert!(nested.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&nested).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
