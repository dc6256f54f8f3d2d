//! Loading settings and the persisted seed from disk.

use std::path::Path;

use anyhow::{bail, Context, Result};
use maplepilot_core::input::Seed;
use maplepilot_core::settings::Settings;
use tracing::{debug, info};

use crate::paths;

/// Load settings from a TOML file.
///
/// A missing file yields the defaults. A present but invalid file is an
/// error: silently running with defaults would press the wrong keys.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let settings = match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str::<Settings>(&text)
            .with_context(|| format!("Failed to parse settings file {:?}", path))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No settings file at {:?}, using defaults", path);
            Settings::default()
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read settings file {:?}", path));
        }
    };

    settings
        .validate()
        .with_context(|| format!("Invalid settings in {:?}", path))?;
    debug!("Loaded settings from {:?}", path);
    Ok(settings)
}

pub fn render_settings(settings: &Settings) -> Result<String> {
    toml::to_string_pretty(settings).context("Failed to serialize settings")
}

/// Read the seed at `path`, generating and persisting one on first run.
///
/// Returns the seed and whether it was newly created.
pub fn load_or_create_seed(path: &Path) -> Result<(Seed, bool)> {
    match std::fs::read_to_string(path) {
        Ok(text) => match Seed::from_hex(&text) {
            Some(seed) => Ok((seed, false)),
            None => bail!(
                "Seed file {:?} is corrupt; delete it to generate a new seed",
                path
            ),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let seed = Seed::random();
            if let Some(parent) = path.parent() {
                paths::ensure_private_dir(parent)
                    .with_context(|| format!("Failed to create data directory {:?}", parent))?;
            }
            std::fs::write(path, seed.to_hex())
                .with_context(|| format!("Failed to write seed file {:?}", path))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                    .with_context(|| format!("Failed to restrict seed file {:?}", path))?;
            }

            info!("Generated new seed at {:?}", path);
            Ok((seed, true))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read seed file {:?}", path)),
    }
}
