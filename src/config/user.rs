//! User configuration loading for finx-socket.
//!
//! User config location: `<config dir>/finx/config.toml`, where the config
//! dir is `$XDG_CONFIG_HOME` when set and the platform default otherwise.

use std::path::{Path, PathBuf};

use super::settings::SettingsOverlay;
use crate::error::{ClientError, ClientResult};

/// Returns the path to the user configuration file.
///
/// Returns None if no configuration directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("finx").join("config.toml"));
    }
    dirs::config_dir().map(|dir| dir.join("finx").join("config.toml"))
}

/// Load settings from a TOML file.
///
/// A missing file at the default location is not an error; an explicitly
/// requested file that is missing is.
pub fn load_user_config(explicit: Option<&Path>) -> ClientResult<Option<SettingsOverlay>> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match user_config_path() {
            Some(path) => (path, false),
            None => return Ok(None),
        },
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            log::debug!(
                target: "finx_socket::config",
                "No user config at {}",
                path.display()
            );
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let overlay = toml::from_str::<SettingsOverlay>(&content).map_err(|e| {
        ClientError::config(format!("Failed to parse {}: {}", path.display(), e))
    })?;
    log::debug!(
        target: "finx_socket::config",
        "Loaded user config from {}",
        path.display()
    );
    Ok(Some(overlay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::io::Write;

    #[test]
    #[serial]
    fn user_config_path_uses_xdg_config_home_when_set() {
        let original = env::var("XDG_CONFIG_HOME").ok();

        // SAFETY: serialized with other env-mutating tests
        unsafe {
            env::set_var("XDG_CONFIG_HOME", "/custom/config");
        }

        let path = user_config_path();

        // SAFETY: restoring original env state
        unsafe {
            match original {
                Some(val) => env::set_var("XDG_CONFIG_HOME", val),
                None => env::remove_var("XDG_CONFIG_HOME"),
            }
        }

        assert_eq!(path, Some(PathBuf::from("/custom/config/finx/config.toml")));
    }

    #[test]
    fn explicit_config_file_is_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "api_key = \"abc\"\napi_url = \"https://finx.example.com\"\nrequest_timeout_secs = 30"
        )
        .unwrap();

        let overlay = load_user_config(Some(file.path())).unwrap().unwrap();
        assert_eq!(overlay.api_key.as_deref(), Some("abc"));
        assert_eq!(overlay.request_timeout_secs, Some(30));
        assert_eq!(overlay.payload_size_threshold, None);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_user_config(Some(&missing)).is_err());
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api_key = ").unwrap();
        let err = load_user_config(Some(file.path())).unwrap_err();
        assert!(matches!(err, ClientError::Config { .. }));
    }
}
