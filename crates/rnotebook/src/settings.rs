//! User settings for the kernel bridge.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/rnotebook/settings.json
//! - Linux: ~/.config/rnotebook/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\rnotebook\settings.json
//!
//! `RNOTEBOOK_R_PATH` overrides the interpreter path from the file.

use anyhow::Result;
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `r_path`.
pub const R_PATH_ENV: &str = "RNOTEBOOK_R_PATH";

/// Settings for launching R and running notebooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Interpreter binary, resolved through PATH when not absolute
    pub r_path: PathBuf,

    /// Flags passed before the bridge script
    #[serde(deserialize_with = "deserialize_arg_list")]
    pub r_args: Vec<String>,

    /// Locale forced on the interpreter (LC_ALL and LANG)
    pub locale: String,

    /// How long to wait for the interpreter to connect back
    pub connect_timeout_secs: u64,

    /// Stop "run all" at the first cell that fails
    pub stop_on_error: bool,

    /// Chunk language evaluated by the kernel
    pub target_language: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            r_path: PathBuf::from(if cfg!(windows) { "R.exe" } else { "R" }),
            r_args: vec![
                "--quiet".to_string(),
                "--slave".to_string(),
                "--no-save".to_string(),
                "--no-restore".to_string(),
            ],
            locale: "en_US.UTF-8".to_string(),
            connect_timeout_secs: 30,
            stop_on_error: false,
            target_language: "r".to_string(),
        }
    }
}

impl Settings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn apply_env_overrides(self) -> Self {
        self.with_r_path_override(std::env::var(R_PATH_ENV).ok().as_deref())
    }

    /// Blank values leave the configured path alone.
    fn with_r_path_override(mut self, path: Option<&str>) -> Self {
        if let Some(path) = path.map(str::trim).filter(|p| !p.is_empty()) {
            self.r_path = PathBuf::from(path);
        }
        self
    }
}

/// Deserialize an argument list that accepts both:
/// - a single string: `"--quiet --no-save"` (whitespace-separated)
/// - a JSON array: `["--quiet", "--no-save"]`
fn deserialize_arg_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct ArgListVisitor;

    impl<'de> de::Visitor<'de> for ArgListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Vec<String>, E> {
            Ok(v.split_whitespace().map(|s| s.to_string()).collect())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Vec<String>, A::Error> {
            let mut items = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                let trimmed = item.trim().to_string();
                if !trimmed.is_empty() {
                    items.push(trimmed);
                }
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(ArgListVisitor)
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rnotebook")
        .join("settings.json")
}

/// Load settings from the default location, falling back to defaults.
pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

/// Load settings from `path`. A missing file yields defaults; a malformed one
/// is reported and also yields defaults.
pub fn load_settings_from(path: &Path) -> Settings {
    let settings = match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<Settings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("[settings] Ignoring malformed {:?}: {}", path, e);
                Settings::default()
            }
        },
        Err(_) => Settings::default(),
    };
    settings.apply_env_overrides()
}

/// Save settings to disk
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.locale, "en_US.UTF-8");
        assert_eq!(settings.target_language, "r");
        assert_eq!(settings.connect_timeout(), Duration::from_secs(30));
        assert!(settings.r_args.contains(&"--no-save".to_string()));
        assert!(!settings.stop_on_error);
    }

    #[test]
    fn test_settings_serde() {
        let settings = Settings {
            r_path: PathBuf::from("/opt/R/bin/R"),
            stop_on_error: true,
            ..Default::default()
        };

        let json = serde_json::to_string(&settings).unwrap();
        let parsed: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_deserialize_args_as_string() {
        let json = r#"{"r_args": "--vanilla  --quiet"}"#;
        let parsed: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.r_args, vec!["--vanilla", "--quiet"]);
    }

    #[test]
    fn test_deserialize_args_as_array() {
        let json = r#"{"r_args": ["--vanilla", " ", "--quiet"]}"#;
        let parsed: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.r_args, vec!["--vanilla", "--quiet"]);
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let parsed: Settings = serde_json::from_str(r#"{"connect_timeout_secs": 5}"#).unwrap();
        assert_eq!(parsed.connect_timeout_secs, 5);
        assert_eq!(parsed.locale, "en_US.UTF-8");
    }

    #[test]
    fn test_load_missing_and_malformed_files() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = load_settings_from(&tmp.path().join("nope.json"));
        assert_eq!(missing.connect_timeout_secs, 30);

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        let loaded = load_settings_from(&bad);
        assert_eq!(loaded.connect_timeout_secs, 30);
    }

    #[test]
    fn test_save_then_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("settings.json");
        let settings = Settings {
            connect_timeout_secs: 3,
            ..Default::default()
        };
        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path).connect_timeout_secs, 3);
    }

    #[test]
    fn test_r_path_override() {
        let configured = Settings {
            r_path: PathBuf::from("/opt/R/bin/R"),
            ..Default::default()
        };
        assert_eq!(
            configured.clone().with_r_path_override(Some(" /usr/local/bin/R ")).r_path,
            PathBuf::from("/usr/local/bin/R")
        );
        assert_eq!(
            configured.clone().with_r_path_override(Some("  ")).r_path,
            PathBuf::from("/opt/R/bin/R")
        );
        assert_eq!(
            configured.with_r_path_override(None).r_path,
            PathBuf::from("/opt/R/bin/R")
        );
    }

    #[test]
    fn test_load_applies_env_override() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("settings.json");
        std::fs::write(&path, r#"{"r_path": "/opt/R/bin/R", "connect_timeout_secs": 7}"#).unwrap();

        std::env::set_var(R_PATH_ENV, "/env/bin/R");
        let loaded = load_settings_from(&path);
        std::env::remove_var(R_PATH_ENV);

        assert_eq!(loaded.r_path, PathBuf::from("/env/bin/R"));
        assert_eq!(loaded.connect_timeout_secs, 7);
    }

    #[test]
    fn test_settings_path_is_valid() {
        let path = settings_path();
        assert!(path.ends_with("rnotebook/settings.json"));
    }
}
