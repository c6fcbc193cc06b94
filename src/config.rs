//! Optional TOML configuration from the platform config directory.
//! Missing or unparsable files fall back to defaults; a bad config is never
//! fatal for a navigator.

use std::fs;

use serde::Deserialize;

#[derive(Default, Deserialize)]
struct RawConfig {
    show_hidden: Option<bool>,
    preview: Option<bool>,
    tick_ms: Option<u64>,
}

#[derive(Clone)]
pub struct Config {
    pub show_hidden: bool,
    pub preview: bool,
    pub tick_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            show_hidden: false,
            preview: true,
            tick_ms: 150,
        }
    }
}

pub fn load_config() -> Config {
    let mut config = Config::default();
    if let Some(mut dir) = dirs::config_dir() {
        dir.push("treeline");
        let path = dir.join("config.toml");
        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    if let Some(show_hidden) = raw.show_hidden {
                        config.show_hidden = show_hidden;
                    }
                    if let Some(preview) = raw.preview {
                        config.preview = preview;
                    }
                    if let Some(tick_ms) = raw.tick_ms {
                        config.tick_ms = tick_ms.max(16);
                    }
                }
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                }
            }
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_hide_dotfiles_and_show_preview() {
        let config = Config::default();
        assert!(!config.show_hidden);
        assert!(config.preview);
        assert_eq!(config.tick_ms, 150);
    }

    #[test]
    fn partial_config_keeps_defaults_for_missing_fields() {
        let raw: RawConfig = toml::from_str("show_hidden = true").unwrap();
        let mut config = Config::default();
        if let Some(show_hidden) = raw.show_hidden {
            config.show_hidden = show_hidden;
        }
        assert!(config.show_hidden);
        assert!(raw.preview.is_none());
        assert!(raw.tick_ms.is_none());
    }
}
