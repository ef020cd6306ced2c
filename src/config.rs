use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid language: {0}. Must be 'EN' or 'CN'")]
    InvalidLocale(String),

    #[error("invalid match threshold: {0}")]
    InvalidThreshold(String),
}

/// Asset language variant. Each locale has its own directory of templates,
/// since most buttons carry localized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Locale {
    #[serde(rename = "EN")]
    En,
    #[serde(rename = "CN")]
    Cn,
}

impl Locale {
    pub fn dir_name(self) -> &'static str {
        match self {
            Locale::En => "EN",
            Locale::Cn => "CN",
        }
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for Locale {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "EN" | "en" => Ok(Locale::En),
            "CN" | "cn" => Ok(Locale::Cn),
            other => Err(ConfigError::InvalidLocale(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub assets_dir: PathBuf,
    pub locale: Locale,
    /// Substring matched against window titles to find the game client.
    pub window_title: String,
    pub listen_addr: String,
    /// When set, control requests must carry `Authorization: Bearer <token>`.
    pub auth_token: Option<String>,
    /// Acceptance threshold for the feature-based matchers.
    pub match_threshold: f32,
    pub debug: bool,
    /// Directory that receives every captured frame as PNG (off when `None`).
    pub debug_captures: Option<PathBuf>,
    /// JSON-lines file receiving one entry per finished battle round.
    pub battle_log: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assets_dir: PathBuf::from("assets"),
            locale: Locale::En,
            window_title: "AFK Journey".into(),
            listen_addr: "127.0.0.1:8091".into(),
            auth_token: None,
            match_threshold: crate::detector::DEFAULT_THRESHOLD,
            debug: false,
            debug_captures: None,
            battle_log: PathBuf::from("battle_log.jsonl"),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable source so parsing can be
    /// exercised without touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let locale = match lookup("AUTOBATTLE_LANGUAGE") {
            Some(v) => v.parse()?,
            None => defaults.locale,
        };

        let match_threshold = match lookup("AUTOBATTLE_MATCH_THRESHOLD") {
            Some(v) => {
                let t: f32 = v
                    .trim()
                    .parse()
                    .map_err(|e| ConfigError::InvalidThreshold(format!("{v}: {e}")))?;
                if !(t > 0.0 && t < 1.0) {
                    return Err(ConfigError::InvalidThreshold(format!(
                        "{v}: must be between 0 and 1"
                    )));
                }
                t
            }
            None => defaults.match_threshold,
        };

        let debug = lookup("AUTOBATTLE_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Config {
            assets_dir: lookup("AUTOBATTLE_ASSETS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.assets_dir),
            locale,
            window_title: lookup("AUTOBATTLE_WINDOW_TITLE").unwrap_or(defaults.window_title),
            listen_addr: lookup("AUTOBATTLE_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            auth_token: lookup("AUTOBATTLE_AUTH_TOKEN").filter(|t| !t.is_empty()),
            match_threshold,
            debug,
            debug_captures: lookup("AUTOBATTLE_DEBUG_CAPTURES").map(PathBuf::from),
            battle_log: lookup("AUTOBATTLE_BATTLE_LOG")
                .map(PathBuf::from)
                .unwrap_or(defaults.battle_log),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.locale, Locale::En);
        assert_eq!(config.window_title, "AFK Journey");
        assert_eq!(config.assets_dir, PathBuf::from("assets"));
        assert!(config.auth_token.is_none());
        assert!(config.debug_captures.is_none());
        assert!(!config.debug);
        assert!((config.match_threshold - 0.65).abs() < f32::EPSILON);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("AUTOBATTLE_LANGUAGE", "CN"),
            ("AUTOBATTLE_AUTH_TOKEN", "secret"),
            ("AUTOBATTLE_DEBUG", "true"),
            ("AUTOBATTLE_MATCH_THRESHOLD", "0.8"),
            ("AUTOBATTLE_DEBUG_CAPTURES", "/tmp/frames"),
        ]))
        .unwrap();
        assert_eq!(config.locale, Locale::Cn);
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert!(config.debug);
        assert!((config.match_threshold - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.debug_captures, Some(PathBuf::from("/tmp/frames")));
    }

    #[test]
    fn test_invalid_locale_rejected() {
        let err = Config::from_lookup(lookup_from(&[("AUTOBATTLE_LANGUAGE", "FR")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLocale(ref l) if l == "FR"));
        assert!(err.to_string().contains("Must be 'EN' or 'CN'"));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("AUTOBATTLE_MATCH_THRESHOLD", "abc")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("AUTOBATTLE_MATCH_THRESHOLD", "1.5")])).is_err());
    }

    #[test]
    fn test_empty_auth_token_is_disabled() {
        let config = Config::from_lookup(lookup_from(&[("AUTOBATTLE_AUTH_TOKEN", "")])).unwrap();
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_locale_parse_and_display() {
        assert_eq!("EN".parse::<Locale>().unwrap(), Locale::En);
        assert_eq!("cn".parse::<Locale>().unwrap(), Locale::Cn);
        assert_eq!(Locale::Cn.to_string(), "CN");
    }
}
