use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use image::GrayImage;
use thiserror::Error;

use crate::config::{ConfigError, Locale};

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("template {name} not found at {}", .path.display())]
    NotFound { name: String, path: PathBuf },

    #[error("failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// A decoded UI icon for one locale.
#[derive(Debug)]
pub struct Template {
    pub locale: Locale,
    pub image: GrayImage,
}

/// Resolves `<root>/<locale>/<name>` and keeps decoded templates in memory.
pub struct AssetStore {
    root: PathBuf,
    locale: RwLock<Locale>,
    cache: Mutex<HashMap<(Locale, String), Arc<Template>>>,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>, locale: Locale) -> Self {
        Self {
            root: root.into(),
            locale: RwLock::new(locale),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn locale(&self) -> Locale {
        match self.locale.read() {
            Ok(l) => *l,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Switches the active locale; unsupported values are rejected here rather
    /// than at lookup time.
    pub fn set_locale(&self, value: &str) -> Result<Locale, ConfigError> {
        let locale: Locale = value.parse()?;
        match self.locale.write() {
            Ok(mut l) => *l = locale,
            Err(poisoned) => *poisoned.into_inner() = locale,
        }
        tracing::info!("asset language set to {locale}");
        Ok(locale)
    }

    pub fn resolve_path(&self, name: &str, locale: Locale) -> PathBuf {
        self.root.join(locale.dir_name()).join(name)
    }

    /// Loads `name` for the active locale, decoding it once per locale.
    pub fn load(&self, name: &str) -> Result<Arc<Template>, AssetError> {
        let locale = self.locale();
        let key = (locale, name.to_string());
        if let Some(hit) = self.cache_lock().get(&key) {
            return Ok(hit.clone());
        }

        let path = self.resolve_path(name, locale);
        if !path.is_file() {
            return Err(AssetError::NotFound {
                name: name.to_string(),
                path,
            });
        }
        let image = image::open(&path)
            .map_err(|source| AssetError::Decode {
                path: path.clone(),
                source,
            })?
            .to_luma8();
        tracing::debug!(
            "loaded template {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );

        let template = Arc::new(Template {
            locale,
            image,
        });
        self.cache_lock().insert(key, template.clone());
        Ok(template)
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, HashMap<(Locale, String), Arc<Template>>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
