use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default lifetime of an idle resumable upload, in seconds.
pub const DEFAULT_UPLOAD_VALID_DURATION: u64 = 60 * 60;

/// Default ceiling advertised through `Tus-Max-Size` (1 GB).
pub const DEFAULT_MAX_SIZE: u64 = 1024 * 1024 * 1024;

/// Resumable (tus) upload configuration.
///
/// Built once at startup. `enabled` is only true when the temp directory
/// exists, is a directory and is writable.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Resumable uploads are accepted
    pub enabled: bool,

    /// Directory receiving partial uploads
    pub tmp_file_dir: Option<PathBuf>,

    /// Hand finished uploads downstream as an open file handle instead of a path
    pub send_file: bool,

    /// Seconds an upload may stay idle before it is discarded (default: 3600)
    pub upload_valid_duration: u64,

    /// Largest `Upload-Length` accepted (default: 1 GB)
    pub max_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tmp_file_dir: None,
            send_file: false,
            upload_valid_duration: DEFAULT_UPLOAD_VALID_DURATION,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

impl UploadConfig {
    /// Load configuration from `TUS_*` environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        let requested = lookup("TUS_ENABLED").is_some_and(|v| !v.is_empty());

        let config = Self {
            enabled: requested,
            tmp_file_dir: lookup("TUS_TMP_FILE_DIR").map(PathBuf::from),
            send_file: lookup("TUS_SEND_FILE")
                .map(|v| parse_flag(&v))
                .unwrap_or(default.send_file),
            upload_valid_duration: lookup("TUS_UPLOAD_VALID_DURATION")
                .map(|v| parse_duration(&v))
                .unwrap_or(default.upload_valid_duration),
            max_size: lookup("TUS_MAX_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_size),
        };

        if requested {
            config.validated()
        } else {
            config
        }
    }

    /// Resumable uploads enabled in `dir`, subject to the same checks as
    /// the environment-driven path.
    pub fn enabled_in(dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            tmp_file_dir: Some(dir.into()),
            ..Self::default()
        }
        .validated()
    }

    /// Force the feature off unless the temp directory is usable.
    pub fn validated(mut self) -> Self {
        if !self.enabled {
            return self;
        }

        match self.tmp_file_dir.as_deref() {
            None => {
                warn!("TUS_ENABLED is set but no TUS_TMP_FILE_DIR is configured");
                self.enabled = false;
            }
            Some(dir) if !dir.is_dir() => {
                warn!("TUS_TMP_FILE_DIR {:?} does not point to a valid directory", dir);
                self.enabled = false;
            }
            Some(dir) if !is_writable(dir) => {
                warn!("TUS_TMP_FILE_DIR {:?} is not writable", dir);
                self.enabled = false;
            }
            Some(dir) => {
                info!("📦 tus upload support configured (tmp dir: {:?})", dir);
            }
        }

        self
    }

    pub fn valid_duration(&self) -> chrono::Duration {
        i64::try_from(self.upload_valid_duration)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Application configuration, read once in `main` and passed down.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub upload: UploadConfig,

    /// Maximum one-shot upload size in bytes (default: 1 GB)
    pub max_file_size: usize,

    /// Public base URL used for object URLs
    pub portal_url: String,

    /// Content types created through the schema-based factory
    pub schema_types: Vec<String>,

    /// Name of the folder uploads are collected in (default: "images")
    pub images_folder: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            upload: UploadConfig::default(),
            max_file_size: 1024 * 1024 * 1024, // 1 GB
            portal_url: "http://localhost:3000".to_string(),
            schema_types: vec!["File".to_string(), "Image".to_string()],
            images_folder: "images".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        Self {
            upload: UploadConfig::from_vars(&lookup),

            max_file_size: lookup("MAX_FILE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            portal_url: lookup("PORTAL_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(default.portal_url),

            schema_types: lookup("SCHEMA_CONTENT_TYPES")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(default.schema_types),

            images_folder: lookup("IMAGES_FOLDER_NAME")
                .filter(|v| !v.is_empty())
                .unwrap_or(default.images_folder),
        }
    }

    /// Create config for development (resumable uploads in the system temp dir)
    pub fn development() -> Self {
        Self {
            upload: UploadConfig::enabled_in(env::temp_dir()),
            ..Self::default()
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "t" | "true" | "1" | "on")
}

fn parse_duration(value: &str) -> u64 {
    value.trim().parse().unwrap_or(DEFAULT_UPLOAD_VALID_DURATION)
}

fn is_writable(dir: &Path) -> bool {
    tempfile::tempfile_in(dir).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = UploadConfig::default();
        assert!(!config.enabled);
        assert!(!config.send_file);
        assert_eq!(config.upload_valid_duration, 3600);
    }

    #[test]
    fn test_enabled_with_valid_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = UploadConfig::from_vars(vars(&[
            ("TUS_ENABLED", "1"),
            ("TUS_TMP_FILE_DIR", dir.path().to_str().unwrap()),
            ("TUS_SEND_FILE", "On"),
            ("TUS_UPLOAD_VALID_DURATION", "120"),
        ]));
        assert!(config.enabled);
        assert!(config.send_file);
        assert_eq!(config.upload_valid_duration, 120);
        assert_eq!(config.valid_duration(), chrono::Duration::seconds(120));
    }

    #[test]
    fn test_missing_tmp_dir_disables() {
        let config = UploadConfig::from_vars(vars(&[("TUS_ENABLED", "true")]));
        assert!(!config.enabled);
    }

    #[test]
    fn test_tmp_dir_not_a_directory_disables() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = UploadConfig::from_vars(vars(&[
            ("TUS_ENABLED", "true"),
            ("TUS_TMP_FILE_DIR", file.path().to_str().unwrap()),
        ]));
        assert!(!config.enabled);

        let config = UploadConfig::enabled_in("/definitely/not/here");
        assert!(!config.enabled);
    }

    #[test]
    fn test_non_numeric_duration_falls_back() {
        let config = UploadConfig::from_vars(vars(&[("TUS_UPLOAD_VALID_DURATION", "soon")]));
        assert_eq!(config.upload_valid_duration, DEFAULT_UPLOAD_VALID_DURATION);
    }

    #[test]
    fn test_flag_parsing() {
        for v in ["t", "TRUE", "1", "on"] {
            assert!(parse_flag(v), "{v}");
        }
        for v in ["f", "no", "0", "yes", ""] {
            assert!(!parse_flag(v), "{v}");
        }
    }

    #[test]
    fn test_app_config_schema_types() {
        let config = AppConfig::from_vars(vars(&[
            ("SCHEMA_CONTENT_TYPES", "File, ,Image,News Item"),
            ("PORTAL_URL", "https://cms.example.org/"),
        ]));
        assert_eq!(config.schema_types, vec!["File", "Image", "News Item"]);
        assert_eq!(config.portal_url, "https://cms.example.org");
        assert_eq!(config.images_folder, "images");
        assert!(!config.upload.enabled);
    }

    #[test]
    fn test_development_preset_enables_resumable() {
        let config = AppConfig::development();
        assert!(config.upload.enabled);
        assert_eq!(config.upload.tmp_file_dir.as_deref(), Some(env::temp_dir().as_path()));
    }
}
