use std::{env, path::PathBuf, str::FromStr};

use anyhow::{Context, Result};

pub const DEFAULT_MODEL_PATH: &str = "./model/frozen_graph.pb";

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
    pub upload_dir: PathBuf,
    pub result_dir: PathBuf,
    pub history_file: PathBuf,
    pub users_file: PathBuf,
    pub sample_path: PathBuf,
    pub sample_url: Option<String>,
    pub cors_origins: Vec<String>,
    pub anomaly_threshold: f64,
    #[cfg_attr(not(feature = "tensorflow"), allow(dead_code))]
    pub model_path: PathBuf,
    #[cfg_attr(not(feature = "tensorflow"), allow(dead_code))]
    pub model_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            body_limit_bytes: 16 * 1024 * 1024,
            upload_dir: PathBuf::from("uploads"),
            result_dir: PathBuf::from("results"),
            history_file: PathBuf::from("history.json"),
            users_file: PathBuf::from("users.json"),
            sample_path: PathBuf::from("sample_data").join("sample_data.zip"),
            sample_url: None,
            cors_origins: vec!["*".into()],
            anomaly_threshold: 0.01,
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            model_url: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let path = |key: &str, default: PathBuf| get(key).map(PathBuf::from).unwrap_or(default);

        let body_limit_mb: usize = parse_or(get("BODY_LIMIT_MB"), "BODY_LIMIT_MB", 16)?;
        let cors_origins = match get("CORS_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(String::from)
                .collect(),
            None => defaults.cors_origins,
        };

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or(get("PORT"), "PORT", defaults.port)?,
            body_limit_bytes: body_limit_mb * 1024 * 1024,
            upload_dir: path("UPLOAD_DIR", defaults.upload_dir),
            result_dir: path("RESULT_DIR", defaults.result_dir),
            history_file: path("HISTORY_FILE", defaults.history_file),
            users_file: path("USERS_FILE", defaults.users_file),
            sample_path: path("SAMPLE_DATA_PATH", defaults.sample_path),
            sample_url: get("SAMPLE_DATA_URL"),
            cors_origins,
            anomaly_threshold: parse_or(
                get("ANOMALY_THRESHOLD"),
                "ANOMALY_THRESHOLD",
                defaults.anomaly_threshold,
            )?,
            model_path: path("MODEL_PATH", defaults.model_path),
            model_url: get("MODEL_URL"),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value: {value:?}")),
        None => Ok(default),
    }
}
