use std::{env, fs, path::PathBuf};

use thiserror::Error;

pub const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "dcm"];
pub const DEFAULT_CLASS_NAMES: [&str; 8] = ["AMD", "CNV", "CSR", "DME", "DR", "DRUSEN", "MH", "NORMAL"];

const DEFAULT_MODEL_PATH: &str = "./model/frozen_graph.pb";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("failed to read class list {}: {source}", path.display())]
    ClassList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("class list is empty")]
    NoClasses,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub body_limit_bytes: usize,
    pub upload_dir: PathBuf,
    pub results_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub allowed_extensions: Vec<String>,
    pub model_path: PathBuf,
    pub model_url: Option<String>,
    pub input_operation: String,
    pub output_operation: String,
    pub class_names: Vec<String>,
    /// Public base URL used when building absolute links. Detected per request when unset.
    pub server_base_url: Option<String>,
    pub cors_allow_all: bool,
    pub preload_model: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = match var("PORT") {
            Some(v) => v.parse::<u16>().map_err(|_| ConfigError::Invalid {
                key: "PORT",
                expected: "a valid number between 0 and 65535",
                value: v,
            })?,
            None => 5000,
        };

        let body_limit_bytes = {
            let mb = match var("BODY_LIMIT_MB") {
                Some(v) => v.parse::<usize>().map_err(|_| ConfigError::Invalid {
                    key: "BODY_LIMIT_MB",
                    expected: "a valid integer",
                    value: v,
                })?,
                None => 10,
            };
            mb * 1024 * 1024
        };

        let class_names = match (var("CLASS_LIST_PATH"), var("CLASS_NAMES")) {
            (Some(path), _) => {
                let path = PathBuf::from(path);
                let contents = fs::read_to_string(&path)
                    .map_err(|source| ConfigError::ClassList { path, source })?;
                parse_class_names(contents.lines())
            }
            (None, Some(names)) => parse_class_names(names.split(',')),
            (None, None) => DEFAULT_CLASS_NAMES.iter().map(|s| s.to_string()).collect(),
        };
        if class_names.is_empty() {
            return Err(ConfigError::NoClasses);
        }

        Ok(Config {
            port,
            body_limit_bytes,
            upload_dir: var("UPLOAD_FOLDER").unwrap_or_else(|| "uploads".into()).into(),
            results_dir: var("RESULTS_FOLDER").unwrap_or_else(|| "results".into()).into(),
            reports_dir: var("REPORTS_FOLDER").unwrap_or_else(|| "reports".into()).into(),
            allowed_extensions: ALLOWED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            model_path: var("MODEL_PATH").unwrap_or_else(|| DEFAULT_MODEL_PATH.into()).into(),
            model_url: var("MODEL_URL"),
            input_operation: var("MODEL_INPUT_OP").unwrap_or_else(|| "x".into()),
            output_operation: var("MODEL_OUTPUT_OP").unwrap_or_else(|| "Identity".into()),
            class_names,
            server_base_url: var("SERVER_BASE_URL"),
            cors_allow_all: parse_flag("CORS_ALLOW_ALL", var("CORS_ALLOW_ALL"), true)?,
            preload_model: parse_flag("PRELOAD_MODEL", var("PRELOAD_MODEL"), true)?,
        })
    }
}

fn parse_class_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    names
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(key: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            expected: "a boolean",
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.body_limit_bytes, 10 * 1024 * 1024);
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.results_dir, PathBuf::from("results"));
        assert_eq!(config.reports_dir, PathBuf::from("reports"));
        assert_eq!(config.class_names, DEFAULT_CLASS_NAMES);
        assert_eq!(config.allowed_extensions, ALLOWED_EXTENSIONS);
        assert_eq!(config.input_operation, "x");
        assert_eq!(config.output_operation, "Identity");
        assert!(config.server_base_url.is_none());
        assert!(config.cors_allow_all);
        assert!(config.preload_model);
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("BODY_LIMIT_MB", "2"),
            ("UPLOAD_FOLDER", "/data/up"),
            ("CLASS_NAMES", "NORMAL, DME ,,CNV"),
            ("SERVER_BASE_URL", "https://oct.example.org/"),
            ("PRELOAD_MODEL", "false"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.body_limit_bytes, 2 * 1024 * 1024);
        assert_eq!(config.upload_dir, PathBuf::from("/data/up"));
        assert_eq!(config.class_names, ["NORMAL", "DME", "CNV"]);
        assert_eq!(config.server_base_url.as_deref(), Some("https://oct.example.org/"));
        assert!(!config.preload_model);
    }

    #[test]
    fn class_list_file_takes_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "A\nB\n\nC").unwrap();
        let path = file.path().to_string_lossy().to_string();
        let config = config_from(&[("CLASS_LIST_PATH", path.as_str()), ("CLASS_NAMES", "X,Y")]).unwrap();
        assert_eq!(config.class_names, ["A", "B", "C"]);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            config_from(&[("PORT", "seventy")]),
            Err(ConfigError::Invalid { key: "PORT", .. })
        ));
        assert!(matches!(
            config_from(&[("CORS_ALLOW_ALL", "maybe")]),
            Err(ConfigError::Invalid { key: "CORS_ALLOW_ALL", .. })
        ));
        assert!(matches!(config_from(&[("CLASS_NAMES", " , ")]), Err(ConfigError::NoClasses)));
        assert!(matches!(
            config_from(&[("CLASS_LIST_PATH", "/nonexistent/classes.txt")]),
            Err(ConfigError::ClassList { .. })
        ));
    }
}
