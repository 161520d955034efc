use std::path::PathBuf;

use tokio::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_ARTIFACT_PREFIX: &str = "ytmp3";
pub const DEFAULT_ARTIFACT_MAX_AGE_SECONDS: u64 = 60 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 10 * 60;
pub const DEFAULT_DOWNLOAD_GRACE_MS: u64 = 1_000;
pub const DEFAULT_EXTRACTION_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_METADATA_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";

/// Runtime settings, resolved once at startup from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub public_host: String,
    pub artifact_dir: PathBuf,
    pub artifact_prefix: String,
    pub artifact_max_age: Duration,
    /// `None` disables the periodic sweep; the startup sweep always runs.
    pub sweep_interval: Option<Duration>,
    pub download_grace: Duration,
    pub yt_dlp_bin: String,
    pub extraction_timeout: Duration,
    pub metadata_timeout: Duration,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = resolve_bind_addr(&lookup);
        let public_host = lookup("PUBLIC_HOST")
            .as_deref()
            .and_then(non_empty)
            .map(ToString::to_string)
            .unwrap_or_else(|| public_host_for(&bind_addr));

        let artifact_dir = lookup("ARTIFACT_DIR")
            .as_deref()
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("yt-mp3-gateway"));
        let artifact_prefix = lookup("ARTIFACT_PREFIX")
            .as_deref()
            .and_then(non_empty)
            .filter(|value| is_valid_prefix(value))
            .unwrap_or(DEFAULT_ARTIFACT_PREFIX)
            .to_string();

        let sweep_interval_seconds = read_u64(&lookup, "SWEEP_INTERVAL_SECONDS")
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECONDS);

        let allowed_origins = lookup("ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Self {
            bind_addr,
            public_host,
            artifact_dir,
            artifact_prefix,
            artifact_max_age: Duration::from_secs(
                read_u64(&lookup, "ARTIFACT_MAX_AGE_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_ARTIFACT_MAX_AGE_SECONDS),
            ),
            sweep_interval: (sweep_interval_seconds > 0)
                .then(|| Duration::from_secs(sweep_interval_seconds)),
            download_grace: Duration::from_millis(
                read_u64(&lookup, "DOWNLOAD_GRACE_MS").unwrap_or(DEFAULT_DOWNLOAD_GRACE_MS),
            ),
            yt_dlp_bin: lookup("YT_DLP_BIN")
                .as_deref()
                .and_then(non_empty)
                .unwrap_or(DEFAULT_YT_DLP_BIN)
                .to_string(),
            extraction_timeout: Duration::from_secs(
                read_u64(&lookup, "EXTRACTION_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_EXTRACTION_TIMEOUT_SECONDS),
            ),
            metadata_timeout: Duration::from_secs(
                read_u64(&lookup, "METADATA_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_METADATA_TIMEOUT_SECONDS),
            ),
            trust_proxy_headers: read_bool(&lookup, "TRUST_PROXY_HEADERS").unwrap_or(false),
            allowed_origins,
        }
    }
}

fn resolve_bind_addr<F>(lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(configured) = lookup("APP_ADDR")
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
    {
        return configured;
    }

    let port = lookup("PORT")
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("0.0.0.0:{port}")
}

fn public_host_for(bind_addr: &str) -> String {
    match bind_addr.rsplit_once(':') {
        Some(("0.0.0.0" | "[::]", port)) => format!("localhost:{port}"),
        _ => bind_addr.to_string(),
    }
}

// The prefix ends up in file names and in the `_`-separated key scheme.
fn is_valid_prefix(value: &str) -> bool {
    value
        .chars()
        .all(|character| character.is_ascii_alphanumeric() || character == '-')
}

fn read_bool<F>(lookup: &F, name: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(name)?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u64<F>(lookup: &F, name: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).and_then(|value| value.trim().parse::<u64>().ok())
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_with(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = config_with(&[]);

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.public_host, "localhost:8080");
        assert_eq!(config.artifact_prefix, "ytmp3");
        assert_eq!(config.artifact_max_age, Duration::from_secs(3600));
        assert_eq!(config.sweep_interval, Some(Duration::from_secs(600)));
        assert_eq!(config.download_grace, Duration::from_secs(1));
        assert_eq!(config.extraction_timeout, Duration::from_secs(60));
        assert_eq!(config.metadata_timeout, Duration::from_secs(10));
        assert_eq!(config.yt_dlp_bin, "yt-dlp");
        assert!(!config.trust_proxy_headers);
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn port_and_app_addr() {
        assert_eq!(config_with(&[("PORT", "3000")]).bind_addr, "0.0.0.0:3000");
        assert_eq!(config_with(&[("PORT", "nope")]).bind_addr, "0.0.0.0:8080");

        let config = config_with(&[("APP_ADDR", "127.0.0.1:9000"), ("PORT", "3000")]);
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.public_host, "127.0.0.1:9000");
    }

    #[test]
    fn sweep_interval_zero_disables_periodic_sweep() {
        let config = config_with(&[("SWEEP_INTERVAL_SECONDS", "0")]);
        assert_eq!(config.sweep_interval, None);
    }

    #[test]
    fn rejects_prefix_that_would_break_the_key_scheme() {
        assert_eq!(
            config_with(&[("ARTIFACT_PREFIX", "my_prefix")]).artifact_prefix,
            "ytmp3"
        );
        assert_eq!(
            config_with(&[("ARTIFACT_PREFIX", "audio-cache")]).artifact_prefix,
            "audio-cache"
        );
    }

    #[test]
    fn parses_flags_and_origin_list() {
        let config = config_with(&[
            ("TRUST_PROXY_HEADERS", "yes"),
            ("ALLOWED_ORIGINS", "https://a.example, ,https://b.example"),
        ]);

        assert!(config.trust_proxy_headers);
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }
}
