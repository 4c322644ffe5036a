/// Monitor Configuration
///
/// Loaded from helmet-watch.toml (working directory) with env-var overrides.
/// Env format: HELMET_WATCH__SECTION__KEY (double underscore separators).
///
/// Loaded once in `main` and handed to components as `Arc<AppConfig>`.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub id: String,
    /// Device index ("0"), image directory, or stream URL (rtsp/http).
    pub url: String,
    /// Fixed human-readable location; skips the IP lookup when set.
    #[serde(default)]
    pub location: Option<String>,
}

impl SourceConfig {
    /// Parse the CLI form `ID=URL`.
    pub fn parse_cli(arg: &str) -> Result<Self, ConfigError> {
        let (id, url) = arg
            .split_once('=')
            .filter(|(id, url)| !id.is_empty() && !url.is_empty())
            .ok_or_else(|| ConfigError::Invalid(format!("expected ID=URL, got '{}'", arg)))?;
        Ok(Self {
            id: id.to_string(),
            url: url.to_string(),
            location: None,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_class_names")]
    pub class_names: Vec<String>,
    #[serde(default = "default_alert_label")]
    pub alert_label: String,
}

fn default_model_path() -> String {
    "models/helmet-yolov8.onnx".to_string()
}
fn default_confidence_threshold() -> f32 {
    0.50
}
fn default_nms_threshold() -> f32 {
    0.45
}
fn default_input_size() -> u32 {
    640
}
fn default_class_names() -> Vec<String> {
    vec!["helmet".to_string(), "nohelmet".to_string()]
}
fn default_alert_label() -> String {
    "nohelmet".to_string()
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            confidence_threshold: default_confidence_threshold(),
            nms_threshold: default_nms_threshold(),
            input_size: default_input_size(),
            class_names: default_class_names(),
            alert_label: default_alert_label(),
        }
    }
}

/// Which checks an alert must pass before it is admitted.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleStrategy {
    /// Time window per source only.
    Cooldown,
    /// Content hash only.
    Fingerprint,
    #[default]
    Both,
}

impl ThrottleStrategy {
    pub fn uses_cooldown(self) -> bool {
        matches!(self, Self::Cooldown | Self::Both)
    }

    pub fn uses_fingerprint(self) -> bool {
        matches!(self, Self::Fingerprint | Self::Both)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cooldown => "cooldown",
            Self::Fingerprint => "fingerprint",
            Self::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    #[default]
    PerSource,
    Global,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default)]
    pub strategy: ThrottleStrategy,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub dedup_scope: DedupScope,
    #[serde(default = "default_fingerprint_capacity")]
    pub fingerprint_capacity: usize,
}

fn default_cooldown_seconds() -> u64 {
    30
}
fn default_fingerprint_capacity() -> usize {
    1024
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            strategy: ThrottleStrategy::default(),
            cooldown_seconds: default_cooldown_seconds(),
            dedup_scope: DedupScope::default(),
            fingerprint_capacity: default_fingerprint_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvidenceConfig {
    #[serde(default = "default_evidence_dir")]
    pub dir: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_evidence_dir() -> String {
    "alerts".to_string()
}
fn default_jpeg_quality() -> u8 {
    90
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            dir: default_evidence_dir(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LedgerFormat {
    #[default]
    Csv,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: String,
    #[serde(default)]
    pub format: LedgerFormat,
}

fn default_ledger_path() -> String {
    "detections_log.csv".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            format: LedgerFormat::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    /// SMTP endpoint understood by curl, e.g. smtps://smtp.gmail.com:465
    #[serde(default = "default_smtp_url")]
    pub smtp_url: String,
    #[serde(default)]
    pub username: String,
    /// Prefer env HELMET_WATCH__EMAIL__PASSWORD or SMTP_PASSWORD.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_curl_binary")]
    pub curl_binary: String,
    #[serde(default = "default_email_timeout")]
    pub timeout_seconds: u64,
}

fn default_smtp_url() -> String {
    "smtps://smtp.gmail.com:465".to_string()
}
fn default_subject() -> String {
    "No Helmet Detected!".to_string()
}
fn default_curl_binary() -> String {
    "curl".to_string()
}
fn default_email_timeout() -> u64 {
    30
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_url: default_smtp_url(),
            username: String::new(),
            password: None,
            from: String::new(),
            to: String::new(),
            subject: default_subject(),
            curl_binary: default_curl_binary(),
            timeout_seconds: default_email_timeout(),
        }
    }
}

impl fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailConfig")
            .field("enabled", &self.enabled)
            .field("smtp_url", &self.smtp_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("from", &self.from)
            .field("to", &self.to)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationConfig {
    /// IP geolocation endpoint returning ipinfo-style JSON. Empty disables lookup.
    #[serde(default = "default_lookup_url")]
    pub lookup_url: String,
    #[serde(default = "default_lookup_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_cache_seconds")]
    pub cache_seconds: u64,
    /// After a failed lookup the fallback is served for this long before
    /// the next attempt.
    #[serde(default = "default_retry_seconds")]
    pub retry_seconds: u64,
    #[serde(default = "default_fallback_location")]
    pub fallback: String,
}

fn default_lookup_url() -> String {
    "https://ipinfo.io/json".to_string()
}
fn default_lookup_timeout() -> u64 {
    3
}
fn default_cache_seconds() -> u64 {
    600
}
fn default_retry_seconds() -> u64 {
    30
}
fn default_fallback_location() -> String {
    "Unknown Location".to_string()
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            lookup_url: default_lookup_url(),
            timeout_seconds: default_lookup_timeout(),
            cache_seconds: default_cache_seconds(),
            retry_seconds: default_retry_seconds(),
            fallback: default_fallback_location(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_process_every")]
    pub process_every_n_frames: u32,
    /// 0 = a lost stream stops the runner immediately.
    #[serde(default)]
    pub reconnect_attempts: u32,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

fn default_process_every() -> u32 {
    1
}
fn default_shutdown_grace() -> u64 {
    10
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            process_every_n_frames: default_process_every(),
            reconnect_attempts: 0,
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            detector: DetectorConfig::default(),
            throttle: ThrottleConfig::default(),
            evidence: EvidenceConfig::default(),
            ledger: LedgerConfig::default(),
            email: EmailConfig::default(),
            location: LocationConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid(
                "no sources configured (use [[sources]] or --source ID=URL)".into(),
            ));
        }

        let mut seen = HashSet::new();
        for src in &self.sources {
            if src.id.trim().is_empty() {
                return Err(ConfigError::Invalid("source id must not be empty".into()));
            }
            if !seen.insert(src.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate source id '{}'", src.id)));
            }
        }

        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "detector.confidence_threshold must be within [0, 1], got {}",
                self.detector.confidence_threshold
            )));
        }
        if self.detector.input_size == 0 {
            return Err(ConfigError::Invalid("detector.input_size must be positive".into()));
        }
        if self.throttle.strategy.uses_fingerprint() && self.throttle.fingerprint_capacity == 0 {
            return Err(ConfigError::Invalid(
                "throttle.fingerprint_capacity must be positive".into(),
            ));
        }
        if self.runner.process_every_n_frames == 0 {
            return Err(ConfigError::Invalid(
                "runner.process_every_n_frames must be positive".into(),
            ));
        }

        if self.email.enabled {
            let e = &self.email;
            if e.smtp_url.is_empty() || e.from.is_empty() || e.to.is_empty() {
                return Err(ConfigError::Invalid(
                    "email.enabled requires smtp_url, from and to".into(),
                ));
            }
            if !e.username.is_empty() && e.password.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Invalid(
                    "email.username set but no password (set SMTP_PASSWORD)".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Load configuration from helmet-watch.toml + environment variable overrides.
///
/// Search order:
///   1. `path` when given, else ./helmet-watch.toml (optional)
///   2. Environment variables: HELMET_WATCH__THROTTLE__COOLDOWN_SECONDS, etc.
///   3. SMTP_PASSWORD for the email password when not set above
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let file = match path {
        Some(p) => config::File::from(p).required(true),
        None => config::File::with_name("helmet-watch").required(false),
    };

    let settings = config::Config::builder()
        .add_source(file)
        .add_source(
            config::Environment::with_prefix("HELMET_WATCH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    let mut app: AppConfig = settings.try_deserialize()?;

    // Convenience: SMTP_PASSWORD env var (without HELMET_WATCH__ prefix)
    if app.email.password.is_none() {
        if let Ok(pw) = std::env::var("SMTP_PASSWORD") {
            app.email.password = Some(pw);
        }
    }

    Ok(app)
}
