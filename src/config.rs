use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl: String,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    pub id: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default = "default_origin_env")]
    pub origin_env: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_proc_root")]
    pub proc_root: String,
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_cpu_window_ms")]
    pub cpu_window_ms: u64,
    #[serde(default = "default_fast_push_interval_ms")]
    pub cpu_push_interval_ms: u64,
    #[serde(default = "default_fast_push_interval_ms")]
    pub memory_push_interval_ms: u64,
    #[serde(default = "default_disk_push_interval_ms")]
    pub disk_push_interval_ms: u64,
    #[serde(default = "default_disk_paths")]
    pub disk_paths: Vec<String>,
    #[serde(default = "default_metric_history_capacity")]
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMode {
    Helper,
    Direct,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TerminalConfig {
    #[serde(default = "default_command_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    #[serde(default = "default_host_mode")]
    pub host_mode: HostMode,
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            auth: AuthConfig::default(),
            cors: CorsConfig::default(),
            monitoring: MonitoringConfig::default(),
            terminal: TerminalConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            token_ttl: default_token_ttl(),
            users: Vec::new(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            origin_env: default_origin_env(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            proc_root: default_proc_root(),
            sample_interval_secs: default_sample_interval_secs(),
            cpu_window_ms: default_cpu_window_ms(),
            cpu_push_interval_ms: default_fast_push_interval_ms(),
            memory_push_interval_ms: default_fast_push_interval_ms(),
            disk_push_interval_ms: default_disk_push_interval_ms(),
            disk_paths: default_disk_paths(),
            history_capacity: default_metric_history_capacity(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_command_history_capacity(),
            command_timeout: default_command_timeout(),
            container_runtime: default_container_runtime(),
            host_mode: default_host_mode(),
            helper_image: default_helper_image(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }

        validate_auth(&self.auth)?;
        validate_monitoring(&self.monitoring)?;
        validate_terminal(&self.terminal)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Result<Duration, ConfigError> {
        parse_duration("auth.token_ttl", &self.token_ttl)
    }
}

impl TerminalConfig {
    pub fn command_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("terminal.command_timeout", &self.command_timeout)
    }
}

impl MonitoringConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn cpu_window(&self) -> Duration {
        Duration::from_millis(self.cpu_window_ms)
    }

    pub fn cpu_push_interval(&self) -> Duration {
        Duration::from_millis(self.cpu_push_interval_ms)
    }

    pub fn memory_push_interval(&self) -> Duration {
        Duration::from_millis(self.memory_push_interval_ms)
    }

    pub fn disk_push_interval(&self) -> Duration {
        Duration::from_millis(self.disk_push_interval_ms)
    }
}

fn parse_duration(field: &str, raw: &str) -> Result<Duration, ConfigError> {
    let value = humantime::parse_duration(raw.trim()).map_err(|err| {
        ConfigError::Validation(format!("{field}: некорректная длительность '{raw}': {err}"))
    })?;
    if value.is_zero() {
        return Err(ConfigError::Validation(format!(
            "{field} должно быть больше нуля"
        )));
    }
    Ok(value)
}

fn validate_auth(cfg: &AuthConfig) -> Result<(), ConfigError> {
    if cfg.secret_env.trim().is_empty() {
        return Err(ConfigError::Validation(
            "auth.secret_env не должен быть пустым".to_string(),
        ));
    }
    cfg.token_ttl()?;

    let mut emails = HashSet::new();
    for user in &cfg.users {
        if user.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "auth.users[*].id не должен быть пустым".to_string(),
            ));
        }
        if user.email.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "auth.users '{}' email не должен быть пустым",
                user.id
            )));
        }
        if !emails.insert(user.email.to_lowercase()) {
            return Err(ConfigError::Validation(format!(
                "email пользователя '{}' должен быть уникальным",
                user.email
            )));
        }
        if !is_bcrypt_hash(&user.password_hash) {
            return Err(ConfigError::Validation(format!(
                "auth.users '{}' password_hash должен быть bcrypt-хешем ($2b$...)",
                user.email
            )));
        }
    }
    Ok(())
}

fn is_bcrypt_hash(hash: &str) -> bool {
    let hash = hash.trim();
    hash.len() == 60
        && ["$2a$", "$2b$", "$2x$", "$2y$"]
            .iter()
            .any(|prefix| hash.starts_with(prefix))
}

fn validate_monitoring(cfg: &MonitoringConfig) -> Result<(), ConfigError> {
    if cfg.proc_root.trim().is_empty() {
        return Err(ConfigError::Validation(
            "monitoring.proc_root не должен быть пустым".to_string(),
        ));
    }
    if cfg.sample_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "monitoring.sample_interval_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.cpu_window_ms == 0 {
        return Err(ConfigError::Validation(
            "monitoring.cpu_window_ms должно быть > 0".to_string(),
        ));
    }
    for (name, value) in [
        ("cpu_push_interval_ms", cfg.cpu_push_interval_ms),
        ("memory_push_interval_ms", cfg.memory_push_interval_ms),
        ("disk_push_interval_ms", cfg.disk_push_interval_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation(format!(
                "monitoring.{name} должно быть > 0"
            )));
        }
    }
    if cfg.disk_paths.is_empty() || cfg.disk_paths.iter().any(|p| p.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "monitoring.disk_paths должен содержать хотя бы один непустой путь".to_string(),
        ));
    }
    if cfg.history_capacity == 0 {
        return Err(ConfigError::Validation(
            "monitoring.history_capacity должно быть > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_terminal(cfg: &TerminalConfig) -> Result<(), ConfigError> {
    if cfg.history_capacity == 0 {
        return Err(ConfigError::Validation(
            "terminal.history_capacity должно быть > 0".to_string(),
        ));
    }
    cfg.command_timeout()?;
    if cfg.container_runtime.trim().is_empty() {
        return Err(ConfigError::Validation(
            "terminal.container_runtime не должен быть пустым".to_string(),
        ));
    }
    if cfg.host_mode == HostMode::Helper && cfg.helper_image.trim().is_empty() {
        return Err(ConfigError::Validation(
            "terminal.helper_image обязателен для host_mode: helper".to_string(),
        ));
    }
    Ok(())
}

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_secret_env() -> String {
    "JWT_SECRET".to_string()
}

fn default_token_ttl() -> String {
    "24h".to_string()
}

fn default_origin_env() -> String {
    "FRONTEND_ORIGIN".to_string()
}

fn default_proc_root() -> String {
    "/proc".to_string()
}

const fn default_sample_interval_secs() -> u64 {
    1
}

const fn default_cpu_window_ms() -> u64 {
    100
}

const fn default_fast_push_interval_ms() -> u64 {
    1000
}

const fn default_disk_push_interval_ms() -> u64 {
    10_000
}

fn default_disk_paths() -> Vec<String> {
    vec!["/".to_string(), "/home".to_string()]
}

const fn default_metric_history_capacity() -> usize {
    crate::history::METRIC_HISTORY_CAPACITY
}

const fn default_command_history_capacity() -> usize {
    crate::history::COMMAND_HISTORY_CAPACITY
}

fn default_command_timeout() -> String {
    "10m".to_string()
}

fn default_container_runtime() -> String {
    "docker".to_string()
}

const fn default_host_mode() -> HostMode {
    HostMode::Helper
}

fn default_helper_image() -> String {
    "alpine".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("конфигурация по умолчанию должна быть валидной");
        assert_eq!(cfg.monitoring.history_capacity, 1000);
        assert_eq!(cfg.terminal.history_capacity, 100);
        assert_eq!(cfg.monitoring.disk_push_interval(), Duration::from_secs(10));
        assert_eq!(
            cfg.terminal.command_timeout().unwrap(),
            Duration::from_secs(600)
        );
        assert_eq!(
            cfg.auth.token_ttl().unwrap(),
            Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn bundled_example_parses() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.terminal.host_mode, HostMode::Helper);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "listen: 127.0.0.1:9000\nterminal:\n  host_mode: direct\n  command_timeout: 30s\n",
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.terminal.host_mode, HostMode::Direct);
        assert_eq!(cfg.terminal.command_timeout().unwrap(), Duration::from_secs(30));
        assert_eq!(cfg.monitoring.disk_paths, vec!["/", "/home"]);
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.listen = "not-an-address".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.terminal.command_timeout = "forever".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.monitoring.disk_paths.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.monitoring.cpu_push_interval_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_bcrypt_password_hash() {
        let mut cfg = Config::default();
        cfg.auth.users.push(UserConfig {
            id: "1".to_string(),
            email: "ops@example.com".to_string(),
            password_hash: "e2186dbdb1bb4193608605e84f33208765b5693b55edd4f730a719a100eeea6f"
                .to_string(),
        });
        assert!(cfg.validate().is_err());

        cfg.auth.users[0].password_hash =
            "$2b$10$JqdAfWRmg2KdAhJwvwmEkuVIeDUVaU.aWtLc9hctIkCE4WekywDTa".to_string();
        assert!(cfg.validate().is_ok());
    }
}
