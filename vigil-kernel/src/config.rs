use crate::engine::RetryPolicy;
use crate::models::{FailoverSegment, Host, RecoveryMethod};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CONFIG_ENV: &str = "VIGIL_KERNEL_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("invalid config {}: {source}", path.display())]
    Yaml { path: PathBuf, source: serde_yaml::Error },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub recovery: RecoveryConf,
    pub data_dir: DataDir,
    pub segments: Vec<SegmentConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883, client_id: "vigil-kernel".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RecoveryConf {
    /// Recoveries allowed in flight at once, across all targets
    pub max_concurrent: usize,
    pub compute_timeout_secs: u64,
    /// Attempts per recovery task, 1 means no retry
    pub task_attempts: u32,
    pub task_backoff_ms: u64,
    pub health_interval_secs: u64,
}

impl Default for RecoveryConf {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            compute_timeout_secs: 30,
            task_attempts: 1,
            task_backoff_ms: 0,
            health_interval_secs: 30,
        }
    }
}

impl RecoveryConf {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::attempts(self.task_attempts).with_backoff(Duration::from_millis(self.task_backoff_ms))
    }

    pub fn compute_timeout(&self) -> Duration {
        Duration::from_secs(self.compute_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(transparent)]
pub struct DataDir(pub PathBuf);

impl Default for DataDir {
    fn default() -> Self {
        Self(PathBuf::from("./data"))
    }
}

impl DataDir {
    pub fn notifications_file(&self) -> PathBuf {
        self.0.join("notifications.json")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SegmentConfig {
    /// Generated at load time when absent
    #[serde(default)]
    pub uuid: Option<Uuid>,
    pub name: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default)]
    pub recovery_method: RecoveryMethod,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostConfig {
    #[serde(default)]
    pub uuid: Option<Uuid>,
    pub name: String,
    #[serde(rename = "type", default = "default_host_type")]
    pub host_type: String,
    #[serde(default = "default_control_attributes")]
    pub control_attributes: String,
    #[serde(default)]
    pub reserved: bool,
    #[serde(default)]
    pub on_maintenance: bool,
}

fn default_service_type() -> String {
    "compute".into()
}

fn default_host_type() -> String {
    "COMPUTE".into()
}

fn default_control_attributes() -> String {
    "SSH".into()
}

impl SegmentConfig {
    pub fn to_segment(&self) -> FailoverSegment {
        FailoverSegment {
            uuid: self.uuid.unwrap_or_else(Uuid::new_v4),
            name: self.name.clone(),
            service_type: self.service_type.clone(),
            recovery_method: self.recovery_method,
            description: self.description.clone(),
        }
    }
}

impl HostConfig {
    pub fn to_host(&self, segment: Uuid) -> Host {
        Host {
            uuid: self.uuid.unwrap_or_else(Uuid::new_v4),
            name: self.name.clone(),
            failover_segment_id: segment,
            host_type: self.host_type.clone(),
            control_attributes: self.control_attributes.clone(),
            reserved: self.reserved,
            on_maintenance: self.on_maintenance,
        }
    }
}

/// Reads the file named by `VIGIL_KERNEL_CONFIG` (default `kernel.yaml`)
pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "kernel.yaml".into());
    load_from(Path::new(&path)).await
}

/// A missing or empty file yields the defaults; an unreadable or invalid one is an error
pub async fn load_from(path: &Path) -> Result<KernelConfig, ConfigError> {
    if !path.exists() {
        warn!("no {}, using default config", path.display());
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    let config: KernelConfig =
        serde_yaml::from_str(&txt).map_err(|source| ConfigError::Yaml { path: path.to_path_buf(), source })?;
    info!("loaded config from {} ({} segments)", path.display(), config.segments.len());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
mqtt:
  host: broker.lan
recovery:
  max_concurrent: 2
  task_attempts: 3
data_dir: /var/lib/vigil
segments:
  - name: rack-a
    recovery_method: auto
    hosts:
      - name: compute-1
      - name: spare-1
        reserved: true
  - name: rack-b
    recovery_method: reserved_host
"#;
        let config: KernelConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.recovery.max_concurrent, 2);
        assert_eq!(config.recovery.retry_policy().attempts, 3);
        assert_eq!(config.recovery.compute_timeout(), Duration::from_secs(30));
        assert_eq!(config.data_dir.notifications_file(), PathBuf::from("/var/lib/vigil/notifications.json"));
        assert_eq!(config.segments.len(), 2);
        assert_eq!(config.segments[1].recovery_method, RecoveryMethod::ReservedHost);

        let spare = config.segments[0].hosts[1].to_host(Uuid::nil());
        assert!(spare.reserved);
        assert_eq!(spare.host_type, "COMPUTE");
        assert_eq!(spare.control_attributes, "SSH");
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let config = load_from(Path::new("/nonexistent/vigil/kernel.yaml")).await.unwrap();
        assert!(config.segments.is_empty());
        assert_eq!(config.http.bind, "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_invalid_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("vigil-config-{}.yaml", Uuid::new_v4()));
        std::fs::write(&path, "segments: [name: {").unwrap();
        let err = load_from(&path).await.unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, ConfigError::Yaml { .. }));
    }
}
