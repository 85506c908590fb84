use crate::dispatcher::Dispatcher;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::{debug, warn};

pub const KERNEL_HEALTH_TOPIC: &str = "vigil/kernel/health@v1";

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub notifications: BTreeMap<String, usize>,
    /// Target keys with a recovery in flight
    pub active_recoveries: Vec<String>,
    pub free_recovery_slots: usize,
    pub segments: usize,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub async fn get_health(&self, dispatcher: &Dispatcher) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            notifications: dispatcher.notifications().counts_by_status().await,
            active_recoveries: dispatcher.locks().held(),
            free_recovery_slots: dispatcher.available_permits(),
            segments: dispatcher.topology().segment_count(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Publishes the kernel health on `vigil/kernel/health@v1` every `every`
    pub fn spawn_health_publisher(&self, client: AsyncClient, dispatcher: Arc<Dispatcher>, every: Duration) {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let health = tracker.get_health(&dispatcher).await;
                match serde_json::to_string(&health) {
                    Ok(payload) => {
                        if let Err(e) = client.publish(KERNEL_HEALTH_TOPIC, QoS::AtLeastOnce, false, payload).await {
                            warn!("failed to publish kernel health: {e}");
                        } else {
                            debug!(
                                uptime = health.uptime_seconds,
                                active = health.active_recoveries.len(),
                                "published kernel health"
                            );
                        }
                    }
                    Err(e) => warn!("failed to serialize kernel health: {e}"),
                }
            }
        });
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find_map(|line| line.strip_prefix("VmRSS:"))
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
