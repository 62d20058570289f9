//! Service Registry：存活 Agent 的 endpoint 与心跳健康状态
//!
//! - 重复 id 注册被拒绝，不覆盖
//! - 超过 `heartbeat_timeout` 没有心跳的记录被扫描标记为不健康，`find` 不再返回它
//! - 不健康超过 `grace_period` 才删除；期间一次新心跳即可恢复，无需重新注册

mod client;
mod heartbeat;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RegistrySection;
use crate::core::error::RegistryError;
use crate::protocol::AgentKind;

pub use client::{register_with_league, Enrollment};
pub use heartbeat::spawn_heartbeat;

#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub service_id: String,
    pub kind: AgentKind,
    pub endpoint: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    pub healthy: bool,
    /// 被标记为不健康的时刻，用于计算宽限期
    pub unhealthy_since: Option<Instant>,
    seq: u64,
}

/// 一次扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub marked_unhealthy: Vec<String>,
    pub removed: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.marked_unhealthy.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub heartbeat_timeout: Duration,
    pub grace_period: Duration,
}

impl RegistryConfig {
    pub fn from_config(cfg: &RegistrySection) -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(cfg.heartbeat_timeout_secs),
            grace_period: Duration::from_secs(cfg.grace_period_secs),
        }
    }
}

pub struct ServiceRegistry {
    config: RegistryConfig,
    records: RwLock<HashMap<String, ServiceRecord>>,
    next_seq: std::sync::atomic::AtomicU64,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
            next_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub async fn register(
        &self,
        kind: AgentKind,
        service_id: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Result<(), RegistryError> {
        let service_id = service_id.into();
        let mut records = self.records.write().await;
        if records.contains_key(&service_id) {
            return Err(RegistryError::Duplicate(service_id));
        }
        let seq = self
            .next_seq
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let record = ServiceRecord {
            service_id: service_id.clone(),
            kind,
            endpoint: endpoint.into(),
            registered_at: Utc::now(),
            last_heartbeat: Instant::now(),
            healthy: true,
            unhealthy_since: None,
            seq,
        };
        debug!(service_id = %service_id, %kind, endpoint = %record.endpoint, "Service registered");
        records.insert(service_id, record);
        Ok(())
    }

    /// 刷新心跳；不健康的记录由此恢复
    pub async fn heartbeat(&self, service_id: &str) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(service_id)
            .ok_or_else(|| RegistryError::NotFound(service_id.to_string()))?;
        record.last_heartbeat = Instant::now();
        if !record.healthy {
            info!(service_id, "Service recovered via heartbeat");
        }
        record.healthy = true;
        record.unhealthy_since = None;
        Ok(())
    }

    /// 某类型的健康记录，按注册顺序
    pub async fn find(&self, kind: AgentKind) -> Vec<ServiceRecord> {
        let records = self.records.read().await;
        let mut found: Vec<ServiceRecord> = records
            .values()
            .filter(|r| r.kind == kind && r.healthy)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.seq);
        found
    }

    pub async fn get(&self, service_id: &str) -> Option<ServiceRecord> {
        self.records.read().await.get(service_id).cloned()
    }

    /// 全部记录（含不健康），按注册顺序
    pub async fn all(&self) -> Vec<ServiceRecord> {
        let records = self.records.read().await;
        let mut all: Vec<ServiceRecord> = records.values().cloned().collect();
        all.sort_by_key(|r| r.seq);
        all
    }

    pub async fn unregister(&self, service_id: &str) -> Result<ServiceRecord, RegistryError> {
        self.records
            .write()
            .await
            .remove(service_id)
            .ok_or_else(|| RegistryError::NotFound(service_id.to_string()))
    }

    /// 调用方观察到对端失联时主动标记（如上报熔断），等待心跳恢复
    pub async fn mark_unhealthy(&self, service_id: &str) -> Result<(), RegistryError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(service_id)
            .ok_or_else(|| RegistryError::NotFound(service_id.to_string()))?;
        if record.healthy {
            warn!(service_id, "Service marked unhealthy");
            record.healthy = false;
            record.unhealthy_since = Some(Instant::now());
        }
        Ok(())
    }

    /// 一次健康扫描
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();
        let mut records = self.records.write().await;

        for record in records.values_mut() {
            if record.healthy && now.duration_since(record.last_heartbeat) > self.config.heartbeat_timeout {
                record.healthy = false;
                record.unhealthy_since = Some(now);
                report.marked_unhealthy.push(record.service_id.clone());
            }
        }
        records.retain(|id, record| {
            let expired = record
                .unhealthy_since
                .is_some_and(|since| now.duration_since(since) > self.config.grace_period);
            if expired {
                report.removed.push(id.clone());
            }
            !expired
        });

        report.marked_unhealthy.sort();
        report.removed.sort();
        if !report.is_empty() {
            warn!(
                unhealthy = ?report.marked_unhealthy,
                removed = ?report.removed,
                "Registry sweep"
            );
        }
        report
    }

    /// 后台周期扫描，直到 token 被取消
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                }
            }
            debug!("Registry sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(RegistryConfig {
            heartbeat_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_not_overwritten() {
        let reg = registry();
        reg.register(AgentKind::Player, "P01", "mem://p1").await.unwrap();
        let err = reg.register(AgentKind::Player, "P01", "mem://other").await.unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("P01".into()));
        assert_eq!(reg.get("P01").await.unwrap().endpoint, "mem://p1");
    }

    #[tokio::test]
    async fn test_find_filters_kind_in_registration_order() {
        let reg = registry();
        reg.register(AgentKind::Referee, "R02", "mem://r2").await.unwrap();
        reg.register(AgentKind::Player, "P01", "mem://p1").await.unwrap();
        reg.register(AgentKind::Referee, "R01", "mem://r1").await.unwrap();
        let ids: Vec<String> = reg
            .find(AgentKind::Referee)
            .await
            .into_iter()
            .map(|r| r.service_id)
            .collect();
        assert_eq!(ids, vec!["R02", "R01"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_marks_then_removes_after_grace() {
        let reg = registry();
        reg.register(AgentKind::Referee, "R01", "mem://r1").await.unwrap();
        reg.register(AgentKind::Referee, "R02", "mem://r2").await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        reg.heartbeat("R02").await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        let report = reg.sweep().await;
        assert_eq!(report.marked_unhealthy, vec!["R01"]);
        assert!(report.removed.is_empty());
        let healthy: Vec<_> = reg.find(AgentKind::Referee).await.into_iter().map(|r| r.service_id).collect();
        assert_eq!(healthy, vec!["R02"]);
        // 不健康但尚未删除
        assert!(reg.get("R01").await.is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = reg.sweep().await;
        assert_eq!(report.removed, vec!["R01"]);
        assert_eq!(report.marked_unhealthy, vec!["R02"]);
        assert!(reg.get("R01").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_recovers_within_grace() {
        let reg = registry();
        reg.register(AgentKind::Player, "P01", "mem://p1").await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        reg.sweep().await;
        assert!(reg.find(AgentKind::Player).await.is_empty());

        reg.heartbeat("P01").await.unwrap();
        assert_eq!(reg.find(AgentKind::Player).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let reg = registry();
        assert!(matches!(reg.heartbeat("X").await, Err(RegistryError::NotFound(_))));
        assert!(matches!(reg.unregister("X").await, Err(RegistryError::NotFound(_))));
        reg.register(AgentKind::Player, "P01", "mem://p1").await.unwrap();
        reg.mark_unhealthy("P01").await.unwrap();
        assert!(reg.find(AgentKind::Player).await.is_empty());
        assert_eq!(reg.unregister("P01").await.unwrap().service_id, "P01");
        assert!(reg.all().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_until_cancelled() {
        let reg = Arc::new(registry());
        reg.register(AgentKind::Player, "P01", "mem://p1").await.unwrap();
        let token = CancellationToken::new();
        let handle = reg.spawn_sweeper(Duration::from_secs(5), token.clone());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!reg.get("P01").await.unwrap().healthy);

        token.cancel();
        handle.await.unwrap();
    }
}
