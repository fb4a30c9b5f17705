//! Connection health sampling
//!
//! Every connected or degraded session is sampled on each tick. A sample
//! refreshes the session's heartbeat and quality tier; a connected session
//! that produces no successful sample for longer than the silence timeout is
//! reported once per silent episode.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::HealthConfig;
use crate::error::Result;
use crate::peer::PeerSession;
use crate::transport::TransportStats;
use crate::types::ViewerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityTier {
    /// Classify a sample; `None` until the transport reports both RTT and bitrate
    ///
    /// Jitter the transport cannot measure counts as zero.
    #[must_use]
    pub fn from_stats(stats: &ConnectionStats) -> Option<Self> {
        let rtt = stats.rtt_ms?;
        let bitrate = stats.bitrate_bps?;
        let jitter = stats.jitter_ms.unwrap_or(0.0);

        let tier = if rtt < 100.0 && bitrate > 1_000_000 && jitter < 50.0 {
            Self::Excellent
        } else if rtt < 200.0 && bitrate > 500_000 {
            Self::Good
        } else if rtt < 500.0 && bitrate > 250_000 {
            Self::Fair
        } else {
            Self::Poor
        };
        Some(tier)
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
            Self::Excellent => "excellent",
        };
        f.write_str(name)
    }
}

/// One stats sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub rtt_ms: Option<f64>,
    pub bitrate_bps: Option<u64>,
    pub jitter_ms: Option<f64>,
    pub frame_rate: Option<f64>,
    pub sampled_at: DateTime<Utc>,
}

impl ConnectionStats {
    #[must_use]
    pub fn from_transport(stats: TransportStats, sampled_at: DateTime<Utc>) -> Self {
        Self {
            rtt_ms: stats.rtt_ms,
            bitrate_bps: stats.bitrate_bps,
            jitter_ms: stats.jitter_ms,
            frame_rate: stats.frame_rate,
            sampled_at,
        }
    }
}

/// Aggregate health of one viewer's connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub viewer_id: ViewerId,
    pub quality_tier: Option<QualityTier>,
    pub reconnect_attempts: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_stats: Option<ConnectionStats>,
}

/// Result of one successful sample
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSample {
    pub viewer_id: ViewerId,
    pub tier: Option<QualityTier>,
    pub stats: ConnectionStats,
}

/// What one tick observed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub samples: Vec<HealthSample>,
    /// Connected sessions that went silent during this tick
    pub silent: Vec<ViewerId>,
}

struct HealthEntry {
    health: ConnectionHealth,
    last_heartbeat: Instant,
    silence_reported: bool,
}

impl HealthEntry {
    fn new(viewer_id: ViewerId) -> Self {
        Self {
            health: ConnectionHealth {
                viewer_id,
                quality_tier: None,
                reconnect_attempts: 0,
                last_heartbeat_at: None,
                last_stats: None,
            },
            last_heartbeat: Instant::now(),
            silence_reported: false,
        }
    }
}

pub struct HealthMonitor {
    config: HealthConfig,
    entries: DashMap<ViewerId, HealthEntry>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Read transport stats for one session and record the heartbeat
    pub async fn sample(&self, session: &PeerSession) -> Result<ConnectionStats> {
        let raw = session.transport().stats().await?;
        let stats = ConnectionStats::from_transport(raw, Utc::now());
        let tier = QualityTier::from_stats(&stats);

        let mut entry = self
            .entries
            .entry(session.viewer_id().clone())
            .or_insert_with(|| HealthEntry::new(session.viewer_id().clone()));
        entry.last_heartbeat = Instant::now();
        entry.silence_reported = false;
        entry.health.last_heartbeat_at = Some(stats.sampled_at);
        entry.health.last_stats = Some(stats);
        if tier.is_some() {
            entry.health.quality_tier = tier;
        }
        Ok(stats)
    }

    /// Sample every connected/degraded session concurrently
    ///
    /// Applies the poor/not-poor verdict to each session and reports sessions
    /// that stayed silent past the timeout.
    pub async fn tick(&self, sessions: &[Arc<PeerSession>]) -> HealthReport {
        let present: HashSet<&ViewerId> = sessions.iter().map(|s| s.viewer_id()).collect();
        self.entries.retain(|viewer_id, _| present.contains(viewer_id));

        let connected: Vec<&Arc<PeerSession>> = sessions
            .iter()
            .filter(|s| s.state().is_connected())
            .collect();
        for session in &connected {
            self.entries
                .entry(session.viewer_id().clone())
                .or_insert_with(|| HealthEntry::new(session.viewer_id().clone()));
        }

        let results = join_all(connected.iter().map(|session| async move {
            (*session, self.sample(session).await)
        }))
        .await;

        let mut report = HealthReport::default();
        for (session, result) in results {
            match result {
                Ok(stats) => {
                    let tier = QualityTier::from_stats(&stats);
                    if let Some(tier) = tier {
                        session.apply_health_verdict(tier == QualityTier::Poor);
                    }
                    debug!(
                        viewer_id = %session.viewer_id(),
                        rtt_ms = ?stats.rtt_ms,
                        bitrate_bps = ?stats.bitrate_bps,
                        tier = ?tier,
                        "Health sample"
                    );
                    report.samples.push(HealthSample {
                        viewer_id: session.viewer_id().clone(),
                        tier,
                        stats,
                    });
                }
                Err(e) => {
                    debug!(viewer_id = %session.viewer_id(), error = %e, "Health sample failed");
                }
            }
        }

        let silence_timeout = self.config.silence_timeout();
        for session in &connected {
            if let Some(mut entry) = self.entries.get_mut(session.viewer_id()) {
                if !entry.silence_reported && entry.last_heartbeat.elapsed() > silence_timeout {
                    entry.silence_reported = true;
                    warn!(
                        viewer_id = %session.viewer_id(),
                        silent_for_ms = entry.last_heartbeat.elapsed().as_millis() as u64,
                        "No successful health sample"
                    );
                    report.silent.push(session.viewer_id().clone());
                }
            }
        }

        report
    }

    #[must_use]
    pub fn health(&self, viewer_id: &ViewerId) -> Option<ConnectionHealth> {
        self.entries.get(viewer_id).map(|entry| entry.health.clone())
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
