//! Adaptive capture constraints
//!
//! Requests to the capture source are advisory. A refused request is logged
//! and never touches session state.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::QualityConfig;
use crate::health::ConnectionStats;
use crate::transport::{CaptureConstraints, CaptureSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityAction {
    /// Step resolution up towards the ceiling
    Increase,
    /// Lower frame rate only
    ReduceFrameRate,
    /// Lower resolution and frame rate
    Reduce,
}

impl QualityAction {
    /// Reaction to one sample
    #[must_use]
    pub fn from_stats(stats: &ConnectionStats) -> Option<Self> {
        let rtt = stats.rtt_ms;
        let jitter = stats.jitter_ms;

        if rtt.is_some_and(|rtt| rtt > 500.0) || jitter.is_some_and(|j| j > 100.0) {
            return Some(Self::Reduce);
        }
        if stats.frame_rate.is_some_and(|fps| fps < 15.0) {
            return Some(Self::ReduceFrameRate);
        }
        let healthy = rtt.is_some_and(|rtt| rtt < 100.0)
            && jitter.unwrap_or(0.0) < 50.0
            && stats.bitrate_bps.is_some_and(|bps| bps > 1_000_000);
        healthy.then_some(Self::Increase)
    }

    /// Reaction for a capture shared by every viewer: the most severe
    /// reduction wins, and an increase needs every sample to ask for one
    #[must_use]
    pub fn aggregate<'a>(samples: impl IntoIterator<Item = &'a ConnectionStats>) -> Option<Self> {
        let mut worst: Option<Self> = None;
        let mut all_increase = true;
        let mut any = false;
        for stats in samples {
            any = true;
            match Self::from_stats(stats) {
                Some(Self::Increase) => {}
                Some(action) => {
                    all_increase = false;
                    worst = worst.max(Some(action));
                }
                None => all_increase = false,
            }
        }
        worst.or_else(|| (any && all_increase).then_some(Self::Increase))
    }
}

pub struct QualityController {
    config: QualityConfig,
    capture: Arc<dyn CaptureSource>,
    last_adjusted: Mutex<Option<Instant>>,
}

impl QualityController {
    pub fn new(config: QualityConfig, capture: Arc<dyn CaptureSource>) -> Self {
        Self {
            config,
            capture,
            last_adjusted: Mutex::new(None),
        }
    }

    /// Constraints `action` would request from `current`; `None` when already at the limit
    #[must_use]
    pub fn target(&self, action: QualityAction, current: CaptureConstraints) -> Option<CaptureConstraints> {
        let c = &self.config;
        let scale = |value: u32, factor: f64, min: u32, max: u32| -> u32 {
            let scaled = (f64::from(value) * factor).round();
            (scaled.clamp(f64::from(min), f64::from(max))) as u32
        };
        let reduced_fps = (current.frame_rate * c.frame_rate_factor).max(c.min_frame_rate);

        let next = match action {
            QualityAction::Reduce => CaptureConstraints {
                width: scale(current.width, c.resolution_step, c.min_width, current.width.max(c.min_width)),
                height: scale(current.height, c.resolution_step, c.min_height, current.height.max(c.min_height)),
                frame_rate: reduced_fps.min(current.frame_rate.max(c.min_frame_rate)),
            },
            QualityAction::ReduceFrameRate => CaptureConstraints {
                frame_rate: reduced_fps.min(current.frame_rate.max(c.min_frame_rate)),
                ..current
            },
            QualityAction::Increase => CaptureConstraints {
                width: scale(current.width, 1.0 / c.resolution_step, current.width.min(c.max_width), c.max_width),
                height: scale(current.height, 1.0 / c.resolution_step, current.height.min(c.max_height), c.max_height),
                ..current
            },
        };
        // No request ever exceeds the configured frame-rate ceiling.
        let next = CaptureConstraints {
            frame_rate: next.frame_rate.min(c.max_frame_rate),
            ..next
        };
        (next != current).then_some(next)
    }

    /// React to the latest samples of every viewer
    ///
    /// Returns the constraints that were applied, if any.
    pub async fn react(&self, samples: &[ConnectionStats]) -> Option<CaptureConstraints> {
        let action = QualityAction::aggregate(samples)?;

        {
            let last = self.last_adjusted.lock();
            if last.is_some_and(|at| at.elapsed() < self.config.adjust_cooldown()) {
                return None;
            }
        }

        let current = self.capture.constraints();
        let target = self.target(action, current)?;
        *self.last_adjusted.lock() = Some(Instant::now());

        match self.capture.apply_constraints(target).await {
            Ok(()) => {
                info!(
                    action = ?action,
                    from = %current,
                    to = %target,
                    "Capture constraints adjusted"
                );
                Some(target)
            }
            Err(e) => {
                warn!(action = ?action, to = %target, error = %e, "Capture refused constraint change");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCapture;
    use chrono::Utc;
    use std::time::Duration;

    fn stats(rtt: f64, bitrate: u64, jitter: f64, fps: f64) -> ConnectionStats {
        ConnectionStats {
            rtt_ms: Some(rtt),
            bitrate_bps: Some(bitrate),
            jitter_ms: Some(jitter),
            frame_rate: Some(fps),
            sampled_at: Utc::now(),
        }
    }

    fn controller(capture: Arc<MockCapture>) -> QualityController {
        QualityController::new(QualityConfig::default(), capture)
    }

    #[test]
    fn test_action_rules() {
        assert_eq!(QualityAction::from_stats(&stats(600.0, 2_000_000, 10.0, 30.0)), Some(QualityAction::Reduce));
        assert_eq!(QualityAction::from_stats(&stats(50.0, 2_000_000, 150.0, 30.0)), Some(QualityAction::Reduce));
        assert_eq!(QualityAction::from_stats(&stats(150.0, 800_000, 10.0, 10.0)), Some(QualityAction::ReduceFrameRate));
        assert_eq!(QualityAction::from_stats(&stats(50.0, 2_000_000, 10.0, 30.0)), Some(QualityAction::Increase));
        assert_eq!(QualityAction::from_stats(&stats(150.0, 800_000, 10.0, 30.0)), None);
    }

    #[test]
    fn test_aggregate_prefers_reduction() {
        let good = stats(50.0, 2_000_000, 10.0, 30.0);
        let bad = stats(700.0, 100_000, 10.0, 30.0);
        let meh = stats(150.0, 800_000, 10.0, 30.0);

        assert_eq!(QualityAction::aggregate([&good, &bad]), Some(QualityAction::Reduce));
        assert_eq!(QualityAction::aggregate([&good, &good]), Some(QualityAction::Increase));
        assert_eq!(QualityAction::aggregate([&good, &meh]), None);
        assert_eq!(QualityAction::aggregate(std::iter::empty()), None);
    }

    #[test]
    fn test_targets_respect_limits() {
        let controller = controller(Arc::new(MockCapture::new()));
        let current = CaptureConstraints {
            width: 1280,
            height: 720,
            frame_rate: 30.0,
        };

        let reduced = controller.target(QualityAction::Reduce, current).unwrap();
        assert_eq!((reduced.width, reduced.height), (960, 540));
        assert!((reduced.frame_rate - 24.0).abs() < 1e-9);

        let fps_only = controller
            .target(
                QualityAction::ReduceFrameRate,
                CaptureConstraints {
                    frame_rate: 16.0,
                    ..current
                },
            )
            .unwrap();
        assert_eq!((fps_only.width, fps_only.height), (1280, 720));
        assert!((fps_only.frame_rate - 15.0).abs() < 1e-9);

        let floor = CaptureConstraints {
            width: 320,
            height: 180,
            frame_rate: 15.0,
        };
        assert!(controller.target(QualityAction::Reduce, floor).is_none());

        let increased = controller.target(QualityAction::Increase, current).unwrap();
        assert_eq!((increased.width, increased.height), (1707, 960));
        let ceiling = CaptureConstraints {
            width: 1920,
            height: 1080,
            frame_rate: 30.0,
        };
        assert!(controller.target(QualityAction::Increase, ceiling).is_none());

        let too_fast = CaptureConstraints {
            frame_rate: 60.0,
            ..ceiling
        };
        let capped = controller.target(QualityAction::Increase, too_fast).unwrap();
        assert_eq!((capped.width, capped.height), (1920, 1080));
        assert!((capped.frame_rate - 30.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_react_applies_with_cooldown() {
        let capture = Arc::new(MockCapture::new());
        let controller = controller(Arc::clone(&capture));
        let bad = [stats(700.0, 100_000, 10.0, 30.0)];

        assert!(controller.react(&bad).await.is_some());
        assert!(controller.react(&bad).await.is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(controller.react(&bad).await.is_some());
        assert_eq!(capture.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_refused_request_is_only_logged() {
        let capture = Arc::new(MockCapture::new());
        capture.set_failing(true);
        let controller = controller(Arc::clone(&capture));

        assert!(controller.react(&[stats(700.0, 100_000, 10.0, 30.0)]).await.is_none());
        assert_eq!(capture.requests().len(), 1);
        assert_eq!(capture.constraints(), CaptureConstraints::default());
    }
}
