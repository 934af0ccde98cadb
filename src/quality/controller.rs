use serde::Serialize;

use super::{QualityLevel, Viewport};

/// Seconds of buffered media that count as a full (100%) buffer.
pub const BUFFER_TARGET_SECONDS: f64 = 10.0;
/// Below this buffer health the controller steps down.
pub const DOWNGRADE_BELOW: f64 = 20.0;
/// Above this buffer health the controller may step up.
pub const UPGRADE_ABOVE: f64 = 80.0;

/// Buffer health in percent: `min(ahead / 10s, 1) * 100`.
pub fn buffer_health(buffered_ahead_secs: f64) -> f64 {
    if !buffered_ahead_secs.is_finite() || buffered_ahead_secs <= 0.0 {
        return 0.0;
    }
    (buffered_ahead_secs / BUFFER_TARGET_SECONDS).min(1.0) * 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SwitchReason {
    BufferStarved,
    Headroom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualitySwitch {
    pub from: QualityLevel,
    pub to: QualityLevel,
    pub reason: SwitchReason,
}

/// Adaptive quality selection for one playing video.
///
/// Transitions move at most one rung. Nothing fires while buffer health sits
/// inside the 20–80% band, which keeps the active quality from oscillating.
#[derive(Debug, Clone)]
pub struct QualityController {
    active: QualityLevel,
    /// Highest quality the viewport can display.
    ceiling: QualityLevel,
    peak: QualityLevel,
}

impl QualityController {
    /// Start at the more conservative of the viewport and network qualities.
    pub fn new(viewport: Viewport, network: QualityLevel) -> Self {
        let ceiling = QualityLevel::for_viewport(viewport);
        let active = ceiling.min(network);
        Self {
            active,
            ceiling,
            peak: active,
        }
    }

    pub fn with_initial(active: QualityLevel, ceiling: QualityLevel) -> Self {
        Self {
            active,
            ceiling,
            peak: active,
        }
    }

    pub fn active(&self) -> QualityLevel {
        self.active
    }

    pub fn ceiling(&self) -> QualityLevel {
        self.ceiling
    }

    pub fn peak(&self) -> QualityLevel {
        self.peak
    }

    /// Decide a transition for the current buffer health and link quality.
    pub fn evaluate(&mut self, health: f64, network: QualityLevel) -> Option<QualitySwitch> {
        if !health.is_finite() {
            return None;
        }

        let (to, reason) = if health < DOWNGRADE_BELOW {
            (self.active.step_down()?, SwitchReason::BufferStarved)
        } else if health > UPGRADE_ABOVE {
            let target = network.min(self.ceiling);
            if target <= self.active {
                return None;
            }
            (self.active.step_up()?, SwitchReason::Headroom)
        } else {
            return None;
        };

        let switch = QualitySwitch {
            from: self.active,
            to,
            reason,
        };
        self.active = to;
        self.peak = self.peak.max(to);
        Some(switch)
    }

    /// Undo a switch whose new source failed to load.
    pub fn revert(&mut self, switch: &QualitySwitch) {
        if self.active == switch.to {
            self.active = switch.from;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(active: QualityLevel) -> QualityController {
        QualityController::with_initial(active, QualityLevel::Ultra)
    }

    #[test]
    fn test_buffer_health() {
        assert_eq!(buffer_health(0.0), 0.0);
        assert_eq!(buffer_health(1.5), 15.0);
        assert_eq!(buffer_health(10.0), 100.0);
        assert_eq!(buffer_health(42.0), 100.0);
        assert_eq!(buffer_health(f64::NAN), 0.0);
    }

    #[test]
    fn test_initial_is_more_conservative() {
        let big_screen = Viewport::new(1920, 1080);
        assert_eq!(QualityController::new(big_screen, QualityLevel::Medium).active(), QualityLevel::Medium);
        let phone = Viewport::new(360, 200);
        assert_eq!(QualityController::new(phone, QualityLevel::Ultra).active(), QualityLevel::Low);
    }

    #[test]
    fn test_starved_buffer_steps_down_once() {
        let mut c = controller(QualityLevel::High);
        let switch = c.evaluate(15.0, QualityLevel::Ultra).unwrap();
        assert_eq!(switch.from, QualityLevel::High);
        assert_eq!(switch.to, QualityLevel::Medium);
        assert_eq!(switch.reason, SwitchReason::BufferStarved);
        assert_eq!(c.active(), QualityLevel::Medium);
    }

    #[test]
    fn test_low_is_floor() {
        let mut c = controller(QualityLevel::Low);
        assert_eq!(c.evaluate(0.0, QualityLevel::Low), None);
        assert_eq!(c.active(), QualityLevel::Low);
    }

    #[test]
    fn test_upgrade_needs_network_headroom() {
        let mut c = controller(QualityLevel::Medium);
        assert_eq!(c.evaluate(95.0, QualityLevel::Medium), None);
        let switch = c.evaluate(95.0, QualityLevel::Ultra).unwrap();
        assert_eq!(switch.to, QualityLevel::High);
        assert_eq!(c.peak(), QualityLevel::High);
    }

    #[test]
    fn test_upgrade_capped_by_viewport() {
        let mut c = QualityController::with_initial(QualityLevel::Medium, QualityLevel::Medium);
        assert_eq!(c.evaluate(100.0, QualityLevel::Ultra), None);
    }

    #[test]
    fn test_hysteresis_band() {
        let mut c = controller(QualityLevel::High);
        for health in [20.0, 20.5, 50.0, 79.9, 80.0] {
            assert_eq!(c.evaluate(health, QualityLevel::Low), None, "health {}", health);
            assert_eq!(c.evaluate(health, QualityLevel::Ultra), None, "health {}", health);
        }
        assert_eq!(c.active(), QualityLevel::High);
    }

    #[test]
    fn test_never_moves_more_than_one_rung() {
        let healths = [0.0, 5.0, 19.0, 21.0, 60.0, 81.0, 99.0, 100.0];
        for start in QualityLevel::LADDER {
            for network in QualityLevel::LADDER {
                for health in healths {
                    let mut c = controller(start);
                    if let Some(switch) = c.evaluate(health, network) {
                        assert_eq!(switch.from.distance(switch.to), 1);
                    }
                }
            }
        }
    }

    #[test]
    fn test_revert_restores_previous() {
        let mut c = controller(QualityLevel::High);
        let switch = c.evaluate(10.0, QualityLevel::High).unwrap();
        c.revert(&switch);
        assert_eq!(c.active(), QualityLevel::High);
    }
}
