//! Smoothed link throughput estimate shared by the quality controller and the preloader.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Below this the link is `Slow`.
pub const SLOW_THRESHOLD_KBPS: f64 = 250.0;
/// Up to and including this the link is `Medium`.
pub const FAST_THRESHOLD_KBPS: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkClass {
    Slow,
    Medium,
    Fast,
}

impl NetworkClass {
    pub fn from_kbps(kbps: f64) -> Self {
        if kbps < SLOW_THRESHOLD_KBPS {
            NetworkClass::Slow
        } else if kbps <= FAST_THRESHOLD_KBPS {
            NetworkClass::Medium
        } else {
            NetworkClass::Fast
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkClass::Slow => "slow",
            NetworkClass::Medium => "medium",
            NetworkClass::Fast => "fast",
        }
    }
}

/// Platform-reported connection type, used until the first transfer completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHint {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    Wifi,
    Ethernet,
}

impl ConnectionHint {
    pub fn class(&self) -> NetworkClass {
        match self {
            ConnectionHint::Slow2g | ConnectionHint::TwoG => NetworkClass::Slow,
            ConnectionHint::ThreeG => NetworkClass::Medium,
            ConnectionHint::FourG | ConnectionHint::Wifi | ConnectionHint::Ethernet => NetworkClass::Fast,
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            ConnectionHint::Slow2g => 1,
            ConnectionHint::TwoG => 2,
            ConnectionHint::ThreeG => 3,
            ConnectionHint::FourG => 4,
            ConnectionHint::Wifi => 5,
            ConnectionHint::Ethernet => 6,
        }
    }

    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ConnectionHint::Slow2g),
            2 => Some(ConnectionHint::TwoG),
            3 => Some(ConnectionHint::ThreeG),
            4 => Some(ConnectionHint::FourG),
            5 => Some(ConnectionHint::Wifi),
            6 => Some(ConnectionHint::Ethernet),
            _ => None,
        }
    }
}

const NO_ESTIMATE: u64 = u64::MAX;

/// Exponentially smoothed throughput: each completed transfer moves the
/// estimate halfway toward its own rate. No sample history is kept.
///
/// Share it behind an `Arc`; updates are a single atomic read-modify-write.
pub struct BandwidthEstimator {
    /// f64 bits of the estimate in kbps, or `NO_ESTIMATE`.
    estimate_bits: AtomicU64,
    hint: AtomicU8,
    samples: AtomicU64,
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self {
            estimate_bits: AtomicU64::new(NO_ESTIMATE),
            hint: AtomicU8::new(0),
            samples: AtomicU64::new(0),
        }
    }

    pub fn with_hint(hint: ConnectionHint) -> Self {
        let estimator = Self::new();
        estimator.set_hint(Some(hint));
        estimator
    }

    pub fn set_hint(&self, hint: Option<ConnectionHint>) {
        self.hint.store(hint.map(ConnectionHint::to_raw).unwrap_or(0), Ordering::Relaxed);
    }

    pub fn hint(&self) -> Option<ConnectionHint> {
        ConnectionHint::from_raw(self.hint.load(Ordering::Relaxed))
    }

    /// Fold in one completed transfer. Zero-length or zero-duration transfers
    /// carry no rate information and are ignored.
    pub fn record_sample(&self, bytes: u64, elapsed: Duration) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        if bytes == 0 || elapsed_ms <= 0.0 {
            return;
        }
        // bytes per ms * 8 = kilobits per second
        let instantaneous = bytes as f64 * 8.0 / elapsed_ms;

        let _ = self
            .estimate_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let next = if bits == NO_ESTIMATE {
                    instantaneous
                } else {
                    (f64::from_bits(bits) + instantaneous) / 2.0
                };
                Some(next.to_bits())
            });
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Smoothed estimate in kbps, `None` before the first sample.
    pub fn estimate(&self) -> Option<f64> {
        match self.estimate_bits.load(Ordering::Acquire) {
            NO_ESTIMATE => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn classify(&self) -> NetworkClass {
        match self.estimate() {
            Some(kbps) => NetworkClass::from_kbps(kbps),
            None => self.hint().map(|h| h.class()).unwrap_or(NetworkClass::Medium),
        }
    }

    pub fn reset(&self) {
        self.estimate_bits.store(NO_ESTIMATE, Ordering::Release);
        self.samples.store(0, Ordering::Relaxed);
    }
}
