use chrono::{DateTime, Utc};

use super::{CacheMeta, PartitionPolicy};

/// Usage target, in percent of the budget, that an eviction pass stops at.
pub const DEFAULT_WATERMARK_PERCENT: u64 = 80;

/// Chooses which entries leave a partition.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    watermark_percent: u64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            watermark_percent: DEFAULT_WATERMARK_PERCENT,
        }
    }
}

impl EvictionPolicy {
    pub fn new(watermark_percent: u64) -> Self {
        Self {
            watermark_percent: watermark_percent.min(100),
        }
    }

    pub fn target(&self, budget: u64) -> u64 {
        budget.saturating_mul(self.watermark_percent) / 100
    }

    /// Keys to delete, least recently accessed first, so that usage drops to
    /// the watermark. Returns nothing while usage is within budget.
    ///
    /// `protect` is never selected; it is the entry whose write triggered the pass.
    pub fn select_victims(&self, entries: &[CacheMeta], budget: u64, protect: Option<&str>) -> Vec<String> {
        let mut used: u64 = entries.iter().map(|m| m.size).sum();
        if used <= budget {
            return Vec::new();
        }
        let target = self.target(budget);

        let mut candidates: Vec<&CacheMeta> = entries
            .iter()
            .filter(|m| Some(m.key.as_str()) != protect)
            .collect();
        candidates.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.cached_at.cmp(&b.cached_at))
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut victims = Vec::new();
        for meta in candidates {
            if used <= target {
                break;
            }
            used = used.saturating_sub(meta.size);
            victims.push(meta.key.clone());
        }
        victims
    }

    /// Keys whose age exceeds the partition TTL, independent of space pressure.
    pub fn select_expired(&self, entries: &[CacheMeta], policy: &PartitionPolicy, now: DateTime<Utc>) -> Vec<String> {
        entries
            .iter()
            .filter(|m| policy.is_expired(m.cached_at, now))
            .map(|m| m.key.clone())
            .collect()
    }
}
