use crate::{BlockStatus, MemoryBlock};
use serde::Serialize;

/// Aggregate usage over one snapshot. Always recomputed from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DerivedMetrics {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
    pub process_count: usize,
}

impl DerivedMetrics {
    pub fn compute(blocks: &[MemoryBlock]) -> Self {
        let mut total = 0u64;
        let mut used = 0u64;
        let mut process_count = 0usize;
        for block in blocks {
            total = total.saturating_add(block.size);
            if block.status == BlockStatus::Used {
                used = used.saturating_add(block.size);
                process_count += 1;
            }
        }
        let used_percent = if total > 0 {
            round_tenth(used as f64 / total as f64 * 100.0)
        } else {
            0.0
        };
        Self {
            total,
            used,
            free: total - used,
            used_percent,
            process_count,
        }
    }

    pub fn used_percent_label(&self) -> String {
        format!("{:.1}", self.used_percent)
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
