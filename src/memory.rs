//! Memory budget monitor.
//!
//! Usage is estimated from a host probe when one is available, otherwise from a
//! ledger of the buffers the pipeline itself holds, counted in `chunk_size`
//! units. Over budget, the monitor first asks for a collection hint, then
//! degrades capture quality, and only at the quality floor reports the budget
//! as exceeded.

use crate::config::MemoryPolicy;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MB: u64 = 1024 * 1024;

pub trait HeapProbe: Send + Sync {
    /// Current heap usage in bytes, or `None` when the host cannot tell.
    fn used_bytes(&self) -> Option<u64>;

    /// Ask the host to release reclaimable memory.
    fn collect_hint(&self) {}
}

/// Resident set size from `/proc/self/statm`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcStatmProbe;

const PAGE_SIZE: u64 = 4096;

impl HeapProbe for ProcStatmProbe {
    fn used_bytes(&self) -> Option<u64> {
        let raw = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident: u64 = raw.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident * PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHeapProbe;

impl HeapProbe for NoHeapProbe {
    fn used_bytes(&self) -> Option<u64> {
        None
    }
}

pub fn default_probe() -> Arc<dyn HeapProbe> {
    if ProcStatmProbe.used_bytes().is_some() {
        Arc::new(ProcStatmProbe)
    } else {
        Arc::new(NoHeapProbe)
    }
}

/// Buffers held by the pipeline, rounded up to whole chunks.
#[derive(Debug, Clone)]
pub struct ChunkLedger {
    chunk_size: u64,
    chunks: u64,
}

impl ChunkLedger {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunks: 0,
        }
    }

    fn chunks_for(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.chunk_size)
    }

    pub fn track(&mut self, bytes: u64) {
        self.chunks += self.chunks_for(bytes);
    }

    pub fn release(&mut self, bytes: u64) {
        self.chunks = self.chunks.saturating_sub(self.chunks_for(bytes));
    }

    pub fn clear(&mut self) {
        self.chunks = 0;
    }

    pub fn bytes(&self) -> u64 {
        self.chunks.saturating_mul(self.chunk_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    WithinBudget { estimated_mb: u64 },
    Degrade { estimated_mb: u64, quality: f64 },
    Exceeded { estimated_mb: u64 },
}

pub struct MemoryMonitor {
    policy: MemoryPolicy,
    probe: Arc<dyn HeapProbe>,
    ledger: ChunkLedger,
}

impl MemoryMonitor {
    pub fn new(policy: MemoryPolicy, probe: Arc<dyn HeapProbe>) -> Self {
        let ledger = ChunkLedger::new(policy.chunk_size);
        Self {
            policy,
            probe,
            ledger,
        }
    }

    pub fn limit_mb(&self) -> u64 {
        self.policy.max_memory_usage_mb
    }

    pub fn estimate_bytes(&self) -> u64 {
        self.probe
            .used_bytes()
            .unwrap_or_else(|| self.ledger.bytes())
    }

    pub fn track(&mut self, bytes: u64) {
        self.ledger.track(bytes);
    }

    pub fn release(&mut self, bytes: u64) {
        self.ledger.release(bytes);
    }

    pub fn release_all(&mut self) {
        self.ledger.clear();
    }

    /// Checks the budget for a capture running at `quality`.
    pub fn check(&self, quality: f64) -> Verdict {
        self.check_capture(quality, |_| None)
    }

    /// Like [`check`](Self::check), but also requires the next capture to fit:
    /// `projected(q)` is the number of bytes a capture at quality `q` allocates.
    pub fn check_capture(&self, quality: f64, projected: impl Fn(f64) -> Option<u64>) -> Verdict {
        let limit = self.policy.max_memory_bytes();
        let mut estimated = self.estimate_bytes();
        if estimated > limit && self.policy.enable_garbage_collection_hint {
            debug!("memory over budget ({} MB); requesting collection", estimated / MB);
            self.probe.collect_hint();
            estimated = self.estimate_bytes();
            if estimated <= limit {
                info!("memory back within budget after collection hint");
            }
        }

        if estimated > limit {
            return self.degrade_once(quality, estimated.div_ceil(MB));
        }

        let needed_at = |q: f64| estimated.saturating_add(projected(q).unwrap_or(0));
        let needed_mb = needed_at(quality).div_ceil(MB);
        let mut q = quality;
        while needed_at(q) > limit {
            let next = (q * self.policy.degrade_factor).max(self.policy.quality_floor);
            if next >= q {
                warn!(
                    "capture would exceed memory budget ({needed_mb} MB > {} MB) even at quality floor {q}",
                    self.policy.max_memory_usage_mb
                );
                return Verdict::Exceeded {
                    estimated_mb: needed_at(q).div_ceil(MB),
                };
            }
            q = next;
        }
        if q < quality {
            warn!(
                "capture would exceed memory budget ({needed_mb} MB > {} MB); degrading quality {quality} -> {q}",
                self.policy.max_memory_usage_mb
            );
            return Verdict::Degrade {
                estimated_mb: needed_mb,
                quality: q,
            };
        }
        Verdict::WithinBudget {
            estimated_mb: estimated / MB,
        }
    }

    fn degrade_once(&self, quality: f64, estimated_mb: u64) -> Verdict {
        let floor = self.policy.quality_floor;
        let degraded = (quality * self.policy.degrade_factor).max(floor);
        if degraded < quality {
            warn!(
                "memory over budget ({estimated_mb} MB > {} MB); degrading quality {quality} -> {degraded}",
                self.policy.max_memory_usage_mb
            );
            Verdict::Degrade {
                estimated_mb,
                quality: degraded,
            }
        } else {
            warn!(
                "memory over budget ({estimated_mb} MB > {} MB) at quality floor {floor}",
                self.policy.max_memory_usage_mb
            );
            Verdict::Exceeded { estimated_mb }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_rounds_up_to_chunks() {
        let mut ledger = ChunkLedger::new(1000);
        ledger.track(1);
        ledger.track(2500);
        assert_eq!(ledger.bytes(), 4000);
        ledger.release(2500);
        assert_eq!(ledger.bytes(), 1000);
        ledger.release(10_000);
        assert_eq!(ledger.bytes(), 0);
    }

    #[test]
    fn ledger_is_used_without_host_probe() {
        let policy = MemoryPolicy {
            max_memory_usage_mb: 1,
            chunk_size: MB,
            ..Default::default()
        };
        let mut monitor = MemoryMonitor::new(policy, Arc::new(NoHeapProbe));
        assert!(matches!(monitor.check(2.0), Verdict::WithinBudget { .. }));
        monitor.track(3 * MB);
        assert!(matches!(monitor.check(2.0), Verdict::Degrade { .. }));
        monitor.release_all();
        assert!(matches!(monitor.check(2.0), Verdict::WithinBudget { .. }));
    }
}
