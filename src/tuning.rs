//! Memory tuning
//!
//! Detects the host's RAM and derives the two memory settings PostgreSQL is
//! most sensitive to. Operator overrides in `extra_pg_conf` always win.

use sysinfo::System;

/// Smallest shared_buffers worth configuring
const MIN_SHARED_BUFFERS_MB: u64 = 16;
/// Beyond this the OS page cache does a better job
const MAX_SHARED_BUFFERS_MB: u64 = 8192;

/// Memory settings derived from the detected RAM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTuning {
    /// shared_buffers in MB
    pub shared_buffers_mb: u64,
    /// effective_cache_size in MB
    pub effective_cache_size_mb: u64,
    /// Detected RAM in MB
    pub detected_ram_mb: u64,
}

impl MemoryTuning {
    /// Allocation strategy:
    /// - shared_buffers gets 25% of RAM rounded up (min 16 MB, max 8 GB)
    /// - effective_cache_size is whatever is left (at least 1 MB)
    pub fn from_ram_mb(ram_mb: u64) -> Self {
        let shared_buffers_mb = ram_mb.div_ceil(4).clamp(MIN_SHARED_BUFFERS_MB, MAX_SHARED_BUFFERS_MB);
        let effective_cache_size_mb = ram_mb.saturating_sub(shared_buffers_mb).max(1);

        Self {
            shared_buffers_mb,
            effective_cache_size_mb,
            detected_ram_mb: ram_mb,
        }
    }

    /// Tune for the machine we are running on
    pub fn detect() -> Self {
        let ram_mb = detect_ram_mb();
        let tuning = Self::from_ram_mb(ram_mb);

        tracing::info!(
            ram_mb = ram_mb,
            shared_buffers_mb = tuning.shared_buffers_mb,
            effective_cache_size_mb = tuning.effective_cache_size_mb,
            "Auto-tuned memory settings based on hardware"
        );

        tuning
    }
}

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() / 1024 / 1024
}

/// Human-readable summary for `wolfpg info`
pub fn tuning_summary(tuning: &MemoryTuning) -> String {
    format!(
        "Detected: {} MB RAM\n\
         shared_buffers = {} MB\n\
         effective_cache_size = {} MB",
        tuning.detected_ram_mb, tuning.shared_buffers_mb, tuning.effective_cache_size_mb,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quarter_of_ram() {
        let t = MemoryTuning::from_ram_mb(4096);
        assert_eq!(t.shared_buffers_mb, 1024);
        assert_eq!(t.effective_cache_size_mb, 3072);
    }

    #[test]
    fn test_quarter_rounds_up() {
        let t = MemoryTuning::from_ram_mb(4098);
        assert_eq!(t.shared_buffers_mb, 1025);
        assert_eq!(t.effective_cache_size_mb, 3073);
    }

    #[test]
    fn test_clamped_at_both_ends() {
        let small = MemoryTuning::from_ram_mb(32);
        assert_eq!(small.shared_buffers_mb, 16);
        assert_eq!(small.effective_cache_size_mb, 16);

        let large = MemoryTuning::from_ram_mb(256 * 1024);
        assert_eq!(large.shared_buffers_mb, 8192);
        assert_eq!(large.effective_cache_size_mb, 256 * 1024 - 8192);
    }

    #[test]
    fn test_tiny_machine_keeps_positive_cache_size() {
        let t = MemoryTuning::from_ram_mb(10);
        assert_eq!(t.shared_buffers_mb, 16);
        assert_eq!(t.effective_cache_size_mb, 1);
    }

    #[test]
    fn test_detection_returns_positive_values() {
        assert!(detect_ram_mb() > 0);
        assert!(MemoryTuning::detect().shared_buffers_mb >= 16);
    }
}
