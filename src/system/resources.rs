//! System resources
//!
//! CPU detection used for thread defaults and limits.

/// Thread count used when the CPU count cannot be detected
const FALLBACK_THREADS: usize = 4;

/// Number of logical CPUs, if the OS reports it
pub fn cpu_count() -> Option<usize> {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .ok()
}

/// Default `--threads`: half the logical CPUs, at least one
pub fn default_threads() -> usize {
    match cpu_count() {
        Some(cpus) => (cpus / 2).max(1),
        None => FALLBACK_THREADS,
    }
}

/// Upper bound accepted for `--threads`: twice the logical CPUs
pub fn max_threads() -> usize {
    cpu_count().unwrap_or(FALLBACK_THREADS) * 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_bounds() {
        let default = default_threads();
        assert!(default >= 1);
        assert!(default <= max_threads());
        if let Some(cpus) = cpu_count() {
            assert_eq!(max_threads(), cpus * 2);
        }
    }
}
