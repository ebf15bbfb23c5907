//! Stress tests for the integrity layer.
//!
//! These tests verify behavior under heavy load and concurrent access to a
//! single file.

use crate::fixtures::pattern;
use pagecsi_core::{CsiFile, PgOptions, PAGE_SIZE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Size of each write in bytes.
    pub write_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            write_size: 1_000,
        }
    }
}

impl StressConfig {
    /// Bytes of file owned by each thread.
    fn slot_len(&self) -> u64 {
        (self.operations * self.write_size) as u64
    }
}

fn tally(successful: &AtomicUsize, failed: &AtomicUsize, ok: bool) {
    if ok {
        successful.fetch_add(1, Ordering::Relaxed);
    } else {
        failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Run a sequential append stress test. Writes are deliberately not page
/// sized, so most of them update a partial last page.
pub fn stress_sequential_appends(file: &CsiFile, config: &StressConfig) -> StressTestResult {
    let data = pattern(config.write_size, 0x5A);
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let offset = (i * config.write_size) as u64;
        match file.write(&data, offset) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

/// Run concurrent writers, each appending in order to its own region of
/// the file, while readers verify random ranges.
pub fn stress_concurrent_writes(file: &CsiFile, config: &StressConfig) -> StressTestResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    thread::scope(|s| {
        for t in 0..config.threads {
            let successful = &successful;
            let failed = &failed;
            s.spawn(move || {
                let data = pattern(config.write_size, t as u8);
                let base = t as u64 * config.slot_len();
                for i in 0..config.operations {
                    let offset = base + (i * config.write_size) as u64;
                    tally(successful, failed, file.write(&data, offset).is_ok());
                }
            });
        }

        let successful = &successful;
        let failed = &failed;
        s.spawn(move || {
            let mut buf = vec![0u8; PAGE_SIZE + 123];
            for i in 0..config.operations {
                let offset = ((i * 7919) % (PAGE_SIZE * 8)) as u64;
                tally(successful, failed, file.read(&mut buf, offset).is_ok());
            }
        });
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run concurrent checksummed readers over a file already written.
pub fn stress_concurrent_pg_reads(file: &CsiFile, config: &StressConfig) -> StressTestResult {
    let len = file.len().unwrap_or(0) as usize;
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    thread::scope(|s| {
        for t in 0..config.threads {
            let successful = &successful;
            let failed = &failed;
            s.spawn(move || {
                let mut buf = vec![0u8; config.write_size];
                let mut csvec = vec![0u32; config.write_size / PAGE_SIZE + 2];
                for i in 0..config.operations {
                    let offset = ((t * 4099 + i * 613) % len.max(1)) as u64;
                    let ok = file
                        .pg_read(&mut buf, offset, Some(&mut csvec[..]), PgOptions::VERIFY)
                        .is_ok();
                    tally(successful, failed, ok);
                }
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Checks that the whole file reads back with every tag matching and that
/// each writer's region holds its pattern.
pub fn verify_concurrent_writes(file: &CsiFile, config: &StressConfig) -> bool {
    let total = config.threads as u64 * config.slot_len();
    let mut all = vec![0u8; total as usize];
    match file.read(&mut all, 0) {
        Ok(n) if n as u64 == total => {}
        _ => return false,
    }

    (0..config.threads).all(|t| {
        let data = pattern(config.write_size, t as u8);
        let base = t * config.slot_len() as usize;
        all[base..base + config.slot_len() as usize]
            .chunks(config.write_size)
            .all(|chunk| chunk == &data[..])
    })
}
