//! Live pipeline counters and the end-of-run report.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use nrflow_core::StatsSnapshot;
use nrflow_runtime::{ProducerDrops, ShutdownReport};
use nrflow_traffic::ProtocolClass;

/// Live counters tracker
pub struct RunProgress {
    bar: ProgressBar,
    timed: bool,
}

impl RunProgress {
    /// Create a tracker; a bounded run gets a bar, an open-ended one a spinner
    #[must_use]
    pub fn new(duration: Option<Duration>) -> Self {
        let (bar, template) = match duration {
            Some(duration) => (
                ProgressBar::new(duration.as_secs().max(1)),
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len}s\n{msg}",
            ),
            None => (
                ProgressBar::new_spinner(),
                "{spinner:.green} [{elapsed_precise}] {msg}",
            ),
        };

        bar.set_style(
            ProgressStyle::default_bar()
                .template(template)
                .expect("Invalid progress bar template")
                .progress_chars("#>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(120));

        Self {
            bar,
            timed: duration.is_some(),
        }
    }

    /// Refresh from a statistics snapshot
    pub fn update(&self, elapsed: Duration, submitted: u64, live: u32, stats: &StatsSnapshot) {
        if self.timed {
            self.bar.set_position(elapsed.as_secs());
        }
        self.bar.set_message(format_live(submitted, live, stats));
    }

    /// Finish with custom message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }
}

fn format_live(submitted: u64, live: u32, stats: &StatsSnapshot) -> String {
    format!(
        "submitted {}  analyzed {} ({})  dropped {}  errors {}  held {}  workers {}/{}",
        submitted,
        stats.totals.consumed,
        format_rate(stats.throughput_per_sec),
        stats.rings.dropped(),
        stats.totals.analyze_errors,
        stats.held_blocks(),
        live,
        stats.workers.len(),
    )
}

/// Print the end-of-run report
pub fn print_report(report: &ShutdownReport, submitted: u64, producer: ProducerDrops) {
    let stats = &report.final_stats;

    println!();
    println!("{}", style("Run summary").bold());
    println!("  Submitted:  {}", submitted);
    println!(
        "  Enqueued:   {} ({} over {} rings)",
        stats.rings.enqueued,
        format_bytes(stats.totals.bytes),
        stats.workers.len()
    );
    println!(
        "  Dropped:    {} ring full, {} pool exhausted, {} ring closed, {} oversized",
        stats.rings.dropped_ring_full,
        stats.rings.dropped_pool_exhausted,
        producer.ring_closed,
        producer.oversized
    );
    println!(
        "  Analyzed:   {} ({} malformed)",
        stats.totals.consumed, stats.totals.analyze_errors
    );
    if let (Some(p50), Some(p99)) = (stats.latency_p50_ns, stats.latency_p99_ns) {
        println!(
            "  Latency:    p50 <= {}  p99 <= {}",
            format_nanos(p50),
            format_nanos(p99)
        );
    }
    println!("  Imbalance:  {:.2}", stats.imbalance);

    println!();
    println!("{}", style("Protocol classes").bold());
    for class in ProtocolClass::ALL {
        let count = stats.totals.classes[class as usize];
        if count > 0 {
            println!("  {:<10} {}", class.name(), count);
        }
    }

    println!();
    println!("{}", style("Shutdown").bold());
    println!(
        "  Workers:    {} drained, {} shut down, {} killed, {} abandoned",
        report.drained, report.forced, report.killed, report.leaked
    );
    println!(
        "  Blocks:     {} reclaimed, {} leaked, pool {}/{} free",
        report.reclaimed_blocks, report.leaked_blocks, stats.pool.free, stats.pool.total
    );
    println!("  Took:       {} ms", report.elapsed_ms);

    if stats.violations > 0 || stats.totals.violations > 0 {
        println!(
            "  {} {} arena, {} worker invariant violations",
            style("!").red().bold(),
            stats.violations,
            stats.totals.violations
        );
    }

    for failure in &report.failures {
        println!(
            "  {} worker {} {} in state {} ({} ring + {} held blocks reclaimed)",
            style("!").red().bold(),
            failure.worker,
            failure.status,
            failure.state,
            failure.reclaimed_ring,
            failure.reclaimed_held
        );
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

/// Format a message rate
#[must_use]
pub fn format_rate(per_sec: f64) -> String {
    if per_sec >= 1_000_000.0 {
        format!("{:.2} M/s", per_sec / 1_000_000.0)
    } else if per_sec >= 1_000.0 {
        format!("{:.1} k/s", per_sec / 1_000.0)
    } else {
        format!("{per_sec:.0} /s")
    }
}

/// Format a latency bound
#[must_use]
pub fn format_nanos(nanos: u64) -> String {
    if nanos >= 1_000_000 {
        format!("{:.2} ms", nanos as f64 / 1_000_000.0)
    } else if nanos >= 1_000 {
        format!("{:.1} us", nanos as f64 / 1_000.0)
    } else {
        format!("{nanos} ns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024_u64.pow(4)), "1.00 TB");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(12.0), "12 /s");
        assert_eq!(format_rate(2_500.0), "2.5 k/s");
        assert_eq!(format_rate(3_000_000.0), "3.00 M/s");
    }

    #[test]
    fn test_format_nanos() {
        assert_eq!(format_nanos(512), "512 ns");
        assert_eq!(format_nanos(2_048), "2.0 us");
        assert_eq!(format_nanos(4_194_304), "4.19 ms");
    }
}
