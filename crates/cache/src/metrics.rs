//! Per-tier cache counters
//!
//! Each tier owns one [`Counters`] instance. Everything is a lock-free atomic
//! sum or count; there is no histogram or percentile tracking.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Column names of the tabular export, in order
pub const CSV_COLUMNS: [&str; 10] = [
    "gets",
    "hits",
    "misses",
    "puts",
    "getErrors",
    "putErrors",
    "totalGetBytes",
    "totalGetDur",
    "totalPutBytes",
    "totalPutDur",
];

/// The CSV header row, without a trailing newline
#[must_use]
pub fn csv_header() -> String {
    CSV_COLUMNS.join(",")
}

/// Thread-safe get/put counters for one cache tier
#[derive(Debug, Default)]
pub struct Counters {
    gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    get_errors: AtomicU64,
    puts: AtomicU64,
    put_errors: AtomicU64,
    get_bytes: AtomicU64,
    get_nanos: AtomicU64,
    put_bytes: AtomicU64,
    put_nanos: AtomicU64,
}

/// Point-in-time copy of a [`Counters`] instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    /// Get operations attempted
    pub gets: u64,
    /// Gets that found an entry
    pub hits: u64,
    /// Gets that found nothing
    pub misses: u64,
    /// Gets that failed
    pub get_errors: u64,
    /// Put operations attempted
    pub puts: u64,
    /// Puts that failed
    pub put_errors: u64,
    /// Bytes served by successful gets
    pub get_bytes: u64,
    /// Time spent in successful gets
    pub get_duration: Duration,
    /// Bytes written by successful puts
    pub put_bytes: u64,
    /// Time spent in successful puts
    pub put_duration: Duration,
}

impl Counters {
    /// Create a zeroed counter set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a get attempt
    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a get that found an entry
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a get that found nothing
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed get
    pub fn record_get_error(&self) {
        self.get_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a put attempt
    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed put
    pub fn record_put_error(&self) {
        self.put_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the size and latency of a successful get
    pub fn record_get_transfer(&self, bytes: u64, elapsed: Duration) {
        self.get_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.get_nanos
            .fetch_add(duration_nanos(elapsed), Ordering::Relaxed);
    }

    /// Add the size and latency of a successful put
    pub fn record_put_transfer(&self, bytes: u64, elapsed: Duration) {
        self.put_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.put_nanos
            .fetch_add(duration_nanos(elapsed), Ordering::Relaxed);
    }

    /// Load every counter
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            get_errors: self.get_errors.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            put_errors: self.put_errors.load(Ordering::Relaxed),
            get_bytes: self.get_bytes.load(Ordering::Relaxed),
            get_duration: Duration::from_nanos(self.get_nanos.load(Ordering::Relaxed)),
            put_bytes: self.put_bytes.load(Ordering::Relaxed),
            put_duration: Duration::from_nanos(self.put_nanos.load(Ordering::Relaxed)),
        }
    }

    /// Human-readable two-line summary
    #[must_use]
    pub fn summary(&self) -> String {
        self.snapshot().summary()
    }

    /// Write one CSV row (optionally preceded by the header row)
    pub fn write_csv<W: Write>(&self, writer: W, header: bool) -> std::io::Result<()> {
        self.snapshot().write_csv(writer, header)
    }
}

impl CountersSnapshot {
    /// Human-readable two-line summary
    ///
    /// ```text
    /// 12 gets: 9 hits, 3 misses, 0 errors, 1.2s total dur; total 4.20 MB; avg 3.50 MB/s
    /// 3 puts: 0 errors, 300ms total dur; total 0.80 MB; avg 2.67 MB/s
    /// ```
    #[must_use]
    pub fn summary(&self) -> String {
        let mut gets_line = format!(
            "{} gets: {} hits, {} misses, {} errors, {} total dur",
            self.gets,
            self.hits,
            self.misses,
            self.get_errors,
            human_duration(self.get_duration)
        );
        gets_line.push_str(&throughput_suffix(self.get_bytes, self.get_duration));

        let mut puts_line = format!(
            "{} puts: {} errors, {} total dur",
            self.puts,
            self.put_errors,
            human_duration(self.put_duration)
        );
        puts_line.push_str(&throughput_suffix(self.put_bytes, self.put_duration));

        format!("{gets_line}\n{puts_line}")
    }

    /// The CSV row values, in [`CSV_COLUMNS`] order
    #[must_use]
    pub fn csv_row(&self) -> [String; 10] {
        [
            self.gets.to_string(),
            self.hits.to_string(),
            self.misses.to_string(),
            self.puts.to_string(),
            self.get_errors.to_string(),
            self.put_errors.to_string(),
            self.get_bytes.to_string(),
            csv_duration(self.get_duration),
            self.put_bytes.to_string(),
            csv_duration(self.put_duration),
        ]
    }

    /// Write one CSV row (optionally preceded by the header row)
    pub fn write_csv<W: Write>(&self, mut writer: W, header: bool) -> std::io::Result<()> {
        if header {
            writeln!(writer, "{}", csv_header())?;
        }
        writeln!(writer, "{}", self.csv_row().join(","))?;
        writer.flush()
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[allow(clippy::cast_precision_loss)]
fn throughput_suffix(bytes: u64, elapsed: Duration) -> String {
    if bytes == 0 {
        return String::new();
    }
    let megabytes = bytes as f64 / 1_000_000.0;
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        format!("; total {megabytes:.2} MB; avg {:.2} MB/s", megabytes / secs)
    } else {
        format!("; total {megabytes:.2} MB")
    }
}

/// Round to 100ms and render like `300ms`, `1.2s`, `2m3.5s`, `1h0m0s`
fn human_duration(d: Duration) -> String {
    let tenths = (d.as_millis() + 50) / 100;
    if tenths == 0 {
        return "0s".to_string();
    }
    if tenths < 10 {
        return format!("{}ms", tenths * 100);
    }
    let minutes = tenths / 600;
    let rem = tenths % 600;
    let secs = if rem % 10 == 0 {
        format!("{}", rem / 10)
    } else {
        format!("{}.{}", rem / 10, rem % 10)
    };
    match minutes {
        0 => format!("{secs}s"),
        m if m < 60 => format!("{m}m{secs}s"),
        m => format!("{}h{}m{secs}s", m / 60, m % 60),
    }
}

/// `HH:MM:SS.mmm`, a format spreadsheet tools import as a duration
fn csv_duration(d: Duration) -> String {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| DateTime::<Utc>::UNIX_EPOCH.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .format("%H:%M:%S%.3f")
        .to_string()
}
