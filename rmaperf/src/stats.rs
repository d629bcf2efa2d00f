//! Latency and throughput reports, and the buffer digest.

use std::fmt;

use sha2::{Digest as _, Sha256};

use crate::clock::ClockRate;
use crate::pool::BufferPool;
use crate::request::RequestRecord;
use crate::transport::RegisteredRegion;

/// Column names of a latency report row.
pub const LATENCY_HEADER: &str =
    "#bytes, #iterations, median, average, min, max, stdev, percent90, percent99";

/// Latency distribution of one round, in microseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyReport {
    pub length: usize,
    pub iterations: usize,
    pub median: f64,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation.
    pub stdev: f64,
    pub percent90: f64,
    pub percent99: f64,
    pub time_budget_us: u64,
    /// Requests that completed within `time_budget_us` of the first
    /// measured start.
    pub finished: usize,
}

impl LatencyReport {
    /// Build the report from the records after `warmup`.
    ///
    /// Only requests with an observed completion contribute. Returns `None`
    /// when nothing was measured.
    pub fn from_requests(
        records: &[RequestRecord],
        warmup: usize,
        rate: ClockRate,
        time_budget_us: u64,
    ) -> Option<Self> {
        let measured = records.get(warmup..)?;
        let first = measured.first()?;
        let spans: Vec<(u64, u64)> = measured
            .iter()
            .filter_map(|r| r.end.map(|end| (r.start, end)))
            .collect();
        Self::from_spans(&spans, first.start, first.length, rate, time_budget_us)
    }

    /// Build the report from `(start, end)` tick pairs.
    pub fn from_spans(
        spans: &[(u64, u64)],
        first_start: u64,
        length: usize,
        rate: ClockRate,
        time_budget_us: u64,
    ) -> Option<Self> {
        if spans.is_empty() {
            return None;
        }
        let budget = time_budget_us as f64;
        let finished = spans
            .iter()
            .filter(|&&(_, end)| rate.ticks_to_us(end.saturating_sub(first_start)) <= budget)
            .count();

        let mut latencies: Vec<f64> = spans
            .iter()
            .map(|&(start, end)| rate.ticks_to_us(end.saturating_sub(start)))
            .collect();
        latencies.sort_by(f64::total_cmp);

        let n = latencies.len();
        let average = latencies.iter().sum::<f64>() / n as f64;
        let sumsq: f64 = latencies.iter().map(|l| (l - average).powi(2)).sum();
        let at = |q: f64| latencies[((n as f64 * q) as usize).min(n - 1)];

        Some(Self {
            length,
            iterations: n,
            median: latencies[n / 2],
            average,
            min: latencies[0],
            max: latencies[n - 1],
            stdev: (sumsq / n as f64).sqrt(),
            percent90: at(0.9),
            percent99: at(0.99),
            time_budget_us,
            finished,
        })
    }

    pub fn log(&self) {
        tracing::info!("=====================");
        tracing::info!("Latency Report");
        tracing::info!("{}", LATENCY_HEADER);
        tracing::info!("{}", self);
        tracing::info!(
            "# of requests sent in {} µsec: {}.",
            self.time_budget_us,
            self.finished
        );
        tracing::info!("=====================");
    }
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {:.3}, {:.3}, {:.3}, {:.3}, {:.3}, {:.3}, {:.3}",
            self.length,
            self.iterations,
            self.median,
            self.average,
            self.min,
            self.max,
            self.stdev,
            self.percent90,
            self.percent99
        )
    }
}

/// Log per-request start, end and latency in microseconds, in issue order.
pub fn log_raw_latencies(records: &[RequestRecord], warmup: usize, rate: ClockRate) {
    let Some(measured) = records.get(warmup..) else {
        return;
    };
    let Some(origin) = measured.first().map(|r| r.start) else {
        return;
    };
    tracing::debug!("Raw latency (µsec):");
    tracing::debug!("Start,End,Latency");
    for r in measured {
        let start = rate.ticks_to_us(r.start.saturating_sub(origin));
        match (r.end, r.elapsed()) {
            (Some(end), Some(elapsed)) => tracing::debug!(
                "{:.3},{:.3},{:.3}",
                start,
                rate.ticks_to_us(end.saturating_sub(origin)),
                rate.ticks_to_us(elapsed)
            ),
            _ => tracing::debug!("{:.3},,", start),
        }
    }
}

/// Bulk transfer rate of one round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputReport {
    pub bytes: u64,
    pub elapsed_secs: f64,
    pub bytes_per_sec: f64,
    pub gbits_per_sec: f64,
}

impl ThroughputReport {
    /// `(count - warmup) * length` bytes between the start of the first
    /// measured request and the completion of the last one.
    ///
    /// Returns `None` if the last request has no completion or no time
    /// elapsed.
    pub fn from_requests(
        records: &[RequestRecord],
        warmup: usize,
        length: usize,
        rate: ClockRate,
    ) -> Option<Self> {
        let first = records.get(warmup)?;
        let end = records.last()?.end?;
        let ticks = end.checked_sub(first.start).filter(|&t| t > 0)?;

        let bytes = ((records.len() - warmup) * length) as u64;
        let elapsed_secs = rate.ticks_to_secs(ticks);
        let bytes_per_sec = bytes as f64 / elapsed_secs;
        Some(Self {
            bytes,
            elapsed_secs,
            bytes_per_sec,
            gbits_per_sec: bytes_per_sec * 8.0 / 1e9,
        })
    }

    pub fn log(&self) {
        tracing::info!("=====================");
        tracing::info!("Throughput Report");
        tracing::info!("{}", self);
        tracing::info!("=====================");
    }
}

impl fmt::Display for ThroughputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transferred: {} B, elapsed: {:.3e} s, throughput: {:.3} Gbps.",
            self.bytes, self.elapsed_secs, self.gbits_per_sec
        )
    }
}

/// SHA-256 over the concatenated request buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub count: usize,
    pub length: usize,
    bytes: [u8; 32],
}

impl Digest {
    pub fn of_requests<R: RegisteredRegion>(pool: &BufferPool<R>) -> Self {
        Self::of_chunks(pool.length(), (0..pool.len()).map(|i| pool.request_bytes(i)))
    }

    pub fn of_chunks<I, B>(length: usize, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut hasher = Sha256::new();
        let mut count = 0;
        for chunk in chunks {
            hasher.update(chunk.as_ref());
            count += 1;
        }
        Self {
            count,
            length,
            bytes: hasher.finalize().into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn log(&self, label: &str) {
        tracing::info!(
            "{} SHA-256: count = {}, length = {}, digest = {}.",
            label,
            self.count,
            self.length,
            self.hex()
        );
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Verb;

    fn record(start: u64, end: Option<u64>) -> RequestRecord {
        RequestRecord {
            verb: Verb::Write,
            region: 0,
            lkey: 0,
            addr: 0,
            offset: 0,
            length: 64,
            remote_addr: 0,
            remote_key: 0,
            start,
            end,
        }
    }

    #[test]
    fn test_percentile_indices() {
        // Latencies 1..=100 µs, shuffled by construction order.
        let records: Vec<RequestRecord> = (0..100u64)
            .map(|i| {
                let lat = (i * 37) % 100 + 1;
                record(i * 1_000, Some(i * 1_000 + lat * 1_000))
            })
            .collect();
        let report = LatencyReport::from_requests(&records, 0, ClockRate::NANOS, 180).unwrap();

        assert_eq!(report.iterations, 100);
        assert_eq!(report.median, 51.0);
        assert_eq!(report.percent90, 91.0);
        assert_eq!(report.percent99, 100.0);
        assert_eq!(report.min, 1.0);
        assert_eq!(report.max, 100.0);
        assert!((report.average - 50.5).abs() < 1e-9);
        let expected_stdev = ((100.0f64 * 100.0 - 1.0) / 12.0).sqrt();
        assert!((report.stdev - expected_stdev).abs() < 1e-9);
    }

    #[test]
    fn test_odd_count_median_is_middle_element() {
        let records: Vec<RequestRecord> = [7u64, 3, 9, 1, 5]
            .iter()
            .enumerate()
            .map(|(i, &lat)| {
                let start = i as u64 * 100_000;
                record(start, Some(start + lat * 1_000))
            })
            .collect();
        let report = LatencyReport::from_requests(&records, 0, ClockRate::NANOS, 180).unwrap();

        assert_eq!(report.iterations, 5);
        assert_eq!(report.median, 5.0);
        assert_eq!(report.min, 1.0);
        assert_eq!(report.max, 9.0);
        assert_eq!(report.percent90, 9.0);
        assert_eq!(report.percent99, 9.0);
        assert!((report.average - 5.0).abs() < 1e-9);
        assert!((report.stdev - 8.0f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_warmup_excluded_and_finished_count() {
        let mut records = vec![record(0, Some(1_000_000))];
        // Measured requests start at 10 µs, one every µs, 2 µs each.
        records.extend((0..10u64).map(|i| {
            let start = 10_000 + i * 1_000;
            record(start, Some(start + 2_000))
        }));
        let report = LatencyReport::from_requests(&records, 1, ClockRate::NANOS, 5).unwrap();
        assert_eq!(report.iterations, 10);
        assert_eq!(report.max, 2.0);
        // Ends at 2, 3, 4, 5 µs past the first start fit a 5 µs budget.
        assert_eq!(report.finished, 4);
    }

    #[test]
    fn test_unsignaled_requests_are_skipped() {
        let records = vec![record(0, Some(3_000)), record(10, None), record(20, Some(1_020))];
        let report = LatencyReport::from_requests(&records, 0, ClockRate::NANOS, 180).unwrap();
        assert_eq!(report.iterations, 2);
        assert!(LatencyReport::from_requests(&[record(0, None)], 0, ClockRate::NANOS, 1).is_none());
        assert!(LatencyReport::from_requests(&records, 3, ClockRate::NANOS, 1).is_none());
    }

    #[test]
    fn test_clock_rate_is_applied() {
        let records = vec![record(0, Some(2_400))];
        let report =
            LatencyReport::from_requests(&records, 0, ClockRate::new(2.4e9), 180).unwrap();
        assert!((report.median - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_throughput_formula() {
        // 1000 requests, 100 warmup, 4096 B each, 1 ms from records[100].start
        // to the last end.
        let mut records: Vec<RequestRecord> = (0..1000u64).map(|i| record(i, None)).collect();
        records[100].start = 5_000_000;
        records[999].end = Some(6_000_000);

        let report =
            ThroughputReport::from_requests(&records, 100, 4096, ClockRate::NANOS).unwrap();
        assert_eq!(report.bytes, 900 * 4096);
        assert!((report.elapsed_secs - 1e-3).abs() < 1e-12);
        assert!((report.bytes_per_sec - 900.0 * 4096.0 / 1e-3).abs() < 1e-3);
        assert!((report.gbits_per_sec - 900.0 * 4096.0 * 8.0 / 1e-3 / 1e9).abs() < 1e-9);
    }

    #[test]
    fn test_throughput_needs_final_completion() {
        let records = vec![record(0, Some(10)), record(5, None)];
        assert!(ThroughputReport::from_requests(&records, 0, 8, ClockRate::NANOS).is_none());
    }

    #[test]
    fn test_report_row_format() {
        let records = vec![record(0, Some(1_500))];
        let report = LatencyReport::from_requests(&records, 0, ClockRate::NANOS, 180).unwrap();
        assert_eq!(
            report.to_string(),
            "64, 1, 1.500, 1.500, 1.500, 1.500, 0.000, 1.500, 1.500"
        );
    }

    #[test]
    fn test_digest_depends_on_order_and_content() {
        let a = Digest::of_chunks(2, [[1u8, 2], [3, 4]]);
        let b = Digest::of_chunks(2, [[1u8, 2], [3, 4]]);
        let c = Digest::of_chunks(2, [[3u8, 4], [1, 2]]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.hex().len(), 64);
        assert_eq!(a.count, 2);
        // Concatenation, not per-chunk hashing.
        assert_eq!(a.as_bytes(), Digest::of_chunks(4, [[1u8, 2, 3, 4]]).as_bytes());
    }
}
