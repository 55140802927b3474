//! Aggregation and rendering of a finished run.
//!
//! [`Report::build`] folds the collected [`TransactionResult`]s into a
//! summary, one [`StepReport`] per step position, a latency histogram and an
//! optional percentile table. The text form goes to the task's output sink;
//! with an output directory the same text is saved as `report.txt` next to
//! one CSV file per distinct step URL.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::result::{ResultDetail, TransactionResult};
use crate::stats::{Bucket, Percentile, PhaseStats, Samples};

pub const CSV_HEADER: &str = "response-time,DNS+dialup,DNS,Request-before,Request-write,\
Response-delay,Response-after,Response-read";

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// RFC 3339 time at which the report was built
    pub generated_at: String,
    pub summary: Summary,
    pub steps: Vec<StepReport>,
    pub histogram: Vec<Bucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<Vec<Percentile>>,
}

/// Whole-iteration figures, in seconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub iterations: usize,
    /// Wall time of the run net of think-time
    pub total: f64,
    pub before_hook_total: f64,
    pub after_hook_total: f64,
    pub fastest: f64,
    pub slowest: f64,
    pub average: f64,
    pub requests_per_sec: f64,
}

/// Breakdown of one step position across all iterations.
///
/// Phase statistics cover successful requests only; failures are counted in
/// `errors` by message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepReport {
    pub url: String,
    pub method: String,
    pub successes: usize,
    pub dns_dial: PhaseStats,
    pub dns: PhaseStats,
    pub before_hook: PhaseStats,
    pub write: PhaseStats,
    pub wait: PhaseStats,
    pub after_hook: PhaseStats,
    pub read: PhaseStats,
    pub status_codes: BTreeMap<u16, usize>,
    pub errors: BTreeMap<String, usize>,
    pub size_total: u64,
    pub size_per_request: u64,
    #[serde(skip)]
    rows: Vec<Row>,
}

/// One CSV line: a successful request's timings in seconds.
#[derive(Debug, Clone, Copy, Default)]
struct Row {
    response_time: f64,
    dns_dial: f64,
    dns: f64,
    before_hook: f64,
    write: f64,
    wait: f64,
    after_hook: f64,
    read: f64,
}

impl Row {
    fn from_detail(detail: &ResultDetail) -> Self {
        let phases = &detail.phases;
        Self {
            response_time: detail.duration.as_secs_f64(),
            dns_dial: (phases.dns + phases.connect).as_secs_f64(),
            dns: phases.dns.as_secs_f64(),
            before_hook: detail.before_hook.as_secs_f64(),
            write: phases.write.as_secs_f64(),
            wait: phases.wait.as_secs_f64(),
            after_hook: detail.after_hook.as_secs_f64(),
            read: phases.read.as_secs_f64(),
        }
    }
}

impl StepReport {
    fn record(&mut self, detail: &ResultDetail) {
        self.url.clone_from(&detail.url);
        self.method.clone_from(&detail.method);
        if let Some(err) = &detail.error {
            *self.errors.entry(err.to_string()).or_default() += 1;
            return;
        }
        *self.status_codes.entry(detail.status).or_default() += 1;
        self.size_total += detail.content_length;
        self.rows.push(Row::from_detail(detail));
    }

    fn finalize(mut self) -> Self {
        let rows = std::mem::take(&mut self.rows);
        let column = |f: fn(&Row) -> f64| Samples::new(rows.iter().map(f).collect()).summary();
        self.dns_dial = column(|r: &Row| r.dns_dial);
        self.dns = column(|r: &Row| r.dns);
        self.before_hook = column(|r: &Row| r.before_hook);
        self.write = column(|r: &Row| r.write);
        self.wait = column(|r: &Row| r.wait);
        self.after_hook = column(|r: &Row| r.after_hook);
        self.read = column(|r: &Row| r.read);
        self.successes = rows.len();
        if self.successes > 0 {
            self.size_per_request = self.size_total / self.successes as u64;
        }
        self.rows = rows;
        self
    }

    fn write_csv_rows(&self, out: &mut String) {
        for r in &self.rows {
            let _ = writeln!(
                out,
                "{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4}",
                r.response_time,
                r.dns_dial,
                r.dns,
                r.before_hook,
                r.write,
                r.wait,
                r.after_hook,
                r.read
            );
        }
    }
}

impl Report {
    pub fn build(results: &[TransactionResult], elapsed: Duration, percentiles: bool) -> Self {
        let latencies = Samples::new(results.iter().map(|r| r.duration.as_secs_f64()).collect());

        let mut steps: Vec<StepReport> = Vec::new();
        let mut before_hook_total = Duration::ZERO;
        let mut after_hook_total = Duration::ZERO;
        for result in results {
            for (i, detail) in result.details.iter().enumerate() {
                if steps.len() <= i {
                    steps.push(StepReport::default());
                }
                if detail.is_success() {
                    before_hook_total += detail.before_hook;
                    after_hook_total += detail.after_hook;
                }
                steps[i].record(detail);
            }
        }

        let total = elapsed.as_secs_f64();
        let summary = Summary {
            iterations: latencies.len(),
            total,
            before_hook_total: before_hook_total.as_secs_f64(),
            after_hook_total: after_hook_total.as_secs_f64(),
            fastest: latencies.fastest(),
            slowest: latencies.slowest(),
            average: latencies.average(),
            requests_per_sec: if total > 0.0 {
                latencies.len() as f64 / total
            } else {
                0.0
            },
        };

        Self {
            generated_at: Utc::now().to_rfc3339(),
            summary,
            steps: steps.into_iter().map(StepReport::finalize).collect(),
            histogram: latencies.histogram(),
            percentiles: percentiles.then(|| latencies.percentiles()),
        }
    }

    /// Human-readable report.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let s = &self.summary;
        let _ = writeln!(out, "\nSummary:");
        if s.iterations == 0 {
            let _ = writeln!(out, "  No iterations completed.");
            return out;
        }
        let _ = writeln!(out, "  Total:\t\t{:.4} secs", s.total);
        let _ = writeln!(out, "  Iterations:\t\t{}", s.iterations);
        let _ = writeln!(out, "  ReqBeforeTotal:\t{:.4} secs", s.before_hook_total);
        let _ = writeln!(out, "  ResAfterTotal:\t{:.4} secs", s.after_hook_total);
        let _ = writeln!(out, "  Slowest:\t\t{:.4} secs", s.slowest);
        let _ = writeln!(out, "  Fastest:\t\t{:.4} secs", s.fastest);
        let _ = writeln!(out, "  Average:\t\t{:.4} secs", s.average);
        let _ = writeln!(out, "  Requests/sec:\t\t{:.4}", s.requests_per_sec);

        let _ = writeln!(out, "\nDetailed Report:");
        for step in &self.steps {
            let _ = writeln!(out, "\n  URL:  [{}] {}", step.method, step.url);
            if step.successes > 0 {
                render_section(&mut out, "DNS+dialup", &step.dns_dial);
                render_section(&mut out, "DNS-lookup", &step.dns);
                render_section(&mut out, "Request Before", &step.before_hook);
                render_section(&mut out, "Request Write", &step.write);
                render_section(&mut out, "Response Wait", &step.wait);
                render_section(&mut out, "Response After", &step.after_hook);
                render_section(&mut out, "Response Read", &step.read);
                if step.size_total > 0 {
                    let _ = writeln!(out, "\n\tResponse Summary:");
                    let _ = writeln!(out, "\t\tTotal data:\t{} bytes", step.size_total);
                    let _ = writeln!(out, "\t\tSize/request:\t{} bytes", step.size_per_request);
                }
                let _ = writeln!(out, "\n\tStatus code distribution:");
                for (code, count) in &step.status_codes {
                    let _ = writeln!(out, "\t\t[{code}]\t{count} responses");
                }
            }
            if !step.errors.is_empty() {
                let _ = writeln!(out, "\n\tError distribution:");
                for (message, count) in &step.errors {
                    let _ = writeln!(out, "\t\t[{count}]\t{message}");
                }
            }
        }

        let _ = writeln!(out, "\nResponse time histogram:");
        for bucket in &self.histogram {
            let _ = writeln!(
                out,
                "  {:.3} [{}]\t|{}",
                bucket.mark,
                bucket.count,
                "=".repeat(bucket.bar)
            );
        }

        if let Some(table) = &self.percentiles {
            let _ = writeln!(out, "\nLatency distribution:");
            for p in table {
                if let Some(latency) = p.latency {
                    let _ = writeln!(out, "  {}% in {:.4} secs", p.percent, latency);
                }
            }
        }
        out
    }

    /// CSV rows of every step that targets `url`.
    pub fn csv(&self, url: &str) -> String {
        let mut out = String::new();
        out.push_str(CSV_HEADER);
        out.push('\n');
        for step in self.steps.iter().filter(|s| s.url == url) {
            step.write_csv_rows(&mut out);
        }
        out
    }

    /// Writes `report.txt` and one CSV per distinct URL into `dir`.
    ///
    /// A file that cannot be written is logged and skipped; the others are
    /// still attempted. Returns the paths actually written.
    pub fn write_files(&self, dir: &Path, text: &str) -> Vec<PathBuf> {
        let mut written = Vec::new();

        let report_path = dir.join("report.txt");
        let contents = format!("Generated at {}\n{}", self.generated_at, text);
        save(&report_path, &contents, &mut written);

        let mut urls: Vec<&str> = self.steps.iter().map(|s| s.url.as_str()).collect();
        urls.sort_unstable();
        urls.dedup();
        for url in urls {
            let path = dir.join(format!("{}.csv", sanitize_file_name(url)));
            save(&path, &self.csv(url), &mut written);
        }
        written
    }
}

fn save(path: &Path, contents: &str, written: &mut Vec<PathBuf>) {
    match std::fs::write(path, contents) {
        Ok(()) => {
            debug!(path = %path.display(), "wrote report file");
            written.push(path.to_path_buf());
        }
        Err(e) => warn!(path = %path.display(), error = %e, "failed to write report file"),
    }
}

fn render_section(out: &mut String, tag: &str, stats: &PhaseStats) {
    let _ = writeln!(out, "\n\t{tag}:");
    let _ = writeln!(out, "  \t\tAverage:\t{:.4} secs", stats.average);
    let _ = writeln!(out, "  \t\tFastest:\t{:.4} secs", stats.fastest);
    let _ = writeln!(out, "  \t\tSlowest:\t{:.4} secs", stats.slowest);
}

/// Maps a URL to a file stem: every non-alphanumeric character becomes `_`.
pub fn sanitize_file_name(url: &str) -> String {
    let name: String = url
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let name = name.trim_matches('_');
    if name.is_empty() {
        "step".to_string()
    } else {
        name.to_string()
    }
}
