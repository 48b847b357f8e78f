use drover_core::decision::Action;
use drover_core::prober::WorkerSnapshot;
use drover_core::Worker;
use serde::Serialize;

const GAP: &str = "  ";

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One line of a fixed-column table.
pub trait Row {
    const HEADERS: &'static [&'static str];
    fn cells(&self) -> Vec<String>;
}

impl<R: Row> Row for &R {
    const HEADERS: &'static [&'static str] = R::HEADERS;

    fn cells(&self) -> Vec<String> {
        (**self).cells()
    }
}

impl Row for Action {
    const HEADERS: &'static [&'static str] = &["WORKER", "ISSUE", "REASON"];

    fn cells(&self) -> Vec<String> {
        vec![
            format!("worker-{}", self.worker_id),
            or_dash(self.new_issue_id.or(self.issue_id).map(|id| format!("#{id}"))),
            self.reason.clone(),
        ]
    }
}

/// A worker record next to what this cycle observed of it.
pub struct WorkerRow<'a> {
    pub worker: &'a Worker,
    pub snapshot: &'a WorkerSnapshot,
}

impl Row for WorkerRow<'_> {
    const HEADERS: &'static [&'static str] = &[
        "WORKER", "ISSUE", "STATUS", "ALIVE", "SIGNAL", "LOG", "COMMITS", "RETRIES",
    ];

    fn cells(&self) -> Vec<String> {
        let (w, s) = (self.worker, self.snapshot);
        vec![
            format!("worker-{}", w.worker_id),
            or_dash(w.issue_id.map(|id| format!("#{id}"))),
            w.status.to_string(),
            if s.process_alive { "yes" } else { "no" }.to_string(),
            or_dash(s.signal_value),
            s.log_size.to_string(),
            s.new_commits.len().to_string(),
            w.retry_count.to_string(),
        ]
    }
}

pub fn print_rows<R: Row>(rows: impl IntoIterator<Item = R>) {
    let cells: Vec<Vec<String>> = rows.into_iter().map(|r| r.cells()).collect();
    print!("{}", render_table(R::HEADERS, &cells));
}

/// Left-aligned columns sized to their widest cell, with a dashed rule under
/// the header. Trailing padding is trimmed.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let mut out = padded_line(headers.iter(), &widths);
    let rule: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    out.push_str(&rule.join(GAP));
    out.push('\n');
    for row in rows {
        out.push_str(&padded_line(row.iter(), &widths));
    }
    out
}

fn padded_line<S: AsRef<str>>(cells: impl Iterator<Item = S>, widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .zip(widths)
        .map(|(c, &w)| format!("{:w$}", c.as_ref()))
        .collect();
    format!("{}\n", padded.join(GAP).trim_end())
}

/// `-` for absent values in table cells.
pub fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
