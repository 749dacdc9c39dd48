//! CSV and print-report export helpers.
//!
//! These operate on plain records (JSON objects) so the dashboard can feed
//! them whatever result set it has on hand; nothing here touches storage or
//! the network.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

/// The assessment battery has six tests.
const TEST_TYPE_COUNT: u32 = 6;

/// Encode records as CSV.
///
/// The header row comes from the first record's keys, in insertion order;
/// every row renders those keys. String values containing a comma are
/// wrapped in quotes, missing and null fields render empty, and rows are
/// joined with newlines. No records, no output.
pub fn to_csv(records: &[Map<String, Value>]) -> String {
  let first = match records.first() {
    Some(first) => first,
    None => return String::new(),
  };
  let headers: Vec<&str> = first.keys().map(String::as_str).collect();

  let mut lines = Vec::with_capacity(records.len() + 1);
  lines.push(headers.join(","));
  for record in records {
    let fields: Vec<String> = headers.iter().map(|h| csv_field(record.get(*h))).collect();
    lines.push(fields.join(","));
  }
  lines.join("\n")
}

fn csv_field(value: Option<&Value>) -> String {
  match value {
    None | Some(Value::Null) => String::new(),
    Some(Value::Bool(b)) => b.to_string(),
    Some(Value::Number(n)) => n.to_string(),
    Some(Value::String(s)) => quote_if_comma(s),
    // Nested values render as compact JSON, same quoting rule.
    Some(other) => quote_if_comma(&other.to_string()),
  }
}

fn quote_if_comma(s: &str) -> String {
  if s.contains(',') {
    format!("\"{}\"", s)
  } else {
    s.to_string()
  }
}

/// One athlete as the report sees them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AthleteSummary {
  pub name: String,
  #[serde(default)]
  pub state: Option<String>,
  #[serde(default)]
  pub performance_score: f64,
  #[serde(default)]
  pub tests_completed: u32,
}

/// Aggregates for one region.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionStats {
  pub state: String,
  pub athletes: u64,
  pub avg_score: f64,
}

/// Dashboard-level aggregates feeding the report summary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStats {
  #[serde(default)]
  pub total_athletes: u64,
  #[serde(default)]
  pub tests_completed: u64,
  #[serde(default)]
  pub avg_score: f64,
  #[serde(default)]
  pub state_data: Vec<RegionStats>,
}

/// Body of the performance report: summary block, top-10 ranking, and the
/// per-region table. Athletes without a score stay out of the ranking.
pub fn report_html(
  athletes: &[AthleteSummary],
  stats: &ReportStats,
  generated_at: DateTime<Utc>,
) -> String {
  let mut ranked: Vec<&AthleteSummary> = athletes
    .iter()
    .filter(|a| a.performance_score > 0.0)
    .collect();
  ranked.sort_by(|a, b| {
    b.performance_score
      .partial_cmp(&a.performance_score)
      .unwrap_or(std::cmp::Ordering::Equal)
  });
  ranked.truncate(10);

  let mut ranking_rows = String::new();
  for (index, athlete) in ranked.iter().enumerate() {
    ranking_rows.push_str(&format!(
      "      <tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}/{}</td></tr>\n",
      index + 1,
      athlete.name,
      athlete.state.as_deref().unwrap_or("Unknown"),
      athlete.performance_score,
      athlete.tests_completed,
      TEST_TYPE_COUNT,
    ));
  }

  let mut region_rows = String::new();
  if stats.state_data.is_empty() {
    region_rows.push_str("      <tr><td colspan=\"3\">No data available</td></tr>\n");
  } else {
    for region in &stats.state_data {
      region_rows.push_str(&format!(
        "      <tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
        region.state, region.athletes, region.avg_score,
      ));
    }
  }

  format!(
    r#"<h1>Athlete Performance Report</h1>
<div class="summary">
  <div class="summary-item"><strong>Report Generated:</strong> {generated}</div>
  <div class="summary-item"><strong>Total Athletes:</strong> {total}</div>
  <div class="summary-item"><strong>Total Tests Completed:</strong> {tests}</div>
  <div class="summary-item"><strong>Average Performance Score:</strong> {avg}</div>
</div>

<h2>Top 10 Performing Athletes</h2>
<table>
  <thead>
    <tr><th>Rank</th><th>Name</th><th>State</th><th>Performance Score</th><th>Tests Completed</th></tr>
  </thead>
  <tbody>
{ranking_rows}  </tbody>
</table>

<h2>State-wise Distribution</h2>
<table>
  <thead>
    <tr><th>State</th><th>Number of Athletes</th><th>Average Score</th></tr>
  </thead>
  <tbody>
{region_rows}  </tbody>
</table>
"#,
    generated = generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
    total = stats.total_athletes,
    tests = stats.tests_completed,
    avg = stats.avg_score,
  )
}

const PRINT_STYLE: &str = r#"body {
  font-family: Arial, sans-serif;
  padding: 20px;
  color: #333;
}
h1 {
  color: #1e40af;
  border-bottom: 2px solid #1e40af;
  padding-bottom: 10px;
}
h2 {
  color: #3b82f6;
  margin-top: 30px;
}
table {
  width: 100%;
  border-collapse: collapse;
  margin: 20px 0;
}
th, td {
  border: 1px solid #ddd;
  padding: 12px;
  text-align: left;
}
th {
  background-color: #3b82f6;
  color: white;
}
tr:nth-child(even) {
  background-color: #f9fafb;
}
.summary {
  background-color: #eff6ff;
  padding: 15px;
  border-radius: 8px;
  margin: 20px 0;
}
.summary-item {
  margin: 10px 0;
}
.summary-item strong {
  color: #1e40af;
}"#;

/// Wrap a report body in a standalone print-ready HTML document.
pub fn print_document(title: &str, body: &str) -> String {
  format!(
    r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
{style}
</style>
</head>
<body>
{body}
</body>
</html>
"#,
    title = title,
    style = PRINT_STYLE,
    body = body,
  )
}
