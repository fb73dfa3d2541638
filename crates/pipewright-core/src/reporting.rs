//! Build reports written next to a build's artifacts.
//!
//! - `build-record.json`: the finalized [`BuildRecord`]
//! - `summary.txt`: free-text build summary for operators
//! - `junit.xml`: one test case per stage, for CI dashboards

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

use crate::domain::{BuildRecord, FailureReason, StageStatus};

pub const BUILD_RECORD_FILE: &str = "build-record.json";
pub const SUMMARY_FILE: &str = "summary.txt";
pub const JUNIT_FILE: &str = "junit.xml";

/// Write the build record in pretty JSON format.
pub fn write_build_record_json(path: &Path, record: &BuildRecord) -> Result<()> {
    let content = serde_json::to_string_pretty(record).context("serialize build record")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Render the free-text build summary.
pub fn render_build_summary(record: &BuildRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Pipeline: {}", record.pipeline);
    let _ = writeln!(out, "Build: #{} ({})", record.build_id, record.run_id);
    let _ = writeln!(out, "Status: {}", record.status.as_str().to_uppercase());
    let _ = writeln!(out, "Started: {}", record.started_at.to_rfc3339());
    let _ = writeln!(out, "Finished: {}", record.finished_at.to_rfc3339());
    let _ = writeln!(out, "Duration: {}ms", record.duration_ms);
    if let Some(err) = &record.error {
        let _ = writeln!(out, "Error: {}", err);
    }
    out.push('\n');

    out.push_str("Stages:\n");
    for stage in &record.stages {
        let marker = match stage.status {
            StageStatus::Success => "✓",
            StageStatus::Unstable => "~",
            StageStatus::Failure => "✗",
        };
        let _ = write!(
            out,
            "  {} {} [{}] {}ms",
            marker, stage.name, stage.status, stage.duration_ms
        );
        if let Some(reason) = &stage.reason {
            let _ = write!(out, " ({})", reason);
        }
        if stage.non_fatal && stage.status == StageStatus::Failure {
            out.push_str(" non-fatal");
        }
        out.push('\n');
        for artifact in &stage.artifacts {
            let _ = writeln!(
                out,
                "      artifact {}: {}",
                artifact.name,
                artifact.source_path.display()
            );
        }
        for failure in &stage.post.failures {
            let _ = writeln!(out, "      post-action failed: {}", failure);
        }
    }
    let _ = writeln!(
        out,
        "\nSummary: {}/{} stages passed",
        record.passed_count(),
        record.stages.len()
    );

    if !record.warnings.is_empty() {
        out.push_str("\nWarnings:\n");
        for w in &record.warnings {
            let _ = writeln!(out, "  - {}", w);
        }
    }
    if !record.pruned_builds.is_empty() {
        let ids: Vec<String> = record.pruned_builds.iter().map(|b| b.to_string()).collect();
        let _ = writeln!(out, "\nPruned builds: {}", ids.join(", "));
    }
    let _ = writeln!(
        out,
        "Workspace destroyed: {}",
        if record.workspace_destroyed { "yes" } else { "no" }
    );
    out
}

pub fn write_build_summary(path: &Path, record: &BuildRecord) -> Result<()> {
    std::fs::write(path, render_build_summary(record)).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Render stages as a JUnit XML suite.
pub fn render_junit_xml(record: &BuildRecord) -> String {
    let failures = record
        .stages
        .iter()
        .filter(|s| s.status == StageStatus::Failure)
        .count();
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        out,
        "<testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" time=\"{:.3}\">",
        xml_escape(&record.pipeline),
        record.stages.len(),
        failures,
        record.duration_ms as f64 / 1000.0
    );
    for stage in &record.stages {
        let _ = write!(
            out,
            "  <testcase classname=\"{}.build-{}\" name=\"{}\" time=\"{:.3}\"",
            xml_escape(&record.pipeline),
            record.build_id,
            xml_escape(&stage.name),
            stage.duration_ms as f64 / 1000.0
        );
        match (&stage.status, &stage.reason) {
            (StageStatus::Failure, reason) => {
                let message = reason
                    .as_ref()
                    .map(FailureReason::to_string)
                    .unwrap_or_else(|| "failed".to_string());
                let _ = writeln!(out, ">");
                let _ = writeln!(
                    out,
                    "    <failure message=\"{}\">{}</failure>",
                    xml_escape(&message),
                    xml_escape(&tail(&stage.stderr, 4096))
                );
                out.push_str("  </testcase>\n");
            }
            (StageStatus::Unstable, _) => {
                let _ = writeln!(out, ">");
                out.push_str("    <system-out>unstable</system-out>\n");
                out.push_str("  </testcase>\n");
            }
            (StageStatus::Success, _) => out.push_str("/>\n"),
        }
    }
    out.push_str("</testsuite>\n");
    out
}

pub fn write_junit_xml(path: &Path, record: &BuildRecord) -> Result<()> {
    std::fs::write(path, render_junit_xml(record)).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Write all reports into `dir`, creating it if needed.
pub fn write_build_reports(dir: &Path, record: &BuildRecord) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
    write_build_record_json(&dir.join(BUILD_RECORD_FILE), record)?;
    write_build_summary(&dir.join(SUMMARY_FILE), record)?;
    write_junit_xml(&dir.join(JUNIT_FILE), record)?;
    Ok(())
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => out.push(c),
        }
    }
    out
}

/// Last `max` bytes of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BuildId, BuildRecorder, PostOutcome, StageResult};
    use chrono::Utc;

    fn stage(name: &str, status: StageStatus, reason: Option<FailureReason>) -> StageResult {
        let now = Utc::now();
        StageResult {
            name: name.to_string(),
            status,
            reason,
            exit_code: None,
            stdout: String::new(),
            stderr: "boom <&>".to_string(),
            commands: Vec::new(),
            started_at: now,
            finished_at: now,
            duration_ms: 1500,
            non_fatal: false,
            post: PostOutcome::default(),
            artifacts: Vec::new(),
        }
    }

    fn record() -> BuildRecord {
        let mut rec = BuildRecorder::start(BuildId(6), "etl", "abc".to_string());
        rec.push_stage(stage("checkout", StageStatus::Success, None));
        rec.push_stage(stage(
            "tests",
            StageStatus::Failure,
            Some(FailureReason::ExitCode { code: 1 }),
        ));
        rec.set_workspace_destroyed(true);
        rec.finish()
    }

    #[test]
    fn summary_lists_stages_and_status() {
        let text = render_build_summary(&record());
        assert!(text.contains("Build: #6"));
        assert!(text.contains("Status: FAILURE"));
        assert!(text.contains("✓ checkout"));
        assert!(text.contains("✗ tests [failure] 1500ms (exit code 1)"));
        assert!(text.contains("1/2 stages passed"));
        assert!(text.contains("Workspace destroyed: yes"));
    }

    #[test]
    fn junit_has_one_case_per_stage() {
        let xml = render_junit_xml(&record());
        assert!(xml.contains("tests=\"2\" failures=\"1\""));
        assert_eq!(xml.matches("<testcase").count(), 2);
        assert!(xml.contains("<failure message=\"exit code 1\">boom &lt;&amp;&gt;</failure>"));
    }

    #[test]
    fn reports_written_to_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("builds").join("6");
        write_build_reports(&out, &record()).expect("write reports");

        let raw = std::fs::read_to_string(out.join(BUILD_RECORD_FILE)).expect("read record");
        let parsed: BuildRecord = serde_json::from_str(&raw).expect("parse record");
        assert_eq!(parsed.build_id, BuildId(6));
        assert!(out.join(SUMMARY_FILE).exists());
        assert!(out.join(JUNIT_FILE).exists());
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let s = "ééééé";
        let t = tail(s, 3);
        assert!(s.ends_with(&t));
        assert!(t.len() <= 3);
    }
}
