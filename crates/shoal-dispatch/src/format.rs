use std::io::Write;

use serde_json::json;
use tokio::sync::mpsc;

use crate::error::DispatchError;
use crate::result::ResultEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMode {
    /// Oneline when stdout fits on one line and stderr is empty, multiline
    /// otherwise.
    Auto,
    Oneline,
    Multiline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON object per result, newline-separated, no header.
    Json,
    Text(TextMode),
}

/// Tallies for the exit-code mapping: any failure makes the invocation
/// report operational failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchSummary {
    pub total: usize,
    pub failures: usize,
}

const HOSTNAME_WIDTH: usize = 17;
const SERVICE_WIDTH: usize = 16;

/// Drain the result stream into `out`.
///
/// In immediate mode each result renders as it completes; otherwise results
/// buffer until the stream closes and then drain, still in completion order.
pub async fn consume<W: Write>(
    mut rx: mpsc::Receiver<ResultEvent>,
    format: OutputFormat,
    immediate: bool,
    out: &mut W,
) -> Result<DispatchSummary, DispatchError> {
    let mut summary = DispatchSummary::default();
    let mut buffered: Vec<ResultEvent> = Vec::new();

    while let Some(event) = rx.recv().await {
        summary.total += 1;
        if event.is_failure() {
            summary.failures += 1;
        }
        if immediate {
            write_event(&event, format, out)?;
        } else {
            buffered.push(event);
        }
    }
    for event in &buffered {
        write_event(event, format, out)?;
    }
    Ok(summary)
}

fn write_event<W: Write>(
    event: &ResultEvent,
    format: OutputFormat,
    out: &mut W,
) -> Result<(), DispatchError> {
    let rendered = match format {
        OutputFormat::Json => render_json(event),
        OutputFormat::Text(mode) => render_text(event, mode),
    };
    out.write_all(rendered.as_bytes()).map_err(|e| DispatchError::Io {
        path: "<output>".to_string(),
        source: e,
    })
}

/// The NDJSON shape: raw fields, no formatting of the command output.
pub fn render_json(event: &ResultEvent) -> String {
    let mut value = json!({
        "hostname": event.target.hostname(),
        "zonename": event.target.zonename(),
        "service": event.target.service_label(),
        "uuid": event.target.uuid(),
        "exit_status": event.exit_status,
        "stdout": event.stdout,
        "stderr": event.stderr,
    });
    if let Some(error) = &event.error {
        value["error"] = serde_json::to_value(error).unwrap_or_default();
    }
    format!("{}\n", value)
}

pub fn render_text(event: &ResultEvent, mode: TextMode) -> String {
    let oneline = match mode {
        TextMode::Oneline => true,
        TextMode::Multiline => false,
        TextMode::Auto => {
            event.error.is_none()
                && event.stderr.is_empty()
                && event.stdout.trim_end_matches('\n').lines().count() <= 1
        }
    };
    if oneline {
        render_oneline(event)
    } else {
        render_multiline(event)
    }
}

fn render_oneline(event: &ResultEvent) -> String {
    let output = match &event.error {
        Some(error) => status_line(error),
        None => event.stdout.trim_end_matches('\n').to_string(),
    };
    format!(
        "{:<hw$} {:<sw$} {}\n",
        event.target.hostname(),
        event.target.service_label(),
        output,
        hw = HOSTNAME_WIDTH,
        sw = SERVICE_WIDTH,
    )
}

fn render_multiline(event: &ResultEvent) -> String {
    let mut out = format!(
        "=== Output from {} ({} {}):\n",
        event.target.uuid(),
        event.target.hostname(),
        event.target.service_label(),
    );
    if let Some(error) = &event.error {
        out.push_str(&status_line(error));
        out.push('\n');
        return out;
    }
    out.push_str(&event.stdout);
    if !event.stdout.is_empty() && !event.stdout.ends_with('\n') {
        out.push('\n');
    }
    if !event.stderr.is_empty() {
        out.push_str("--- stderr:\n");
        out.push_str(&event.stderr);
        if !event.stderr.ends_with('\n') {
            out.push('\n');
        }
    }
    if event.exit_status != Some(0) {
        out.push_str(&format!(
            "--- exit status: {}\n",
            event
                .exit_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string())
        ));
    }
    out
}

fn status_line(error: &crate::result::ResultError) -> String {
    use crate::result::ResultError;
    match error {
        ResultError::Timeout { after_ms } => {
            format!("error: timed out after {}ms", after_ms)
        }
        ResultError::Dispatch { message } => {
            format!("error: dispatch failed: {}", message)
        }
        ResultError::Transport { message } => {
            format!("error: transport failed: {}", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ResultError;
    use crate::scope::Target;
    use shoal_domain::{ComputeId, InstanceId, ServiceName};

    fn event(exit: Option<i32>, stdout: &str, stderr: &str, error: Option<ResultError>) -> ResultEvent {
        ResultEvent {
            target: Target::Instance {
                instance_id: InstanceId::new("i-1"),
                service: ServiceName::new_unchecked("medusa"),
                compute: ComputeId::new("cn1"),
                hostname: "host01".to_string(),
                primary_address: None,
            },
            exit_status: exit,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            error,
        }
    }

    #[test]
    fn json_lines_carry_every_field() {
        let line = render_json(&event(Some(0), "up 4 days\n", "", None));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["hostname"], "host01");
        assert_eq!(value["zonename"], "i-1");
        assert_eq!(value["service"], "medusa");
        assert_eq!(value["uuid"], "i-1");
        assert_eq!(value["exit_status"], 0);
        assert_eq!(value["stdout"], "up 4 days\n");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn json_includes_structured_errors() {
        let line = render_json(&event(None, "", "", Some(ResultError::Timeout { after_ms: 5000 })));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["error"]["kind"], "timeout");
        assert_eq!(value["error"]["after_ms"], 5000);
    }

    #[test]
    fn auto_uses_oneline_for_single_line_output() {
        let text = render_text(&event(Some(0), "ok\n", "", None), TextMode::Auto);
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("host01"));
        assert!(text.ends_with("ok\n"));
    }

    #[test]
    fn auto_uses_multiline_when_stderr_present() {
        let text = render_text(&event(Some(1), "out\n", "boom\n", None), TextMode::Auto);
        assert!(text.starts_with("=== Output from i-1"));
        assert!(text.contains("--- stderr:\nboom\n"));
        assert!(text.contains("--- exit status: 1"));
    }

    #[test]
    fn oneline_columns_are_fixed_width() {
        let a = render_text(&event(Some(0), "x", "", None), TextMode::Oneline);
        let b = render_text(&event(Some(0), "y", "", None), TextMode::Oneline);
        let col = |s: &str| s.rfind(' ').map(|i| i + 1);
        assert_eq!(col(&a), col(&b));
    }

    #[tokio::test]
    async fn buffered_consumption_preserves_completion_order() {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        for (i, exit) in [(1, 0), (2, 1), (3, 0)] {
            let mut ev = event(Some(exit), &format!("line-{}\n", i), "", None);
            if let Target::Instance { instance_id, .. } = &mut ev.target {
                *instance_id = InstanceId::new(format!("i-{}", i));
            }
            tx.send(ev).await.unwrap();
        }
        drop(tx);

        let mut out = Vec::new();
        let summary = consume(rx, OutputFormat::Text(TextMode::Oneline), false, &mut out)
            .await
            .unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failures, 1);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].ends_with("line-1"));
        assert!(lines[2].ends_with("line-3"));
    }
}
