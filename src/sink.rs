// Sink module - delivers completed traces for downstream analysis
//
// Two built-in sinks: an indented text dump for eyeballing traces (one
// span header per line, events nested beneath), and a JSON Lines file
// with one JSON object per trace for tooling (grep, jq, downstream
// stores).

use crate::tracer::TraceDump;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

pub trait TraceSink: Send {
    fn accept(&mut self, trace: &TraceDump) -> Result<()>;

    /// Flush buffered output; called once after the last trace.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}

/// Render one trace in the indented text format.
pub fn render_text(trace: &TraceDump) -> String {
    let mut out = String::new();
    out.push_str(&format!("trace {}\n", trace.id));
    for span in &trace.spans {
        indent(&mut out, span.depth + 1);
        out.push_str(&format!("id: {}, kind: {}", span.id, span.kind));
        if let Some(trigger) = span.triggered_by {
            out.push_str(&format!(", triggered_by: {}", trigger));
        }
        if !span.children.is_empty() {
            let ids: Vec<String> = span.children.iter().map(|id| id.to_string()).collect();
            out.push_str(&format!(", triggered: {}", ids.join(", ")));
        }
        out.push('\n');
        for event in &span.events {
            indent(&mut out, span.depth + 2);
            out.push_str(event);
            out.push('\n');
        }
    }
    out
}

/// Writes the indented dump to stdout or a file.
pub struct TextSink {
    path: Option<PathBuf>,
    buffer: String,
}

impl TextSink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            buffer: String::new(),
        }
    }
}

impl TraceSink for TextSink {
    fn accept(&mut self, trace: &TraceDump) -> Result<()> {
        let rendered = render_text(trace);
        match &self.path {
            Some(_) => self.buffer.push_str(&rendered),
            None => print!("{rendered}"),
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(path) = &self.path {
            std::fs::write(path, &self.buffer)
                .with_context(|| format!("failed to write trace dump {}", path.display()))?;
        }
        Ok(())
    }
}

/// One JSON object per trace, append-mode: easy to stream, grep, and
/// parse with standard tools.
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("failed to create sink directory")?;
            }
        }
        Ok(Self { path })
    }
}

impl TraceSink for JsonLinesSink {
    fn accept(&mut self, trace: &TraceDump) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open sink file {}", self.path.display()))?;
        let json = serde_json::to_string(trace).context("failed to serialize trace")?;
        writeln!(file, "{json}").context("failed to write trace")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Sym;
    use crate::tracer::SpanDump;

    fn sample_trace() -> TraceDump {
        TraceDump {
            id: 3,
            spans: vec![
                SpanDump {
                    id: 0,
                    kind: "host_call",
                    spanner: Sym::from("host-client"),
                    source_id: Some(0),
                    source_name: Some(Sym::from("gem5-client")),
                    start_ts: Some(1),
                    end_ts: Some(5),
                    parent: None,
                    triggered_by: None,
                    children: vec![1],
                    pending: false,
                    depth: 0,
                    events: vec!["HostCall: source_id=0, source_name=gem5-client, timestamp=1"
                        .to_string()],
                },
                SpanDump {
                    id: 1,
                    kind: "host_mmio",
                    spanner: Sym::from("host-client"),
                    source_id: Some(0),
                    source_name: Some(Sym::from("gem5-client")),
                    start_ts: Some(2),
                    end_ts: Some(4),
                    parent: Some(0),
                    triggered_by: Some(0),
                    children: vec![],
                    pending: false,
                    depth: 1,
                    events: vec![],
                },
            ],
        }
    }

    #[test]
    fn test_render_text_indents_by_depth() {
        let text = render_text(&sample_trace());
        assert!(text.starts_with("trace 3\n"));
        assert!(text.contains("\tid: 0, kind: host_call, triggered: 1\n"));
        assert!(text.contains("\t\tHostCall: source_id=0"));
        assert!(text.contains("\t\tid: 1, kind: host_mmio, triggered_by: 0\n"));
    }

    #[test]
    fn test_jsonl_sink_writes_one_line_per_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traces.jsonl");
        let mut sink = JsonLinesSink::new(path.clone()).unwrap();
        sink.accept(&sample_trace()).unwrap();
        sink.accept(&sample_trace()).unwrap();
        sink.finish().unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["id"], 3);
        assert_eq!(parsed["spans"][0]["kind"], "host_call");
        assert_eq!(parsed["spans"][1]["triggered_by"], 0);
    }

    #[test]
    fn test_text_sink_writes_file_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.txt");
        let mut sink = TextSink::new(Some(path.clone()));
        sink.accept(&sample_trace()).unwrap();
        sink.finish().unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("trace 3"));
    }
}
