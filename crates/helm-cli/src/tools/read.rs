//! read_file: a numbered window of a text file

use async_trait::async_trait;
use helm_agent::tool::{Tool, ToolOutput};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::expand_home;

const DEFAULT_WINDOW: usize = 2000;
const MAX_LINE_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
struct ReadArgs {
    path: String,
    /// 1-indexed first line
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Default)]
pub struct ReadFileTool;

impl ReadFileTool {
    pub fn new() -> Self {
        Self
    }
}

/// Render lines `[start, start + len)` with line numbers, plus a trailer
/// describing what was left out
fn render_window(content: &str, start: usize, len: usize) -> Result<String, String> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Ok("(empty file)".to_string());
    }
    if start >= lines.len() {
        return Err(format!(
            "Offset {} is past the last line ({})",
            start + 1,
            lines.len()
        ));
    }

    let end = lines.len().min(start.saturating_add(len));
    let width = end.to_string().len();
    let mut clipped = false;
    let mut out = String::new();
    for (i, line) in lines[start..end].iter().enumerate() {
        let mut chars = line.chars();
        let shown: String = chars.by_ref().take(MAX_LINE_CHARS).collect();
        clipped |= chars.next().is_some();
        out.push_str(&format!("{:>width$}\t{}\n", start + i + 1, shown));
    }

    if clipped {
        out.push_str(&format!("\n[lines longer than {} chars were clipped]", MAX_LINE_CHARS));
    }
    if end < lines.len() {
        out.push_str(&format!(
            "\n[{} of {} lines shown; continue with offset={}]",
            end - start,
            lines.len(),
            end + 1
        ));
    }
    Ok(out.trim_end().to_string())
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file. Lines are numbered; use offset and limit to page through large files."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path, absolute or relative to the working directory" },
                "offset": { "type": "integer", "minimum": 1, "description": "First line to show (1-indexed)" },
                "limit": { "type": "integer", "minimum": 1, "description": "Number of lines to show" }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolOutput {
        let args: ReadArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(e) => return ToolOutput::error(format!("Invalid arguments: {}", e)),
        };
        let path = expand_home(&args.path);

        let content = tokio::select! {
            _ = cancel.cancelled() => return ToolOutput::error("Read cancelled"),
            read = tokio::fs::read_to_string(&path) => match read {
                Ok(content) => content,
                Err(e) => return ToolOutput::error(format!("Failed to read {}: {}", path.display(), e)),
            },
        };

        let start = args.offset.unwrap_or(1).saturating_sub(1);
        match render_window(&content, start, args.limit.unwrap_or(DEFAULT_WINDOW)) {
            Ok(text) => ToolOutput::text(text),
            Err(message) => ToolOutput::error(message),
        }
    }
}
