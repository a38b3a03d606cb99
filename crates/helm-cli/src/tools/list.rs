//! List directory tool

use async_trait::async_trait;
use helm_agent::tool::{ProgressSender, Tool, ToolOutput};
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::expand_home;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListArgs {
    path: Option<String>,
    recursive: bool,
    show_hidden: bool,
    limit: Option<usize>,
}

/// Sorted directory listing with sizes
#[derive(Default)]
pub struct ListDirTool;

impl ListDirTool {
    pub fn new() -> Self {
        Self
    }
}

struct Listing<'a> {
    base: &'a Path,
    show_hidden: bool,
    limit: usize,
    cancel: &'a CancellationToken,
    entries: Vec<String>,
}

impl Listing<'_> {
    fn full(&self) -> bool {
        self.cancel.is_cancelled() || self.entries.len() >= self.limit
    }

    fn collect(&mut self, dir: &Path, recursive: bool) {
        let read_dir = match fs::read_dir(dir) {
            Ok(d) => d,
            Err(e) => {
                if dir == self.base {
                    self.entries.push(format!("Error reading directory: {}", e));
                }
                return;
            }
        };

        let mut items: Vec<_> = read_dir.flatten().collect();
        items.sort_by_key(|e| e.path());

        for entry in items {
            if self.full() {
                break;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !self.show_hidden && name.starts_with('.') {
                continue;
            }
            if recursive && (name == "target" || name == "node_modules") {
                continue;
            }

            let full_path = entry.path();
            let relative = full_path.strip_prefix(self.base).unwrap_or(&full_path);
            let metadata = entry.metadata().ok();
            self.entries
                .push(format_entry(&relative.to_string_lossy(), &full_path, metadata.as_ref()));

            if recursive && full_path.is_dir() {
                self.collect(&full_path, true);
            }
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List contents of a directory with file sizes."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: working directory)" },
                "recursive": { "type": "boolean", "description": "Descend into subdirectories, skipping target/ and node_modules/" },
                "show_hidden": { "type": "boolean", "description": "Include dotfiles" },
                "limit": { "type": "integer", "minimum": 1, "description": "Maximum entries (default: 100)" }
            }
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolOutput {
        let args: ListArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(e) => return ToolOutput::error(format!("Invalid arguments: {}", e)),
        };
        let path = expand_home(args.path.as_deref().unwrap_or("."));
        let limit = args.limit.unwrap_or(DEFAULT_LIMIT);

        if !path.exists() {
            return ToolOutput::error(format!("Path does not exist: {}", path.display()));
        }
        if !path.is_dir() {
            return ToolOutput::error(format!("Path is not a directory: {}", path.display()));
        }

        let mut listing = Listing {
            base: &path,
            show_hidden: args.show_hidden,
            limit,
            cancel: &cancel,
            entries: Vec::new(),
        };
        listing.collect(&path, args.recursive);

        if cancel.is_cancelled() {
            return ToolOutput::error("List cancelled");
        }
        if listing.entries.is_empty() {
            return ToolOutput::text("(empty directory)");
        }

        let truncated = listing.entries.len() >= limit;
        let mut output = listing.entries.join("\n");
        if truncated {
            output.push_str(&format!("\n\n(showing first {} entries)", limit));
        }
        ToolOutput::text(output)
    }

    async fn execute_with_progress(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
        progress: ProgressSender,
    ) -> ToolOutput {
        if arguments.get("recursive").and_then(|v| v.as_bool()) == Some(true) {
            progress.send("walking directory tree");
        }
        self.execute(tool_call_id, arguments, cancel).await
    }
}

fn format_entry(name: &str, path: &Path, metadata: Option<&fs::Metadata>) -> String {
    let type_indicator = if path.is_dir() { "/" } else { "" };

    match metadata {
        Some(m) if path.is_file() => format!("{}{}\t{}", name, type_indicator, format_size(m.len())),
        Some(_) => format!("{}{}\t-", name, type_indicator),
        None => format!("{}{}", name, type_indicator),
    }
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2.0K");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0M");
    }

    #[tokio::test]
    async fn test_lists_sorted_and_skips_hidden() {
        let dir = std::env::temp_dir().join(format!("helm-list-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("b.txt"), "bb").unwrap();
        std::fs::write(dir.join(".hidden"), "").unwrap();
        std::fs::write(dir.join("sub/a.rs"), "a").unwrap();

        let output = ListDirTool::new()
            .execute(
                "call",
                json!({"path": dir.to_string_lossy(), "recursive": true}),
                CancellationToken::new(),
            )
            .await;
        std::fs::remove_dir_all(&dir).unwrap();

        let lines: Vec<String> = output.text_content().lines().map(String::from).collect();
        assert_eq!(lines, vec!["b.txt\t2B", "sub/\t-", "sub/a.rs\t1B"]);
    }
}
