//! Built-in filesystem tools

mod list;
mod read;

pub use list::ListDirTool;
pub use read::ReadFileTool;

use std::path::PathBuf;

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    }
    PathBuf::from(path)
}
