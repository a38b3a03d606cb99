//! Terminal output for loop parts and events

use helm_agent::{DisplaySink, LoopEvent, ResponsePart};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

/// Truncate a string to `max` characters, appending "..." if truncated.
/// Operates on Unicode char boundaries, not bytes.
pub fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Prints streamed parts to stdout; diagnostics go to stderr
pub struct TerminalSink {
    verbose: bool,
    /// Streamed text has been printed without a trailing newline
    line_open: AtomicBool,
}

impl TerminalSink {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            line_open: AtomicBool::new(false),
        }
    }

    fn close_line(&self) {
        if self.line_open.swap(false, Ordering::AcqRel) {
            println!();
        }
    }
}

impl DisplaySink for TerminalSink {
    fn push(&self, part: ResponsePart) {
        match part {
            ResponsePart::Markdown(text) => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
                self.line_open.store(!text.ends_with('\n'), Ordering::Release);
            }
            ResponsePart::Thinking(text) => {
                if self.verbose {
                    eprint!("{}", text);
                }
            }
            ResponsePart::ToolInvocation { name, .. } => {
                self.close_line();
                println!("[Calling {}...]", name);
            }
            ResponsePart::Progress(message) => {
                self.close_line();
                println!("[{}]", message);
            }
            ResponsePart::Confirmation { title, message } => {
                self.close_line();
                println!("\n{}\n{}", title, message);
            }
            ResponsePart::PullRequest(pr) => {
                self.close_line();
                println!("[Pull request #{}: {} ({})]", pr.number, pr.title, pr.url);
            }
            ResponsePart::Reference(path) => {
                if self.verbose {
                    eprintln!("[ref {}]", path);
                }
            }
            ResponsePart::Warning(message) => {
                self.close_line();
                eprintln!("Warning: {}", message);
            }
        }
    }

    fn finalize(&self) {
        self.close_line();
    }
}

/// Print the loop events the sink does not cover
pub fn print_event(event: &LoopEvent, verbose: bool) {
    match event {
        LoopEvent::ToolProgress {
            tool_name, content, ..
        } => {
            println!("[{}: {}]", tool_name, content);
        }
        LoopEvent::ToolEnd {
            tool_name,
            result,
            is_error,
            ..
        } => {
            if *is_error {
                println!("[{} failed: {}]", tool_name, truncate_chars(result, 200));
            } else if verbose {
                println!("[{}: {}]", tool_name, truncate_chars(result, 200));
            }
        }
        LoopEvent::StopHookBlocked { reasons, .. } => {
            println!("[Stop hook asked to continue: {}]", reasons.join("; "));
        }
        LoopEvent::SummarizationStarted { prompt_tokens } => {
            println!("[Summarizing history at ~{} tokens]", prompt_tokens);
        }
        LoopEvent::MessagesFiltered { count } if verbose => {
            eprintln!("[Dropped {} orphaned tool messages]", count);
        }
        LoopEvent::Error { message } => {
            eprintln!("Error: {}", message);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello world", 5), "hello...");
        assert_eq!(truncate_chars("ééé", 2), "éé...");
    }
}
