//! Display parts, display sinks and response processors

use helm_ai::{ResponseDelta, ThinkingDelta};
use std::sync::Arc;

use crate::tool::PullRequestInfo;

/// Something the user should see
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    Markdown(String),
    Thinking(String),
    ToolInvocation { id: String, name: String },
    Progress(String),
    /// A question for the user, e.g. whether to raise the tool-call limit
    Confirmation { title: String, message: String },
    PullRequest(PullRequestInfo),
    Reference(String),
    Warning(String),
}

/// Receives display parts for one iteration.
///
/// `finalize` is called exactly once per iteration, after which the sink
/// receives nothing more for that iteration.
pub trait DisplaySink: Send + Sync {
    fn push(&self, part: ResponsePart);
    fn finalize(&self);
}

/// Finalizes a sink exactly once, on the first explicit call or on drop
pub struct FinalizeGuard {
    sink: Arc<dyn DisplaySink>,
    done: bool,
}

impl FinalizeGuard {
    pub fn new(sink: Arc<dyn DisplaySink>) -> Self {
        Self { sink, done: false }
    }

    pub fn finalize(&mut self) {
        if !self.done {
            self.done = true;
            self.sink.finalize();
        }
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Turns streamed deltas into display parts.
pub trait ResponseProcessor: Send {
    fn process(&mut self, delta: &ResponseDelta, out: &mut Vec<ResponsePart>);

    /// True once the processor wants no more model output
    fn is_done(&self) -> bool {
        false
    }

    /// Emit anything still buffered
    fn flush(&mut self, _out: &mut Vec<ResponsePart>) {}
}

/// Builds a fresh processor for each iteration
pub type ProcessorFactory = Arc<dyn Fn() -> Box<dyn ResponseProcessor> + Send + Sync>;

/// A text marker that suppresses output until its `start` marker shows up.
/// Without a `start` marker the response is done at `stop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopStartMapping {
    pub stop: String,
    pub start: Option<String>,
}

/// Default processor. With no mappings it passes everything through.
#[derive(Debug, Default)]
pub struct PseudoStopStartProcessor {
    mappings: Vec<StopStartMapping>,
    buffer: String,
    suppressing: Option<usize>,
    done: bool,
}

impl PseudoStopStartProcessor {
    pub fn new(mappings: Vec<StopStartMapping>) -> Self {
        Self {
            mappings: mappings.into_iter().filter(|m| !m.stop.is_empty()).collect(),
            ..Default::default()
        }
    }

    /// Length of the longest buffer suffix that could begin one of `markers`
    fn held_back<'a>(buffer: &str, markers: impl Iterator<Item = &'a str> + Clone) -> usize {
        let longest = markers.clone().map(str::len).max().unwrap_or(0);
        let max = longest.saturating_sub(1).min(buffer.len());
        (1..=max)
            .rev()
            .find(|&k| {
                let start = buffer.len() - k;
                buffer.is_char_boundary(start)
                    && markers.clone().any(|m| m.starts_with(&buffer[start..]))
            })
            .unwrap_or(0)
    }

    fn process_text(&mut self, text: &str, out: &mut Vec<ResponsePart>) {
        if self.done {
            return;
        }
        self.buffer.push_str(text);

        loop {
            if let Some(index) = self.suppressing {
                let Some(start) = self.mappings[index].start.clone() else {
                    self.done = true;
                    self.buffer.clear();
                    return;
                };
                match self.buffer.find(&start) {
                    Some(pos) => {
                        self.buffer.drain(..pos + start.len());
                        self.suppressing = None;
                    }
                    None => {
                        let keep = Self::held_back(&self.buffer, std::iter::once(start.as_str()));
                        self.buffer.drain(..self.buffer.len() - keep);
                        return;
                    }
                }
                continue;
            }

            let found = self
                .mappings
                .iter()
                .enumerate()
                .filter_map(|(i, m)| self.buffer.find(&m.stop).map(|pos| (pos, i)))
                .min();

            match found {
                Some((pos, index)) => {
                    if pos > 0 {
                        out.push(ResponsePart::Markdown(self.buffer[..pos].to_string()));
                    }
                    self.buffer.drain(..pos + self.mappings[index].stop.len());
                    if self.mappings[index].start.is_none() {
                        self.done = true;
                        self.buffer.clear();
                        return;
                    }
                    self.suppressing = Some(index);
                }
                None => {
                    let keep =
                        Self::held_back(&self.buffer, self.mappings.iter().map(|m| m.stop.as_str()));
                    let emit = self.buffer.len() - keep;
                    if emit > 0 {
                        out.push(ResponsePart::Markdown(self.buffer[..emit].to_string()));
                        self.buffer.drain(..emit);
                    }
                    return;
                }
            }
        }
    }
}

impl ResponseProcessor for PseudoStopStartProcessor {
    fn process(&mut self, delta: &ResponseDelta, out: &mut Vec<ResponsePart>) {
        for thinking in &delta.thinking {
            if let ThinkingDelta::Text(text) = thinking {
                out.push(ResponsePart::Thinking(text.clone()));
            }
        }
        if !delta.text.is_empty() {
            self.process_text(&delta.text, out);
        }
        for call in &delta.begin_tool_calls {
            out.push(ResponsePart::ToolInvocation {
                id: call.id.clone(),
                name: call.name.clone(),
            });
        }
        for annotation in &delta.annotations {
            let reference = annotation
                .get("url")
                .and_then(|u| u.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| annotation.to_string());
            out.push(ResponsePart::Reference(reference));
        }
        if let Some(error) = &delta.error {
            out.push(ResponsePart::Warning(format!(
                "{}: {}",
                error.error_type, error.message
            )));
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn flush(&mut self, out: &mut Vec<ResponsePart>) {
        if !self.done && self.suppressing.is_none() && !self.buffer.is_empty() {
            out.push(ResponsePart::Markdown(std::mem::take(&mut self.buffer)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_ai::{BeginToolCall, StreamError};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        finalized: AtomicUsize,
        parts: Mutex<Vec<ResponsePart>>,
    }

    impl DisplaySink for CountingSink {
        fn push(&self, part: ResponsePart) {
            self.parts.lock().push(part);
        }
        fn finalize(&self) {
            self.finalized.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn run(processor: &mut PseudoStopStartProcessor, chunks: &[&str]) -> String {
        let mut out = Vec::new();
        for chunk in chunks {
            processor.process(&ResponseDelta::text(*chunk), &mut out);
        }
        processor.flush(&mut out);
        out.into_iter()
            .map(|p| match p {
                ResponsePart::Markdown(text) => text,
                other => panic!("unexpected part {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_guard_finalizes_once() {
        let sink = Arc::new(CountingSink::default());
        {
            let mut guard = FinalizeGuard::new(sink.clone());
            guard.finalize();
            guard.finalize();
        }
        assert_eq!(sink.finalized.load(Ordering::SeqCst), 1);

        drop(FinalizeGuard::new(sink.clone()));
        assert_eq!(sink.finalized.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pass_through_by_default() {
        let mut processor = PseudoStopStartProcessor::default();
        assert_eq!(run(&mut processor, &["Hello ", "world\n"]), "Hello world\n");
        assert!(!processor.is_done());
    }

    #[test]
    fn test_suppresses_between_markers_split_across_chunks() {
        let mut processor = PseudoStopStartProcessor::new(vec![StopStartMapping {
            stop: "<hide>".into(),
            start: Some("</hide>".into()),
        }]);
        let text = run(
            &mut processor,
            &["visible <hi", "de>secret</hi", "de> again"],
        );
        assert_eq!(text, "visible  again");
    }

    #[test]
    fn test_stop_without_start_finishes() {
        let mut processor = PseudoStopStartProcessor::new(vec![StopStartMapping {
            stop: "<END>".into(),
            start: None,
        }]);
        let text = run(&mut processor, &["answer\n<E", "ND>trailing"]);
        assert_eq!(text, "answer\n");
        assert!(processor.is_done());
    }

    #[test]
    fn test_structured_parts() {
        let mut processor = PseudoStopStartProcessor::default();
        let delta = ResponseDelta {
            begin_tool_calls: vec![BeginToolCall {
                id: "call_1".into(),
                name: "read_file".into(),
            }],
            thinking: vec![ThinkingDelta::Text("pondering".into())],
            annotations: vec![serde_json::json!({"url": "https://docs.rs"})],
            error: Some(StreamError {
                error_type: "overloaded_error".into(),
                message: "busy".into(),
            }),
            ..Default::default()
        };
        let mut out = Vec::new();
        processor.process(&delta, &mut out);
        assert_eq!(
            out,
            vec![
                ResponsePart::Thinking("pondering".into()),
                ResponsePart::ToolInvocation {
                    id: "call_1".into(),
                    name: "read_file".into()
                },
                ResponsePart::Reference("https://docs.rs".into()),
                ResponsePart::Warning("overloaded_error: busy".into()),
            ]
        );
    }
}
