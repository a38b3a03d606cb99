//! Completion accumulator
//!
//! Consumes provider-neutral [`StreamEvent`]s and keeps per-choice state:
//! accumulated text, raw chunks, tool-call argument buffers, thinking payload
//! and annotations. The caller's finished callback is consulted only at
//! segmentation points (a newline, a structured payload, or a terminal
//! marker), and each choice is finalized at most once.
//!
//! [`CompletionStream`] wraps the accumulator as a pull-based iterator over a
//! raw frame stream: every call to [`CompletionStream::next`] awaits at most
//! one frame from the transport.

use std::collections::{BTreeMap, HashMap, VecDeque};

use futures::StreamExt;

use crate::error::Result;
use crate::providers::EventAdapter;
use crate::stream::{
    BeginToolCall, FinishDecision, FinishedFn, RawEventStream, ResponseDelta, Segment,
    StreamEvent, ToolCallUpdate,
};
use crate::types::{FinishReason, Thinking, ToolCall, ToolCallId, Usage};

/// Minimum number of identical cycles before a completion counts as repetitive
const REPETITION_MIN_CYCLES: usize = 8;
/// Longest cycle (in chunks) checked for repetition
const REPETITION_MAX_PERIOD: usize = 8;

/// Output of the accumulator
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    /// A normalized delta for one choice
    Delta { index: usize, delta: ResponseDelta },
    /// Merged usage after an update
    Usage(Usage),
    /// A choice was finalized
    Finished(FinishedCompletion),
}

/// Terminal record for one choice
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedCompletion {
    pub index: usize,
    /// Accumulated text, truncated at `finish_offset` when one was requested
    pub completion_text: String,
    pub finish_reason: Option<FinishReason>,
    pub finish_offset: Option<usize>,
    /// True when the finished callback chose the cut point
    pub block_finished: bool,
    pub tool_calls: Vec<ToolCall>,
    pub thinking: Option<Thinking>,
    pub stateful_marker: Option<String>,
    pub annotations: HashMap<String, Vec<serde_json::Value>>,
    pub repetitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Streaming,
    Finished,
}

#[derive(Debug)]
struct ToolBuffer {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug)]
struct ChoiceState {
    phase: Phase,
    text: String,
    chunks: Vec<String>,
    finish_reason: Option<FinishReason>,
    annotations: HashMap<String, Vec<serde_json::Value>>,
    tool_buffers: BTreeMap<usize, ToolBuffer>,
    tool_calls: Vec<ToolCall>,
    thinking: Thinking,
    stateful_marker: Option<String>,
    /// Deltas received since the callback last ran
    pending: ResponseDelta,
    /// Cleared once a decision stops this choice
    streaming: bool,
    /// Set when the callback (not the provider) stopped the choice
    client_stopped: bool,
    finish_offset: Option<usize>,
}

impl ChoiceState {
    fn new() -> Self {
        Self {
            phase: Phase::Streaming,
            text: String::new(),
            chunks: Vec::new(),
            finish_reason: None,
            annotations: HashMap::new(),
            tool_buffers: BTreeMap::new(),
            tool_calls: Vec::new(),
            thinking: Thinking::default(),
            stateful_marker: None,
            pending: ResponseDelta::default(),
            streaming: true,
            client_stopped: false,
            finish_offset: None,
        }
    }

    fn is_live(&self) -> bool {
        self.phase == Phase::Streaming && self.streaming
    }

    /// Apply a callback decision; returns whether the choice should be yielded now.
    fn apply_decision(&mut self, decision: Option<FinishDecision>, forced: bool) -> bool {
        let (mut yield_solution, mut continue_streaming, offset) = match decision {
            None => (false, true, None),
            Some(FinishDecision::Offset(offset)) => (true, false, Some(offset)),
            Some(FinishDecision::Solution {
                yield_solution,
                continue_streaming,
                finish_offset,
            }) => (yield_solution, continue_streaming, finish_offset),
        };

        if let Some(offset) = offset {
            self.finish_offset = Some(floor_char_boundary(&self.text, offset));
        }
        if !continue_streaming && !forced {
            self.client_stopped = true;
        }
        if forced {
            yield_solution = true;
            continue_streaming = false;
        }
        if !continue_streaming {
            self.streaming = false;
        }
        yield_solution
    }

    /// Move to `Finished`. Returns `None` if the choice was already yielded.
    fn finalize(&mut self, index: usize) -> Option<FinishedCompletion> {
        if self.phase == Phase::Finished {
            return None;
        }
        self.phase = Phase::Finished;
        self.streaming = false;

        let completion_text = match self.finish_offset {
            Some(offset) => self.text[..offset].to_string(),
            None => self.text.clone(),
        };
        let repetitive = is_repetitive(&self.chunks);
        if repetitive {
            tracing::warn!(index, chunks = self.chunks.len(), "completion is repetitive");
        }

        Some(FinishedCompletion {
            index,
            completion_text,
            finish_reason: self.finish_reason,
            finish_offset: self.finish_offset,
            block_finished: self.finish_offset.is_some(),
            tool_calls: self.tool_calls.clone(),
            thinking: (!self.thinking.is_empty()).then(|| self.thinking.clone()),
            stateful_marker: self.stateful_marker.clone(),
            annotations: std::mem::take(&mut self.annotations),
            repetitive,
        })
    }
}

/// Per-request accumulation state across all choice indices
#[derive(Debug, Default)]
pub struct CompletionAccumulator {
    choices: BTreeMap<usize, ChoiceState>,
    usage: Usage,
}

impl CompletionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage merged so far
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Feed one adapter event, pushing resulting events to `out`
    pub fn apply(
        &mut self,
        event: StreamEvent,
        finished: &mut FinishedFn<'_>,
        out: &mut VecDeque<CompletionEvent>,
    ) {
        match event {
            StreamEvent::Text { index, text } => {
                if text.is_empty() {
                    return;
                }
                let Some(state) = self.live_choice(index) else {
                    return;
                };
                state.text.push_str(&text);
                state.chunks.push(text.clone());
                let segment = text.contains('\n');
                self.emit(index, ResponseDelta::text(text), segment, finished, out);
            }
            StreamEvent::ToolCallBegin {
                index,
                block,
                id,
                name,
            } => {
                let Some(state) = self.live_choice(index) else {
                    return;
                };
                let needs_space = !state.text.is_empty();
                if needs_space {
                    state.text.push(' ');
                    state.chunks.push(" ".to_string());
                }
                state.tool_buffers.insert(
                    block,
                    ToolBuffer {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: String::new(),
                    },
                );
                if needs_space {
                    self.emit(index, ResponseDelta::text(" "), false, finished, out);
                }
                let delta = ResponseDelta {
                    begin_tool_calls: vec![BeginToolCall { id, name }],
                    ..Default::default()
                };
                self.emit(index, delta, true, finished, out);
            }
            StreamEvent::ToolCallArgs {
                index,
                block,
                delta,
            } => {
                let Some(state) = self.live_choice(index) else {
                    return;
                };
                let Some(buffer) = state.tool_buffers.get_mut(&block) else {
                    tracing::debug!(index, block, "argument delta for unknown tool call block");
                    return;
                };
                buffer.arguments.push_str(&delta);
                let update = ToolCallUpdate {
                    id: buffer.id.clone(),
                    name: buffer.name.clone(),
                    arguments_delta: delta,
                };
                let delta = ResponseDelta {
                    tool_call_updates: vec![update],
                    ..Default::default()
                };
                self.emit(index, delta, false, finished, out);
            }
            StreamEvent::ToolCallStop { index, block } => {
                let Some(state) = self.live_choice(index) else {
                    return;
                };
                let Some(buffer) = state.tool_buffers.remove(&block) else {
                    return;
                };
                let call = ToolCall::new(
                    ToolCallId::external(buffer.id),
                    buffer.name,
                    buffer.arguments,
                );
                state.tool_calls.push(call.clone());
                let delta = ResponseDelta {
                    tool_calls: vec![call],
                    ..Default::default()
                };
                self.emit(index, delta, true, finished, out);
            }
            StreamEvent::Thinking { index, delta } => {
                let Some(state) = self.live_choice(index) else {
                    return;
                };
                state.thinking.apply(&delta);
                let delta = ResponseDelta {
                    thinking: vec![delta],
                    ..Default::default()
                };
                self.emit(index, delta, false, finished, out);
            }
            StreamEvent::Annotations { index, annotations } => {
                let Some(state) = self.live_choice(index) else {
                    return;
                };
                for annotation in &annotations {
                    let key = annotation
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("annotation")
                        .to_string();
                    state
                        .annotations
                        .entry(key)
                        .or_default()
                        .push(annotation.clone());
                }
                let delta = ResponseDelta {
                    annotations,
                    ..Default::default()
                };
                self.emit(index, delta, false, finished, out);
            }
            StreamEvent::StatefulMarker { index, marker } => {
                let Some(state) = self.live_choice(index) else {
                    return;
                };
                state.stateful_marker = Some(marker.clone());
                let delta = ResponseDelta {
                    stateful_marker: Some(marker),
                    ..Default::default()
                };
                self.emit(index, delta, true, finished, out);
            }
            StreamEvent::Usage {
                usage,
                authoritative,
            } => {
                self.usage.merge(&usage, authoritative);
                self.usage.check_integrity();
                out.push_back(CompletionEvent::Usage(self.usage.clone()));
            }
            StreamEvent::Finish { index, reason } => {
                let state = self.choices.entry(index).or_insert_with(ChoiceState::new);
                if state.phase == Phase::Finished {
                    return;
                }
                state.finish_reason = Some(reason);
                self.invoke(index, true, finished, out);
            }
            StreamEvent::Error(error) => {
                let delta = ResponseDelta {
                    error: Some(error),
                    ..Default::default()
                };
                if self.live_choice(0).is_some() {
                    self.emit(0, delta, true, finished, out);
                } else {
                    out.push_back(CompletionEvent::Delta { index: 0, delta });
                }
            }
            StreamEvent::Done => {}
        }
    }

    /// End of stream: give every unfinished choice a final callback and yield it
    pub fn finish(&mut self, finished: &mut FinishedFn<'_>, out: &mut VecDeque<CompletionEvent>) {
        let open: Vec<usize> = self
            .choices
            .iter()
            .filter(|(_, state)| state.phase == Phase::Streaming)
            .map(|(index, _)| *index)
            .collect();
        for index in open {
            self.invoke(index, true, finished, out);
        }
    }

    /// True once the callback has stopped streaming on every expected choice
    /// (choices the provider finished count as stopped).
    pub fn stopped_early(&self, expected_choices: usize) -> bool {
        self.choices.len() >= expected_choices
            && self.choices.values().any(|c| c.client_stopped)
            && self
                .choices
                .values()
                .all(|c| c.client_stopped || c.phase == Phase::Finished)
    }

    fn live_choice(&mut self, index: usize) -> Option<&mut ChoiceState> {
        let state = self.choices.entry(index).or_insert_with(ChoiceState::new);
        state.is_live().then_some(state)
    }

    fn emit(
        &mut self,
        index: usize,
        delta: ResponseDelta,
        segmentation: bool,
        finished: &mut FinishedFn<'_>,
        out: &mut VecDeque<CompletionEvent>,
    ) {
        let Some(state) = self.choices.get_mut(&index) else {
            return;
        };
        let segmentation = segmentation || delta.is_structured();
        out.push_back(CompletionEvent::Delta {
            index,
            delta: delta.clone(),
        });
        state.pending.merge(delta);
        if segmentation {
            self.invoke(index, false, finished, out);
        }
    }

    /// Run the finished callback for a choice. A terminal invocation forces a yield.
    fn invoke(
        &mut self,
        index: usize,
        terminal: bool,
        finished: &mut FinishedFn<'_>,
        out: &mut VecDeque<CompletionEvent>,
    ) {
        let Some(state) = self.choices.get_mut(&index) else {
            return;
        };
        if state.phase == Phase::Finished {
            return;
        }
        let pending = std::mem::take(&mut state.pending);
        let decision = finished(Segment {
            text: &state.text,
            index,
            delta: &pending,
            finished: terminal,
        });
        if state.apply_decision(decision, terminal) {
            if let Some(done) = state.finalize(index) {
                out.push_back(CompletionEvent::Finished(done));
            }
        }
    }
}

/// Pull-based iterator from raw frames to completion events
pub struct CompletionStream {
    source: RawEventStream,
    adapter: Box<dyn EventAdapter>,
    accumulator: CompletionAccumulator,
    pending: VecDeque<CompletionEvent>,
    expected_choices: usize,
    exhausted: bool,
}

impl CompletionStream {
    pub fn new(
        source: RawEventStream,
        adapter: Box<dyn EventAdapter>,
        expected_choices: usize,
    ) -> Self {
        Self {
            source,
            adapter,
            accumulator: CompletionAccumulator::new(),
            pending: VecDeque::new(),
            expected_choices: expected_choices.max(1),
            exhausted: false,
        }
    }

    /// Next event, or `None` once the stream is done.
    ///
    /// Malformed frames are fatal: the error is returned and the stream ends.
    pub async fn next(
        &mut self,
        finished: &mut FinishedFn<'_>,
    ) -> Result<Option<CompletionEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.exhausted {
                return Ok(None);
            }
            if self.accumulator.stopped_early(self.expected_choices) {
                tracing::debug!("finished callback stopped every choice, ending stream early");
                self.end(finished);
                continue;
            }

            match self.source.next().await {
                Some(Ok(frame)) => {
                    let events = match self.adapter.adapt(&frame) {
                        Ok(events) => events,
                        Err(e) => {
                            self.exhausted = true;
                            return Err(e);
                        }
                    };
                    for event in events {
                        if matches!(event, StreamEvent::Done) {
                            self.end(finished);
                            break;
                        }
                        self.accumulator.apply(event, finished, &mut self.pending);
                    }
                }
                Some(Err(e)) => {
                    self.exhausted = true;
                    return Err(e);
                }
                None => self.end(finished),
            }
        }
    }

    /// Usage merged so far
    pub fn usage(&self) -> &Usage {
        self.accumulator.usage()
    }

    fn end(&mut self, finished: &mut FinishedFn<'_>) {
        if !self.exhausted {
            self.accumulator.finish(finished, &mut self.pending);
            self.exhausted = true;
        }
    }
}

fn floor_char_boundary(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Whether the tail of the chunk list is a short cycle repeated many times
fn is_repetitive(chunks: &[String]) -> bool {
    for period in 1..=REPETITION_MAX_PERIOD {
        let window = period * REPETITION_MIN_CYCLES;
        if chunks.len() < window {
            break;
        }
        let tail = &chunks[chunks.len() - window..];
        let unit = &tail[..period];
        if unit.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        if tail.chunks(period).all(|cycle| cycle == unit) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::anthropic::AnthropicAdapter;
    use crate::providers::openai::ChoicesAdapter;
    use crate::stream::SseFrame;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn source(frames: Vec<SseFrame>) -> RawEventStream {
        Box::pin(tokio_stream::iter(frames.into_iter().map(Ok)))
    }

    async fn drain(
        stream: &mut CompletionStream,
        finished: &mut FinishedFn<'_>,
    ) -> Result<Vec<CompletionEvent>> {
        let mut events = vec![];
        while let Some(event) = stream.next(finished).await? {
            events.push(event);
        }
        Ok(events)
    }

    fn finished_of(events: &[CompletionEvent]) -> Vec<&FinishedCompletion> {
        events
            .iter()
            .filter_map(|e| match e {
                CompletionEvent::Finished(done) => Some(done),
                _ => None,
            })
            .collect()
    }

    fn anthropic(event: &str, data: serde_json::Value) -> SseFrame {
        SseFrame::new(event, data.to_string())
    }

    fn chunk(data: serde_json::Value) -> SseFrame {
        SseFrame::data(data.to_string())
    }

    #[tokio::test]
    async fn test_tool_use_block_assembles_one_call() {
        let frames = vec![
            anthropic(
                "message_start",
                serde_json::json!({"type": "message_start", "message": {"usage": {"input_tokens": 10, "output_tokens": 1}}}),
            ),
            anthropic(
                "content_block_start",
                serde_json::json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "t1", "name": "search", "input": {}}}),
            ),
            anthropic(
                "content_block_delta",
                serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}}),
            ),
            anthropic(
                "content_block_delta",
                serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "\"x\"}"}}),
            ),
            anthropic(
                "content_block_stop",
                serde_json::json!({"type": "content_block_stop", "index": 0}),
            ),
            anthropic("message_stop", serde_json::json!({"type": "message_stop"})),
        ];
        let mut stream = CompletionStream::new(source(frames), Box::new(AnthropicAdapter::default()), 1);
        let mut finished = |_: Segment<'_>| None;
        let events = drain(&mut stream, &mut finished).await.unwrap();

        let done = finished_of(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(
            done[0].tool_calls,
            vec![ToolCall::new(ToolCallId::external("t1"), "search", r#"{"q":"x"}"#)]
        );
    }

    #[tokio::test]
    async fn test_finish_reason_yields_full_text_once() {
        let frames = vec![
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "hello "}]})),
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "world"}]})),
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "!", "finish_reason": "stop"}]})),
            SseFrame::data("[DONE]"),
        ];
        let mut stream = CompletionStream::new(source(frames), Box::new(ChoicesAdapter::default()), 1);
        let mut finished = |_: Segment<'_>| None;
        let events = drain(&mut stream, &mut finished).await.unwrap();

        let done = finished_of(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].completion_text, "hello world!");
        assert_eq!(done[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(done[0].finish_offset, None);
        assert!(!done[0].block_finished);
    }

    #[tokio::test]
    async fn test_callback_finalize_then_finish_marker_yields_once() {
        let frames = vec![
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "line one\n"}]})),
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "line two", "finish_reason": "stop"}]})),
        ];
        let mut stream = CompletionStream::new(source(frames), Box::new(ChoicesAdapter::default()), 1);
        let mut finished = |segment: Segment<'_>| {
            Some(FinishDecision::Solution {
                yield_solution: true,
                continue_streaming: true,
                finish_offset: Some(segment.text.len() - 1),
            })
        };
        let events = drain(&mut stream, &mut finished).await.unwrap();

        let done = finished_of(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].completion_text, "line one");
        assert!(done[0].block_finished);
    }

    #[tokio::test]
    async fn test_callback_runs_only_at_segmentation_points() {
        let calls = Arc::new(AtomicUsize::new(0));
        let frames = vec![
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "a"}]})),
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "b"}]})),
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "c\n"}]})),
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "d"}]})),
        ];
        let mut stream = CompletionStream::new(source(frames), Box::new(ChoicesAdapter::default()), 1);
        let seen = Arc::clone(&calls);
        let mut deltas: Vec<(String, bool)> = vec![];
        let mut finished = |segment: Segment<'_>| {
            seen.fetch_add(1, Ordering::SeqCst);
            deltas.push((segment.delta.text.clone(), segment.finished));
            None
        };
        let events = drain(&mut stream, &mut finished).await.unwrap();

        // newline segment + synthetic end-of-stream call
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            deltas,
            vec![("abc\n".to_string(), false), ("d".to_string(), true)]
        );
        let delta_count = events
            .iter()
            .filter(|e| matches!(e, CompletionEvent::Delta { .. }))
            .count();
        assert_eq!(delta_count, 4);
        assert_eq!(finished_of(&events)[0].completion_text, "abc\nd");
    }

    #[tokio::test]
    async fn test_synthetic_final_call_can_trim() {
        let frames = vec![chunk(
            serde_json::json!({"choices": [{"index": 0, "text": "keep this|drop"}]}),
        )];
        let mut stream = CompletionStream::new(source(frames), Box::new(ChoicesAdapter::default()), 1);
        let mut finished = |segment: Segment<'_>| {
            if segment.finished {
                segment.text.find('|').map(FinishDecision::Offset)
            } else {
                None
            }
        };
        let events = drain(&mut stream, &mut finished).await.unwrap();
        let done = finished_of(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].completion_text, "keep this");
        assert_eq!(done[0].finish_offset, Some(9));
    }

    #[tokio::test]
    async fn test_space_injected_before_tool_call_after_text() {
        for lead in ["Let me look", "Let me look\n"] {
            let frames = vec![
                chunk(serde_json::json!({"choices": [{"index": 0, "delta": {"content": lead}}]})),
                chunk(serde_json::json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "c1", "function": {"name": "read", "arguments": ""}}]}}]})),
                chunk(serde_json::json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]})),
                SseFrame::data("[DONE]"),
            ];
            let mut stream =
                CompletionStream::new(source(frames), Box::new(ChoicesAdapter::default()), 1);
            let mut finished = |_: Segment<'_>| None;
            let events = drain(&mut stream, &mut finished).await.unwrap();

            let texts: Vec<&str> = events
                .iter()
                .filter_map(|e| match e {
                    CompletionEvent::Delta { delta, .. } if !delta.text.is_empty() => {
                        Some(delta.text.as_str())
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(texts, vec![lead, " "], "lead text {:?}", lead);
            let done = finished_of(&events);
            assert_eq!(done[0].completion_text, format!("{} ", lead));
            assert_eq!(done[0].tool_calls[0].arguments, "{}");
            assert_eq!(done[0].finish_reason, Some(FinishReason::ToolCalls));
        }
    }

    #[tokio::test]
    async fn test_no_space_before_tool_call_without_text() {
        let frames = vec![
            chunk(serde_json::json!({"choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "id": "c1", "function": {"name": "read", "arguments": "{}"}}]}}]})),
            chunk(serde_json::json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]})),
            SseFrame::data("[DONE]"),
        ];
        let mut stream = CompletionStream::new(source(frames), Box::new(ChoicesAdapter::default()), 1);
        let mut finished = |_: Segment<'_>| None;
        let events = drain(&mut stream, &mut finished).await.unwrap();
        let done = finished_of(&events);
        assert_eq!(done[0].completion_text, "");
        assert_eq!(done[0].tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn test_redacted_thinking_forwarded_verbatim() {
        let frames = vec![
            anthropic(
                "content_block_start",
                serde_json::json!({"type": "content_block_start", "index": 0, "content_block": {"type": "redacted_thinking", "data": "opaque=="}}),
            ),
            anthropic(
                "content_block_stop",
                serde_json::json!({"type": "content_block_stop", "index": 0}),
            ),
            anthropic(
                "content_block_start",
                serde_json::json!({"type": "content_block_start", "index": 1, "content_block": {"type": "thinking", "thinking": ""}}),
            ),
            anthropic(
                "content_block_delta",
                serde_json::json!({"type": "content_block_delta", "index": 1, "delta": {"type": "thinking_delta", "thinking": "plan"}}),
            ),
            anthropic(
                "content_block_delta",
                serde_json::json!({"type": "content_block_delta", "index": 1, "delta": {"type": "signature_delta", "signature": "sig"}}),
            ),
            anthropic("message_stop", serde_json::json!({"type": "message_stop"})),
        ];
        let mut stream = CompletionStream::new(source(frames), Box::new(AnthropicAdapter::default()), 1);
        let mut finished = |_: Segment<'_>| None;
        let events = drain(&mut stream, &mut finished).await.unwrap();
        let thinking = finished_of(&events)[0].thinking.clone().unwrap();
        assert_eq!(thinking.redacted, vec!["opaque==".to_string()]);
        assert_eq!(thinking.text, "plan");
        assert_eq!(thinking.signature.as_deref(), Some("sig"));
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_fatal() {
        let frames = vec![
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "ok"}]})),
            SseFrame::data("{not json"),
        ];
        let mut stream = CompletionStream::new(source(frames), Box::new(ChoicesAdapter::default()), 1);
        let mut finished = |_: Segment<'_>| None;
        let err = drain(&mut stream, &mut finished).await.unwrap_err();
        assert!(matches!(err, crate::Error::Json(_)));
        assert!(stream.next(&mut finished).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_provider_error_becomes_delta() {
        let frames = vec![anthropic(
            "error",
            serde_json::json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
        )];
        let mut stream = CompletionStream::new(source(frames), Box::new(AnthropicAdapter::default()), 1);
        let mut finished = |_: Segment<'_>| None;
        let events = drain(&mut stream, &mut finished).await.unwrap();
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CompletionEvent::Delta { delta, .. } => delta.error.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, "overloaded_error");
    }

    #[tokio::test]
    async fn test_early_stop_leaves_rest_of_stream_unread() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let frames: Vec<SseFrame> = (0..10)
            .map(|i| chunk(serde_json::json!({"choices": [{"index": 0, "text": format!("line {}\n", i)}]})))
            .collect();
        let raw: RawEventStream = Box::pin(tokio_stream::StreamExt::map(
            tokio_stream::iter(frames),
            move |frame| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(frame)
            },
        ));
        let mut stream = CompletionStream::new(raw, Box::new(ChoicesAdapter::default()), 1);
        let mut finished = |segment: Segment<'_>| {
            segment
                .text
                .contains("line 2")
                .then_some(FinishDecision::Offset(segment.text.len()))
        };
        let events = drain(&mut stream, &mut finished).await.unwrap();
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
        let done = finished_of(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].completion_text, "line 0\nline 1\nline 2\n");
    }

    #[tokio::test]
    async fn test_delta_usage_overrides_start_usage() {
        let frames = vec![
            anthropic(
                "message_start",
                serde_json::json!({"type": "message_start", "message": {"usage": {"input_tokens": 12, "output_tokens": 1, "cache_read_input_tokens": 100}}}),
            ),
            anthropic(
                "message_delta",
                serde_json::json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 57}}),
            ),
            anthropic("message_stop", serde_json::json!({"type": "message_stop"})),
        ];
        let mut stream = CompletionStream::new(source(frames), Box::new(AnthropicAdapter::default()), 1);
        let mut finished = |_: Segment<'_>| None;
        drain(&mut stream, &mut finished).await.unwrap();
        assert_eq!(stream.usage().completion_tokens, 57);
        assert_eq!(stream.usage().prompt_tokens, 112);
        assert_eq!(stream.usage().cache_read_tokens, 100);
    }

    #[tokio::test]
    async fn test_multiple_choices_tracked_independently() {
        let frames = vec![
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "zero"}, {"index": 1, "text": "one"}]})),
            chunk(serde_json::json!({"choices": [{"index": 1, "text": "!", "finish_reason": "stop"}]})),
            chunk(serde_json::json!({"choices": [{"index": 0, "text": "?", "finish_reason": "length"}]})),
        ];
        let mut stream = CompletionStream::new(source(frames), Box::new(ChoicesAdapter::default()), 2);
        let mut finished = |_: Segment<'_>| None;
        let events = drain(&mut stream, &mut finished).await.unwrap();
        let done = finished_of(&events);
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].index, 1);
        assert_eq!(done[0].completion_text, "one!");
        assert_eq!(done[1].completion_text, "zero?");
        assert_eq!(done[1].finish_reason, Some(FinishReason::Length));
    }

    #[test]
    fn test_repetition_detection() {
        let looping: Vec<String> = std::iter::repeat(["foo", "bar"])
            .take(10)
            .flatten()
            .map(String::from)
            .collect();
        assert!(is_repetitive(&looping));

        let varied: Vec<String> = (0..40).map(|i| format!("token{}", i)).collect();
        assert!(!is_repetitive(&varied));

        let blank: Vec<String> = std::iter::repeat_n(" ".to_string(), 40).collect();
        assert!(!is_repetitive(&blank));
    }
}
