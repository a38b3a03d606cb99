//! Streaming response dispatcher

use helm_ai::{FinishDecision, ResponseDelta};
use std::sync::Arc;

use crate::response::{DisplaySink, FinalizeGuard, ResponsePart, ResponseProcessor};

/// Decorates a sink. Participants compose in order, each wrapping the
/// result of the previous one.
pub type StreamParticipant = Arc<dyn Fn(Arc<dyn DisplaySink>) -> Arc<dyn DisplaySink> + Send + Sync>;

/// Apply `participants` to `sink`
pub fn compose_sink(
    sink: Arc<dyn DisplaySink>,
    participants: &[StreamParticipant],
) -> Arc<dyn DisplaySink> {
    participants
        .iter()
        .fold(sink, |inner, participant| participant(inner))
}

/// Routes one iteration's deltas through a response processor to the
/// display, and tells the transport when the processor has seen enough.
pub struct ResponseDispatcher {
    sink: Arc<dyn DisplaySink>,
    guard: FinalizeGuard,
    processor: Box<dyn ResponseProcessor>,
    text: String,
}

impl ResponseDispatcher {
    /// `guard` must finalize `sink`
    pub fn new(
        sink: Arc<dyn DisplaySink>,
        guard: FinalizeGuard,
        processor: Box<dyn ResponseProcessor>,
    ) -> Self {
        Self {
            sink,
            guard,
            processor,
            text: String::new(),
        }
    }

    pub fn on_delta(&mut self, delta: &ResponseDelta) {
        self.text.push_str(&delta.text);
        let mut parts = Vec::new();
        self.processor.process(delta, &mut parts);
        for part in parts {
            self.sink.push(part);
        }
    }

    pub fn push(&self, part: ResponsePart) {
        self.sink.push(part);
    }

    /// Running text shown so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Truncate at the full current text once the processor is done
    pub fn early_stop(&self, current_text: &str) -> Option<FinishDecision> {
        self.processor
            .is_done()
            .then(|| FinishDecision::Offset(current_text.len()))
    }

    /// Flush the processor and finalize the sink
    pub fn finish(&mut self) {
        let mut parts = Vec::new();
        self.processor.flush(&mut parts);
        for part in parts {
            self.sink.push(part);
        }
        self.guard.finalize();
    }
}
