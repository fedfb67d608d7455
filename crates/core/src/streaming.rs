//! Utilities for streaming token-by-token outputs while preserving UTF-8 integrity.

use std::{
    sync::{
        Arc,
        mpsc::{self, Receiver},
    },
    thread::{self, JoinHandle},
};

use image::DynamicImage;
use tracing::{debug, warn};

use crate::{
    decode::{CancelHandle, DecodeOutcome, DecodeParameters},
    error::{EngineError, Result, Stage, StageContext},
    inference::Engine,
    tokenizer::{TextTokenizer, TokenId},
};

/// Computes the suffix of `current` that differs from `previous`.
pub fn extract_delta(previous: &str, current: &str) -> String {
    if let Some(rest) = current.strip_prefix(previous) {
        return rest.to_owned();
    }

    let mut prefix_bytes = 0;
    for (a, b) in previous.chars().zip(current.chars()) {
        if a != b {
            break;
        }
        prefix_bytes += a.len_utf8();
    }

    current[prefix_bytes..].to_owned()
}

/// Tracks previously emitted text to compute new streaming deltas.
#[derive(Debug, Default, Clone)]
pub struct DeltaTracker {
    previous: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.previous.clear();
    }

    /// Returns the text that should be emitted for the current decode.
    ///
    /// When `is_final` is false, trailing `U+FFFD` fragments are held back so callers only see
    /// complete UTF-8 content. The final call lets the full decoded text through.
    pub fn advance(&mut self, current: &str, is_final: bool) -> String {
        let mut raw_delta = extract_delta(&self.previous, current);

        if raw_delta.is_empty() {
            self.previous = current.to_owned();
            return raw_delta;
        }

        if !is_final {
            if let Some(idx) = raw_delta.find(char::REPLACEMENT_CHARACTER) {
                if idx == 0 {
                    return String::new();
                }
                raw_delta.truncate(idx);
                self.previous.push_str(&raw_delta);
                return raw_delta;
            }
        }

        self.previous = current.to_owned();
        raw_delta
    }

    pub fn snapshot(&self) -> &str {
        &self.previous
    }
}

/// Turns the growing list of generated ids into text deltas.
#[derive(Debug, Default, Clone)]
pub struct TextStreamer {
    tracker: DeltaTracker,
}

impl TextStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode all of `ids` and return only the text not yet emitted.
    pub fn push(
        &mut self,
        tokenizer: &dyn TextTokenizer,
        ids: &[TokenId],
        is_final: bool,
    ) -> Result<String> {
        let decoded = tokenizer.decode(ids).at_stage(Stage::Tokenizer)?;
        Ok(self.tracker.advance(&decoded, is_final))
    }

    pub fn text(&self) -> &str {
        self.tracker.snapshot()
    }

    pub fn reset(&mut self) {
        self.tracker.reset();
    }
}

/// Event produced by a background generation.
#[derive(Debug)]
pub enum StreamEvent {
    /// A newly emitted id with the text delta it produced.
    Token { id: TokenId, delta: String },
    Finished(DecodeOutcome),
    Failed(EngineError),
}

/// Receiving end of [`spawn_generation`].
///
/// Dropping the stream requests cancellation; the worker stops at its next step boundary.
pub struct GenerationStream {
    events: Receiver<StreamEvent>,
    cancel: CancelHandle,
    worker: Option<JoinHandle<()>>,
}

impl GenerationStream {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the worker exits and return its final event.
    pub fn wait(mut self) -> Option<StreamEvent> {
        let last = self.events.iter().last();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("generation worker panicked");
            }
        }
        last
    }
}

impl Iterator for GenerationStream {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.events.recv().ok()
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run one request on its own thread and stream its tokens back.
pub fn spawn_generation(
    engine: Arc<Engine>,
    prompt: String,
    image: Option<DynamicImage>,
    params: DecodeParameters,
) -> GenerationStream {
    let (sender, events) = mpsc::channel();
    let cancel = CancelHandle::new();
    let worker_cancel = cancel.clone();
    let worker = thread::spawn(move || {
        let result = (|| -> Result<DecodeOutcome> {
            let mut generation = engine.start(&prompt, image.as_ref(), params)?;
            generation.set_cancel_handle(worker_cancel);
            let mut streamer = TextStreamer::new();
            while let Some(id) = generation.step()? {
                let delta = streamer.push(engine.tokenizer(), generation.generated(), false)?;
                if sender.send(StreamEvent::Token { id, delta }).is_err() {
                    debug!("stream receiver dropped, cancelling generation");
                    generation.cancel_handle().cancel();
                }
            }
            generation.finish()
        })();
        let event = match result {
            Ok(outcome) => StreamEvent::Finished(outcome),
            Err(err) => StreamEvent::Failed(err),
        };
        let _ = sender.send(event);
    });
    GenerationStream {
        events,
        cancel,
        worker: Some(worker),
    }
}
