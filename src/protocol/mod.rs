use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Control message signalling end-of-audio to the remote endpoint.
///
/// Sent as a text frame once the decoder's output is exhausted.
pub const EOF_CONTROL_MESSAGE: &str = "{\"eof\": 1}";

/// Word-level timing information inside a recognized phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    /// Recognition confidence (0.0 to 1.0)
    pub conf: f64,
    /// Start offset in seconds from the beginning of the audio
    pub start: f64,
    /// End offset in seconds
    pub end: f64,
    /// The recognized word
    pub word: String,
}

/// One recognized phrase with its word-level timings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// The recognized phrase text
    pub text: String,
    /// Per-word timings; may be empty if the endpoint omits them
    #[serde(default)]
    pub result: Vec<WordTiming>,
}

/// A message received from the remote transcription endpoint.
///
/// Recognition servers interleave partial hypotheses and finalized phrases;
/// only messages carrying a non-empty `text` contribute to the transcript.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub partial: Option<String>,
    #[serde(default)]
    pub result: Vec<WordTiming>,
}

impl ServerMessage {
    /// Parse a raw text frame. Unparseable frames yield `None` and are
    /// simply consumed off the stream.
    pub fn parse(frame: &str) -> Option<Self> {
        serde_json::from_str(frame).ok()
    }

    /// Convert into a transcript segment, if this message carries a
    /// finalized non-empty phrase.
    pub fn into_segment(self) -> Option<TranscriptSegment> {
        match self.text {
            Some(text) if !text.is_empty() => Some(TranscriptSegment {
                text,
                result: self.result,
            }),
            _ => None,
        }
    }
}

/// Completed transcription of one file by one worker.
///
/// An empty `segments` sequence is a valid result (a silent file), not an
/// error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptResult {
    /// Identity of the worker that produced this transcript
    pub worker_id: String,
    /// Path of the source file
    pub file_path: String,
    /// Completion timestamp
    pub datetime: DateTime<Utc>,
    /// Recognized phrases in stream order
    pub segments: Vec<TranscriptSegment>,
}

impl TranscriptResult {
    pub fn new(worker_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            file_path: file_path.into(),
            datetime: Utc::now(),
            segments: Vec::new(),
        }
    }

    pub fn with_segments(mut self, segments: Vec<TranscriptSegment>) -> Self {
        self.segments = segments;
        self
    }

    /// Concatenated plain-text transcript, one phrase per line.
    pub fn plain_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
