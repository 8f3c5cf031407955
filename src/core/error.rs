//! Typed failures for each pipeline stage.
//!
//! Adapters return these to the orchestrator, which is the only place that
//! decides whether a failure is retried, aborts the cycle, or stops the process.

use crate::core::state::Stage;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("text generation backend failed: {0:#}")]
    Backend(#[source] anyhow::Error),

    #[error("response has no '{0}' separating the display and speak tracks")]
    MissingDelimiter(char),

    #[error("story is empty after removing blank lines")]
    Empty,

    #[error("display track has {display} lines but speak track has {speak}")]
    LineCountMismatch { display: usize, speak: usize },

    #[error("display line {line} ({chars} characters) does not fit on screen")]
    CaptionTooLarge { line: usize, chars: usize },
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("speech backend unreachable: {0:#}")]
    Unreachable(#[source] anyhow::Error),

    #[error("speech backend rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("speech backend sent a malformed response: {0}")]
    MalformedResponse(String),

    #[error("speaker style {0} is not offered by the speech backend")]
    UnknownSpeaker(u32),

    #[error("invalid audio for segment {index}: {reason}")]
    InvalidAudio { index: usize, reason: String },

    #[error("failed to store audio for segment {index}: {source:#}")]
    Storage {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("timeline has no segments")]
    Empty,

    #[error("segment {ordinal} has non-positive duration")]
    NonPositiveDuration { ordinal: usize },

    #[error("segment {ordinal} follows segment {previous}; ordinals must strictly increase")]
    OutOfOrder { previous: usize, ordinal: usize },

    #[error("caption of segment {ordinal} is {width}px wide, frame is {frame_width}px")]
    CaptionTooWide {
        ordinal: usize,
        width: u32,
        frame_width: u32,
    },

    #[error("caption of segment {ordinal} is {height}px tall, frame is {frame_height}px")]
    CaptionTooTall {
        ordinal: usize,
        height: u32,
        frame_height: u32,
    },

    #[error("caption of segment {ordinal} has an empty window starting at {start:?} in a {segment:?} segment")]
    CaptionOutsideSegment {
        ordinal: usize,
        start: Duration,
        segment: Duration,
    },

    #[error("encoder failed: {0}")]
    Encoder(String),

    #[error("failed to prepare render inputs: {0:#}")]
    Io(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PublishError {
    /// Transient network or authorization failure; worth another attempt.
    #[error("publish failed (retryable{}): {message}", status_suffix(*.status))]
    Retryable { status: Option<u16>, message: String },

    /// Rejected content, exhausted quota, or a malformed request.
    #[error("publish rejected{}: {message}", status_suffix(*.status))]
    Terminal { status: Option<u16>, message: String },
}

fn status_suffix(status: Option<u16>) -> String {
    status.map(|s| format!(", HTTP {}", s)).unwrap_or_default()
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishError::Retryable { .. })
    }

    /// Classifies an HTTP failure status returned by a publish backend.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 408 | 429 | 500..=599 => PublishError::Retryable {
                status: Some(status),
                message,
            },
            _ => PublishError::Terminal {
                status: Some(status),
                message,
            },
        }
    }
}

/// A failure that stops the whole process.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("story generation failed {attempts} times in a row, last error: {last}")]
    StoryRetriesExhausted {
        attempts: usize,
        #[source]
        last: GenerationError,
    },

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error("failed to load run state: {0:#}")]
    StateLoad(#[source] anyhow::Error),

    #[error("failed to record completion: {0:#}")]
    StateSave(#[source] anyhow::Error),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::StoryRetriesExhausted { .. } => Stage::GeneratingStory,
            PipelineError::Synthesis(_) => Stage::SynthesizingVoice,
            PipelineError::Composition(_) => Stage::BuildingTimeline,
            PipelineError::StateLoad(_) => Stage::WaitingForDay,
            PipelineError::StateSave(_) => Stage::RecordingCompletion,
        }
    }
}
