//! Progress event streaming for the reconciliation pipeline
//!
//! Every pipeline stage reports a start event, zero or more percentage
//! progress events, and a completion event carrying the error message if the
//! stage failed. Sinks receive events synchronously on the caller's task and
//! must not block.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// The five pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Parse,
    Resolve,
    Plan,
    Build,
    Deploy,
}

impl PipelineStage {
    /// Get the stage name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Parse => "parse",
            PipelineStage::Resolve => "resolve",
            PipelineStage::Plan => "plan",
            PipelineStage::Build => "build",
            PipelineStage::Deploy => "deploy",
        }
    }

    /// All stages in execution order
    pub fn all() -> &'static [PipelineStage] {
        &[
            PipelineStage::Parse,
            PipelineStage::Resolve,
            PipelineStage::Plan,
            PipelineStage::Build,
            PipelineStage::Deploy,
        ]
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ProgressEvent {
    #[serde(rename = "stage.start")]
    StageStart {
        stage: PipelineStage,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename = "stage.progress")]
    StageProgress {
        stage: PipelineStage,
        message: String,
        percentage: u8,
    },
    #[serde(rename = "stage.complete")]
    StageComplete {
        stage: PipelineStage,
        timestamp: chrono::DateTime<chrono::Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ProgressEvent {
    /// Stage this event belongs to
    pub fn stage(&self) -> PipelineStage {
        match self {
            ProgressEvent::StageStart { stage, .. }
            | ProgressEvent::StageProgress { stage, .. }
            | ProgressEvent::StageComplete { stage, .. } => *stage,
        }
    }
}

/// Receiver of pipeline progress
pub trait ProgressSink: Send + Sync + fmt::Debug {
    /// Receive a single event
    fn emit(&self, event: ProgressEvent);

    /// Report the start of a stage
    fn stage_start(&self, stage: PipelineStage) {
        self.emit(ProgressEvent::StageStart {
            stage,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Report intermediate progress within a stage (percentage is clamped to 100)
    fn progress(&self, stage: PipelineStage, message: &str, percentage: u8) {
        self.emit(ProgressEvent::StageProgress {
            stage,
            message: message.to_string(),
            percentage: percentage.min(100),
        });
    }

    /// Report stage completion, with the failure message if any
    fn stage_complete(&self, stage: PipelineStage, error: Option<String>) {
        self.emit(ProgressEvent::StageComplete {
            stage,
            timestamp: chrono::Utc::now(),
            error,
        });
    }
}

/// Sink that drops every event; the default
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Sink that forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn emit(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::StageStart { stage, .. } => info!(stage = %stage, "Stage started"),
            ProgressEvent::StageProgress {
                stage,
                message,
                percentage,
            } => debug!(stage = %stage, percentage, "{}", message),
            ProgressEvent::StageComplete {
                stage,
                error: None,
                ..
            } => info!(stage = %stage, "Stage completed"),
            ProgressEvent::StageComplete {
                stage,
                error: Some(error),
                ..
            } => warn!(stage = %stage, error = %error, "Stage failed"),
        }
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Stages that reported a start, in order
    pub fn started_stages(&self) -> Vec<PipelineStage> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::StageStart { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(PipelineStage::Parse.to_string(), "parse");
        assert_eq!(PipelineStage::Deploy.to_string(), "deploy");
        assert_eq!(PipelineStage::all().len(), 5);
    }

    #[test]
    fn test_recording_progress_collects_events() {
        let sink = RecordingProgress::new();
        sink.stage_start(PipelineStage::Plan);
        sink.progress(PipelineStage::Plan, "inspecting", 250);
        sink.stage_complete(PipelineStage::Plan, None);

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.stage() == PipelineStage::Plan));
        match &events[1] {
            ProgressEvent::StageProgress { percentage, .. } => assert_eq!(*percentage, 100),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(sink.started_stages(), vec![PipelineStage::Plan]);
    }

    #[test]
    fn test_tracing_progress_accepts_failures() {
        let sink: &dyn ProgressSink = &TracingProgress;
        sink.stage_start(PipelineStage::Build);
        sink.progress(PipelineStage::Build, "building", 50);
        sink.stage_complete(PipelineStage::Build, Some("boom".to_string()));
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = ProgressEvent::StageProgress {
            stage: PipelineStage::Build,
            message: "pulling alpine".to_string(),
            percentage: 10,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stage.progress");
        assert_eq!(json["stage"], "build");
    }
}
