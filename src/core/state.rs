use crate::core::io::Storage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The orchestrator's position inside one daily cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    WaitingForDay,
    GeneratingStory,
    SynthesizingVoice,
    BuildingTimeline,
    Publishing,
    RecordingCompletion,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::WaitingForDay => "waiting for day",
            Stage::GeneratingStory => "generating story",
            Stage::SynthesizingVoice => "synthesizing voice",
            Stage::BuildingTimeline => "building timeline",
            Stage::Publishing => "publishing",
            Stage::RecordingCompletion => "recording completion",
        };
        f.write_str(name)
    }
}

/// Everything that survives a process restart.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct RunState {
    pub last_completed_date: Option<NaiveDate>,
}

#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn load(&self) -> Result<Option<NaiveDate>>;
    async fn save(&self, date: NaiveDate) -> Result<()>;
}

/// Stores [`RunState`] as a JSON record, replaced atomically on every save.
pub struct JsonRunStateStore {
    path: String,
    storage: Arc<dyn Storage>,
}

impl JsonRunStateStore {
    pub fn new(path: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            path: path.into(),
            storage,
        }
    }
}

#[async_trait]
impl RunStateStore for JsonRunStateStore {
    async fn load(&self) -> Result<Option<NaiveDate>> {
        if !self.storage.exists(&self.path).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(&self.path).await?;
        let state: RunState = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse run state {}", self.path))?;
        Ok(state.last_completed_date)
    }

    async fn save(&self, date: NaiveDate) -> Result<()> {
        let state = RunState {
            last_completed_date: Some(date),
        };
        let content = serde_json::to_string_pretty(&state)?;
        self.storage
            .write_atomic(&self.path, content.as_bytes())
            .await
            .with_context(|| format!("Failed to save run state {}", self.path))
    }
}
