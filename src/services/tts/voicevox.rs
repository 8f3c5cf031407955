//! VOICEVOX engine client.
//!
//! Synthesis is two requests: `/audio_query` builds the accent phrases for a text, the
//! speed is patched into that query, and `/synthesis` renders it to WAV.

use crate::core::error::SynthesisError;
use crate::services::tts::{TtsClient, VoiceProfile};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VoicevoxConfig {
    #[serde(default = "default_voicevox_base_url")]
    pub base_url: String,
}

impl Default for VoicevoxConfig {
    fn default() -> Self {
        Self {
            base_url: default_voicevox_base_url(),
        }
    }
}

fn default_voicevox_base_url() -> String {
    "http://localhost:50021".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct Speaker {
    pub name: String,
    #[serde(default)]
    pub styles: Vec<SpeakerStyle>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpeakerStyle {
    pub name: String,
    pub id: u32,
}

pub struct VoicevoxClient {
    base_url: Url,
    client: reqwest::Client,
}

impl VoicevoxClient {
    pub fn new(config: &VoicevoxConfig) -> Result<Self> {
        // A trailing slash makes Url::join append instead of replacing the last segment
        let base = format!("{}/", config.base_url.trim_end_matches('/'));
        let base_url =
            Url::parse(&base).with_context(|| format!("Invalid VOICEVOX url: {}", base))?;
        Ok(Self {
            base_url,
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SynthesisError> {
        self.base_url
            .join(path)
            .map_err(|e| SynthesisError::Unreachable(anyhow!("Invalid endpoint {}: {}", path, e)))
    }

    pub async fn list_speakers(&self) -> Result<Vec<Speaker>, SynthesisError> {
        let resp = self
            .client
            .get(self.endpoint("speakers")?)
            .send()
            .await
            .map_err(|e| SynthesisError::Unreachable(e.into()))?;
        let resp = check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| SynthesisError::MalformedResponse(format!("speaker list: {}", e)))
    }

    async fn audio_query(&self, text: &str, speaker: u32) -> Result<Value, SynthesisError> {
        let speaker = speaker.to_string();
        let resp = self
            .client
            .post(self.endpoint("audio_query")?)
            .query(&[("text", text), ("speaker", speaker.as_str())])
            .send()
            .await
            .map_err(|e| SynthesisError::Unreachable(e.into()))?;
        let resp = check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| SynthesisError::MalformedResponse(format!("audio query: {}", e)))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SynthesisError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(SynthesisError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// Sets the playback speed on an audio query returned by the engine.
fn apply_speed(query: &mut Value, speed_scale: f64) -> Result<(), SynthesisError> {
    let object = query.as_object_mut().ok_or_else(|| {
        SynthesisError::MalformedResponse("audio query is not a JSON object".to_string())
    })?;
    object.insert("speedScale".to_string(), Value::from(speed_scale));
    Ok(())
}

fn find_style(speakers: &[Speaker], id: u32) -> Option<(&Speaker, &SpeakerStyle)> {
    speakers
        .iter()
        .find_map(|sp| sp.styles.iter().find(|st| st.id == id).map(|st| (sp, st)))
}

#[async_trait]
impl TtsClient for VoicevoxClient {
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<Vec<u8>, SynthesisError> {
        let mut query = self.audio_query(text, voice.speaker).await?;
        apply_speed(&mut query, voice.speed_scale)?;

        let speaker = voice.speaker.to_string();
        let resp = self
            .client
            .post(self.endpoint("synthesis")?)
            .query(&[("speaker", speaker.as_str())])
            .json(&query)
            .send()
            .await
            .map_err(|e| SynthesisError::Unreachable(e.into()))?;
        let resp = check_status(resp).await?;

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SynthesisError::Unreachable(e.into()))?;
        debug!("VOICEVOX returned {} bytes for {} chars", bytes.len(), text.chars().count());
        Ok(bytes.to_vec())
    }

    async fn verify_voice(&self, voice: &VoiceProfile) -> Result<(), SynthesisError> {
        let speakers = self.list_speakers().await?;
        match find_style(&speakers, voice.speaker) {
            Some((speaker, style)) => {
                debug!("Using VOICEVOX voice {} ({})", speaker.name, style.name);
                Ok(())
            }
            None => {
                for speaker in &speakers {
                    for style in &speaker.styles {
                        warn!("  available style {}: {} ({})", style.id, speaker.name, style.name);
                    }
                }
                Err(SynthesisError::UnknownSpeaker(voice.speaker))
            }
        }
    }
}
