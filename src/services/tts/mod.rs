use crate::core::config::AudioConfig;
use crate::core::error::SynthesisError;
use crate::core::io::Storage;
use crate::core::shutdown::Shutdown;
use crate::utils::audio::wav_duration;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

pub mod voicevox;

/// Who speaks and how fast.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceProfile {
    pub speaker: u32,
    pub speed_scale: f64,
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Returns WAV bytes for `text`.
    async fn synthesize(&self, text: &str, voice: &VoiceProfile) -> Result<Vec<u8>, SynthesisError>;

    /// Checks that the backend is up and offers `voice` before a cycle starts.
    async fn verify_voice(&self, _voice: &VoiceProfile) -> Result<(), SynthesisError> {
        Ok(())
    }
}

pub fn create_tts_client(config: &AudioConfig) -> Result<Arc<dyn TtsClient>> {
    info!("Initializing TTS Client for provider: {}", config.provider);
    match config.provider.as_str() {
        "voicevox" => {
            let voicevox_config = config.voicevox.clone().unwrap_or_default();
            Ok(Arc::new(voicevox::VoicevoxClient::new(&voicevox_config)?))
        }
        _ => Err(anyhow!("Unknown TTS provider: {}", config.provider)),
    }
}

/// One synthesized line, stored at `audio_path`.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSegment {
    pub index: usize,
    pub audio_duration: Duration,
    pub audio_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoiceRequest {
    pub index: usize,
    pub text: String,
}

/// Turns text into stored, measured [`VoiceSegment`]s.
pub struct VoiceSynthesizer {
    tts: Arc<dyn TtsClient>,
    storage: Arc<dyn Storage>,
    voice: VoiceProfile,
    max_concurrency: usize,
}

impl VoiceSynthesizer {
    pub fn new(
        tts: Arc<dyn TtsClient>,
        storage: Arc<dyn Storage>,
        voice: VoiceProfile,
        max_concurrency: usize,
    ) -> Self {
        Self {
            tts,
            storage,
            voice,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub async fn verify(&self) -> Result<(), SynthesisError> {
        self.tts.verify_voice(&self.voice).await
    }

    /// Synthesizes one line and writes it to `<dir>/<index>.wav`.
    pub async fn synthesize(
        &self,
        index: usize,
        text: &str,
        dir: &str,
    ) -> Result<VoiceSegment, SynthesisError> {
        let wav = self.tts.synthesize(text, &self.voice).await?;
        let audio_duration =
            wav_duration(&wav).map_err(|e| SynthesisError::InvalidAudio {
                index,
                reason: format!("{:#}", e),
            })?;

        let audio_path = format!("{}/{:04}.wav", dir, index);
        self.storage
            .write(&audio_path, &wav)
            .await
            .map_err(|source| SynthesisError::Storage { index, source })?;

        debug!("Segment {} is {:?} long", index, audio_duration);
        Ok(VoiceSegment {
            index,
            audio_duration,
            audio_path,
        })
    }

    /// Synthesizes every request on a bounded pool and returns the segments in index order.
    ///
    /// Returns `Ok(None)` when shutdown is requested before all lines are done. The first
    /// failure stops the remaining work.
    pub async fn synthesize_all(
        &self,
        requests: &[VoiceRequest],
        dir: &str,
        shutdown: &Shutdown,
    ) -> Result<Option<Vec<VoiceSegment>>, SynthesisError> {
        let pb = ProgressBar::new(requests.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let results: Vec<Option<VoiceSegment>> = futures_util::stream::iter(requests)
            .map(|request| {
                let pb = pb.clone();
                async move {
                    if shutdown.is_triggered() {
                        return Ok(None);
                    }
                    let segment = self.synthesize(request.index, &request.text, dir).await?;
                    pb.inc(1);
                    Ok::<_, SynthesisError>(Some(segment))
                }
            })
            .buffer_unordered(self.max_concurrency)
            .try_collect()
            .await?;

        pb.finish_and_clear();

        let Some(mut segments) = results.into_iter().collect::<Option<Vec<_>>>() else {
            info!("Shutdown requested during voice synthesis");
            return Ok(None);
        };
        segments.sort_by_key(|s| s.index);
        Ok(Some(segments))
    }
}
