use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::services::llm::LlmConfig;
use crate::services::publish::YoutubeConfig;
use crate::services::tts::voicevox::VoicevoxConfig;
use crate::services::tts::VoiceProfile;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub llm: LlmConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub video: VideoConfig,

    pub publish: YoutubeConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    #[serde(default = "default_tts_provider")]
    pub provider: String,
    #[serde(default = "default_speaker")]
    pub speaker: u32,
    #[serde(default = "default_speed_scale")]
    pub speed_scale: f64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Spoken before the story.
    #[serde(default = "default_intro_text")]
    pub intro_text: String,
    /// Spoken after the story.
    #[serde(default = "default_outro_text")]
    pub outro_text: String,

    pub voicevox: Option<VoicevoxConfig>,
}

impl AudioConfig {
    pub fn voice_profile(&self) -> VoiceProfile {
        VoiceProfile {
            speaker: self.speaker,
            speed_scale: self.speed_scale,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VideoConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_background_image")]
    pub background_image: String,
    #[serde(default = "default_presenter_image")]
    pub presenter_image: String,
    #[serde(default = "default_presenter_position")]
    pub presenter_position: (i32, i32),
    #[serde(default = "default_presenter_scale")]
    pub presenter_scale: f64,

    #[serde(default)]
    pub caption: CaptionStyle,
    #[serde(default = "default_wrap_width")]
    pub wrap_width: usize,
    #[serde(default = "default_intro_captions")]
    pub intro_captions: Vec<IntroCaption>,

    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_encoder_args")]
    pub encoder_args: Vec<String>,

    #[serde(default = "default_build")]
    pub build_folder: String,
    #[serde(default = "default_output")]
    pub output_folder: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptionStyle {
    #[serde(default = "default_font")]
    pub font: String,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    #[serde(default = "default_title_font_size")]
    pub title_font_size: u32,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_stroke_color")]
    pub stroke_color: String,
    #[serde(default = "default_stroke_width")]
    pub stroke_width: u32,
    #[serde(default = "default_title_stroke_width")]
    pub title_stroke_width: u32,
    /// Rendered glyph width as a fraction of the font size. 1.0 fits full-width CJK text.
    #[serde(default = "default_glyph_width")]
    pub glyph_width: f64,
    /// Line height as a multiple of the font size.
    #[serde(default = "default_line_height")]
    pub line_height: f64,
}

/// One caption of the opening segment, shown from `start` until `end` (or the segment end).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IntroCaption {
    pub text: String,
    pub start: f64,
    #[serde(default)]
    pub end: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_state_path")]
    pub state_path: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_generation_retries")]
    pub generation_retries: usize,
    #[serde(default = "default_publish_retries")]
    pub publish_retries: usize,
    #[serde(default = "default_publish_retry_delay")]
    pub publish_retry_delay_seconds: u64,
    #[serde(default = "default_aborted_cycle_backoff")]
    pub aborted_cycle_backoff_seconds: u64,
}

impl ScheduleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_secs(self.publish_retry_delay_seconds)
    }

    pub fn aborted_cycle_backoff(&self) -> Duration {
        Duration::from_secs(self.aborted_cycle_backoff_seconds)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            speaker: default_speaker(),
            speed_scale: default_speed_scale(),
            concurrency: default_concurrency(),
            intro_text: default_intro_text(),
            outro_text: default_outro_text(),
            voicevox: None,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            background_image: default_background_image(),
            presenter_image: default_presenter_image(),
            presenter_position: default_presenter_position(),
            presenter_scale: default_presenter_scale(),
            caption: CaptionStyle::default(),
            wrap_width: default_wrap_width(),
            intro_captions: default_intro_captions(),
            ffmpeg: default_ffmpeg(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            encoder_args: default_encoder_args(),
            build_folder: default_build(),
            output_folder: default_output(),
        }
    }
}

impl Default for CaptionStyle {
    fn default() -> Self {
        Self {
            font: default_font(),
            font_size: default_font_size(),
            title_font_size: default_title_font_size(),
            color: default_color(),
            stroke_color: default_stroke_color(),
            stroke_width: default_stroke_width(),
            title_stroke_width: default_title_stroke_width(),
            glyph_width: default_glyph_width(),
            line_height: default_line_height(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            poll_interval_seconds: default_poll_interval(),
            generation_retries: default_generation_retries(),
            publish_retries: default_publish_retries(),
            publish_retry_delay_seconds: default_publish_retry_delay(),
            aborted_cycle_backoff_seconds: default_aborted_cycle_backoff(),
        }
    }
}

fn default_tts_provider() -> String {
    "voicevox".to_string()
}
fn default_speaker() -> u32 {
    22
}
fn default_speed_scale() -> f64 {
    0.75
}
fn default_concurrency() -> usize {
    1
}
fn default_intro_text() -> String {
    "語りのずんだへようこそなのだ。この動画では、ぼくがあなたにいろんなものがたりを、よみきかせるのだ。こんかいのものがたりはこれなのだ。".to_string()
}
fn default_outro_text() -> String {
    "これでこのものがたりはおわりなのだ。ぜひほかのものがたりもきいていってもらえるとうれしいのだ。それでは、べつのものがたりでまたあおうなのだ。ばいばい。".to_string()
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_fps() -> u32 {
    60
}
fn default_background_image() -> String {
    "resources/image/background.png".to_string()
}
fn default_presenter_image() -> String {
    "resources/image/presenter.png".to_string()
}
fn default_presenter_position() -> (i32, i32) {
    (1250, 400)
}
fn default_presenter_scale() -> f64 {
    1.2
}
fn default_wrap_width() -> usize {
    38
}
fn default_intro_captions() -> Vec<IntroCaption> {
    vec![
        IntroCaption {
            text: "「語りのずんだ」へようこそなのだ。".to_string(),
            start: 0.0,
            end: Some(3.5),
        },
        IntroCaption {
            text: "この動画では、僕があなたにいろんな物語を読み聞かせるのだ。".to_string(),
            start: 3.5,
            end: Some(11.0),
        },
        IntroCaption {
            text: "今回の物語はこれなのだ。".to_string(),
            start: 11.0,
            end: None,
        },
    ]
}
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}
fn default_video_codec() -> String {
    "libx264".to_string()
}
fn default_audio_codec() -> String {
    "aac".to_string()
}
fn default_encoder_args() -> Vec<String> {
    ["-preset", "slow", "-crf", "23"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_build() -> String {
    "build".to_string()
}
fn default_output() -> String {
    "output".to_string()
}
fn default_font() -> String {
    "fonts/HGRGY.TTC".to_string()
}
fn default_font_size() -> u32 {
    50
}
fn default_title_font_size() -> u32 {
    100
}
fn default_color() -> String {
    "white".to_string()
}
fn default_stroke_color() -> String {
    "black".to_string()
}
fn default_stroke_width() -> u32 {
    1
}
fn default_title_stroke_width() -> u32 {
    2
}
fn default_glyph_width() -> f64 {
    1.0
}
fn default_line_height() -> f64 {
    1.2
}
fn default_state_path() -> String {
    "build/state.json".to_string()
}
fn default_poll_interval() -> u64 {
    10
}
fn default_generation_retries() -> usize {
    4
}
fn default_publish_retries() -> usize {
    2
}
fn default_publish_retry_delay() -> u64 {
    30
}
fn default_aborted_cycle_backoff() -> u64 {
    3600
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.video.build_folder)?;
        fs::create_dir_all(&self.video.output_folder)?;
        Ok(())
    }
}
