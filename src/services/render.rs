//! Renders a [`Timeline`] into a single MP4 with ffmpeg.
//!
//! Each segment is encoded on its own, then the segment files are joined with the concat
//! demuxer. Segment lengths are whole frames with the rounding carried forward, so every
//! segment starts within half a frame of its timeline position however long the video is.

use crate::core::config::{CaptionStyle, VideoConfig};
use crate::core::error::CompositionError;
use crate::services::timeline::{
    ImageFit, LayerContent, Position, Timeline, TimelineSegment, TimeWindow,
};
use anyhow::anyhow;
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Writes the finished video to `output`, using `work_dir` for intermediates.
    async fn render(
        &self,
        timeline: &Timeline,
        work_dir: &Path,
        output: &Path,
    ) -> Result<(), CompositionError>;
}

pub struct FfmpegRenderer {
    ffmpeg: String,
    width: u32,
    height: u32,
    fps: u32,
    video_codec: String,
    audio_codec: String,
    encoder_args: Vec<String>,
    caption: CaptionStyle,
}

impl FfmpegRenderer {
    pub fn new(video: &VideoConfig) -> Self {
        Self {
            ffmpeg: video.ffmpeg.clone(),
            width: video.width,
            height: video.height,
            fps: video.fps,
            video_codec: video.video_codec.clone(),
            audio_codec: video.audio_codec.clone(),
            encoder_args: video.encoder_args.clone(),
            caption: video.caption.clone(),
        }
    }

    /// Builds the ffmpeg arguments for one segment.
    ///
    /// `text_files` holds one caption file per text layer, in layer order. `frames` is the
    /// segment length from [`frame_counts`].
    fn segment_args(
        &self,
        segment: &TimelineSegment,
        frames: u64,
        text_files: &[PathBuf],
        output: &Path,
    ) -> Vec<String> {
        let duration = format!("{:.6}", frames as f64 / self.fps.max(1) as f64);
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];

        let mut input = 0;
        let mut filters = vec![format!(
            "color=c=black:s={}x{}:r={}:d={}[v0]",
            self.width, self.height, self.fps, duration
        )];
        let mut current = "v0".to_string();
        let mut texts = text_files.iter();

        for (n, layer) in segment.layers.iter().enumerate() {
            let next = format!("v{}", n + 1);
            let enable = enable_expr(&layer.window);
            match &layer.content {
                LayerContent::Image { path, fit } => {
                    args.extend([
                        "-loop".into(),
                        "1".into(),
                        "-t".into(),
                        duration.clone(),
                        "-i".into(),
                        path.clone(),
                    ]);
                    let scale = match fit {
                        ImageFit::Frame => format!("scale={}:{}", self.width, self.height),
                        ImageFit::Scale(f) => format!("scale=iw*{}:ih*{}", f, f),
                    };
                    let (x, y) = overlay_position(&layer.position);
                    filters.push(format!("[{}:v]{}[img{}]", input, scale, n));
                    filters.push(format!(
                        "[{}][img{}]overlay=x={}:y={}:enable='{}'[{}]",
                        current, n, x, y, enable, next
                    ));
                    input += 1;
                }
                LayerContent::Text {
                    font_size,
                    stroke_width,
                    ..
                } => {
                    let Some(text_file) = texts.next() else {
                        continue;
                    };
                    let (x, y) = text_position(&layer.position);
                    let spacing = (*font_size as f64 * (self.caption.line_height - 1.0))
                        .round()
                        .max(0.0);
                    filters.push(format!(
                        "[{}]drawtext=fontfile='{}':textfile='{}':fontsize={}:fontcolor={}:borderw={}:bordercolor={}:line_spacing={}:x={}:y={}:enable='{}'[{}]",
                        current,
                        escape_filter_path(&self.caption.font),
                        escape_filter_path(&text_file.to_string_lossy()),
                        font_size,
                        self.caption.color,
                        stroke_width,
                        self.caption.stroke_color,
                        spacing,
                        x,
                        y,
                        enable,
                        next
                    ));
                }
            }
            current = next;
        }

        filters.push(format!("[{}]format=yuv420p[vout]", current));
        filters.push(format!("[{}:a]apad=whole_dur={}[aout]", input, duration));
        args.extend(["-i".into(), segment.audio.path.clone()]);

        args.extend([
            "-filter_complex".into(),
            filters.join(";"),
            "-map".into(),
            "[vout]".into(),
            "-map".into(),
            "[aout]".into(),
            "-r".into(),
            self.fps.to_string(),
            "-c:v".into(),
            self.video_codec.clone(),
            "-c:a".into(),
            self.audio_codec.clone(),
        ]);
        args.extend(self.encoder_args.iter().cloned());
        args.extend([
            "-frames:v".into(),
            frames.to_string(),
            "-t".into(),
            duration,
            "-y".into(),
            output.to_string_lossy().into_owned(),
        ]);
        args
    }

    async fn write_text_files(
        &self,
        segment: &TimelineSegment,
        work_dir: &Path,
    ) -> Result<Vec<PathBuf>, CompositionError> {
        let mut files = Vec::new();
        for (n, layer) in segment.layers.iter().enumerate() {
            if let LayerContent::Text { lines, .. } = &layer.content {
                let path = work_dir.join(format!("caption_{:04}_{}.txt", segment.ordinal, n));
                tokio::fs::write(&path, lines.join("\n"))
                    .await
                    .map_err(|e| CompositionError::Io(anyhow!("{}: {}", path.display(), e)))?;
                files.push(path);
            }
        }
        Ok(files)
    }

    async fn run(&self, args: &[String]) -> Result<(), CompositionError> {
        debug!("{} {}", self.ffmpeg, args.join(" "));
        let output = Command::new(&self.ffmpeg)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CompositionError::Encoder(format!("failed to start {}: {}", self.ffmpeg, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CompositionError::Encoder(format!(
                "{} exited with {}: {}",
                self.ffmpeg,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Renderer for FfmpegRenderer {
    async fn render(
        &self,
        timeline: &Timeline,
        work_dir: &Path,
        output: &Path,
    ) -> Result<(), CompositionError> {
        if timeline.is_empty() {
            return Err(CompositionError::Empty);
        }
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| CompositionError::Io(anyhow!("{}: {}", work_dir.display(), e)))?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CompositionError::Io(anyhow!("{}: {}", parent.display(), e)))?;
        }

        let pb = ProgressBar::new(timeline.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let frames = frame_counts(timeline, self.fps);
        let mut parts = Vec::with_capacity(timeline.len());
        for (segment, frames) in timeline.segments().iter().zip(frames) {
            pb.set_message(format!("segment {}", segment.ordinal));
            let text_files = self.write_text_files(segment, work_dir).await?;
            let part = work_dir.join(format!("segment_{:04}.mp4", segment.ordinal));
            self.run(&self.segment_args(segment, frames, &text_files, &part))
                .await?;
            parts.push(part);
            pb.inc(1);
        }
        pb.finish_and_clear();

        let list = work_dir.join("segments.txt");
        tokio::fs::write(&list, concat_list(&parts))
            .await
            .map_err(|e| CompositionError::Io(anyhow!("{}: {}", list.display(), e)))?;
        self.run(&concat_args(&list, output)).await?;

        info!(
            "Rendered {} segments ({:?}) to {}",
            timeline.len(),
            timeline.total_duration(),
            output.display()
        );
        Ok(())
    }
}

fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| {
            // Paths are resolved relative to the list file, which sits next to the parts
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("file '{}'\n", name.replace('\'', "'\\''"))
        })
        .collect()
}

fn concat_args(list: &Path, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-y".into(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Length of each segment in whole frames.
///
/// Segment ends are rounded to the nearest frame boundary and each count is the difference
/// to the previous end, so rounding error never accumulates. Every segment gets at least
/// one frame.
fn frame_counts(timeline: &Timeline, fps: u32) -> Vec<u64> {
    let fps = fps.max(1) as u128;
    let mut done = 0u64;
    timeline
        .segments()
        .iter()
        .map(|segment| {
            let end = ((segment.end().as_nanos() * fps + 500_000_000) / 1_000_000_000) as u64;
            let frames = end.saturating_sub(done).max(1);
            done += frames;
            frames
        })
        .collect()
}

fn secs(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}

fn enable_expr(window: &TimeWindow) -> String {
    format!("between(t,{},{})", secs(window.start), secs(window.end))
}

fn overlay_position(position: &Position) -> (String, String) {
    match position {
        Position::Origin => ("0".into(), "0".into()),
        Position::At { x, y } => (x.to_string(), y.to_string()),
        Position::Center => ("(W-w)/2".into(), "(H-h)/2".into()),
    }
}

fn text_position(position: &Position) -> (String, String) {
    match position {
        Position::Origin => ("0".into(), "0".into()),
        Position::At { x, y } => (x.to_string(), y.to_string()),
        Position::Center => ("(w-text_w)/2".into(), "(h-text_h)/2".into()),
    }
}

/// Escapes a path for use inside a single-quoted filter option.
fn escape_filter_path(path: &str) -> String {
    path.replace('\\', "/").replace('\'', "'\\''").replace(':', "\\:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::timeline::{Cue, TimelineBuilder, TimelineInput};
    use crate::services::tts::VoiceSegment;

    fn timeline(cues: Vec<Cue>) -> Timeline {
        let inputs: Vec<TimelineInput> = cues
            .into_iter()
            .enumerate()
            .map(|(index, cue)| TimelineInput {
                cue,
                voice: VoiceSegment {
                    index,
                    audio_duration: Duration::from_millis(12_000),
                    audio_path: format!("voice/{:04}.wav", index),
                },
            })
            .collect();
        TimelineBuilder::new(&VideoConfig::default())
            .build(&inputs)
            .unwrap()
    }

    #[test]
    fn test_segment_args_for_narration() {
        let renderer = FfmpegRenderer::new(&VideoConfig::default());
        let timeline = timeline(vec![Cue::Narration("むかしむかし".to_string())]);
        let segment = &timeline.segments()[0];
        let args = renderer.segment_args(
            segment,
            780,
            &[PathBuf::from("work/caption_0000_2.txt")],
            Path::new("work/segment_0000.mp4"),
        );

        // Two looped images, then the voice
        let inputs: Vec<&String> = args
            .iter()
            .zip(args.iter().skip(1))
            .filter(|(flag, _)| *flag == "-i")
            .map(|(_, value)| value)
            .collect();
        assert_eq!(
            inputs,
            vec![
                "resources/image/background.png",
                "resources/image/presenter.png",
                "voice/0000.wav"
            ]
        );

        let graph_at = args.iter().position(|a| a == "-filter_complex").unwrap();
        let graph = &args[graph_at + 1];
        assert!(graph.starts_with("color=c=black:s=1920x1080:r=60:d=13.000000[v0]"));
        assert!(graph.contains("[0:v]scale=1920:1080[img0]"));
        assert!(graph.contains("[1:v]scale=iw*1.2:ih*1.2[img1]"));
        assert!(graph.contains("overlay=x=1250:y=400:enable='between(t,0.000,13.000)'[v2]"));
        assert!(graph.contains("textfile='work/caption_0000_2.txt':fontsize=50"));
        assert!(graph.contains("fontfile='fonts/HGRGY.TTC'"));
        assert!(graph.contains("[2:a]apad=whole_dur=13.000000[aout]"));
        assert!(graph.ends_with("[aout]"));

        let tail: Vec<&str> = args[args.len() - 6..].iter().map(|s| s.as_str()).collect();
        assert_eq!(
            tail,
            vec!["-frames:v", "780", "-t", "13.000000", "-y", "work/segment_0000.mp4"]
        );
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "23"));
    }

    #[test]
    fn test_intro_captions_get_their_own_windows() {
        let renderer = FfmpegRenderer::new(&VideoConfig::default());
        let timeline = timeline(vec![Cue::Intro]);
        let segment = &timeline.segments()[0];
        let files: Vec<PathBuf> = (0..3).map(|n| PathBuf::from(format!("c{}.txt", n))).collect();
        let args = renderer.segment_args(segment, 870, &files, Path::new("out.mp4"));
        let graph_at = args.iter().position(|a| a == "-filter_complex").unwrap();
        let graph = &args[graph_at + 1];

        assert!(graph.contains("textfile='c0.txt'"));
        assert!(graph.contains("enable='between(t,0.000,3.500)'[v3]"));
        assert!(graph.contains("enable='between(t,3.500,11.000)'[v4]"));
        assert!(graph.contains("enable='between(t,11.000,14.500)'[v5]"));
        assert!(graph.contains("[v5]format=yuv420p[vout]"));
    }

    #[test]
    fn test_frame_counts_do_not_drift() {
        // 1.010s segments are 60.6 frames long at 60 fps
        let inputs: Vec<TimelineInput> = (0..100)
            .map(|index| TimelineInput {
                cue: Cue::Narration("。".to_string()),
                voice: VoiceSegment {
                    index,
                    audio_duration: Duration::from_millis(10),
                    audio_path: String::new(),
                },
            })
            .collect();
        let timeline = TimelineBuilder::new(&VideoConfig::default())
            .build(&inputs)
            .unwrap();

        let frames = frame_counts(&timeline, 60);
        assert_eq!(frames.len(), 100);
        assert_eq!(frames.iter().sum::<u64>(), 6060);
        assert!(frames.iter().all(|&f| f == 60 || f == 61));

        let mut start = 0u64;
        for (segment, count) in timeline.segments().iter().zip(&frames) {
            let error = start as i128 * 1_000_000_000 - segment.start.as_nanos() as i128 * 60;
            assert!(error.abs() <= 500_000_000, "segment {} drifted", segment.ordinal);
            start += count;
        }
    }

    #[test]
    fn test_concat_list_and_args() {
        let parts = vec![
            PathBuf::from("work/segment_0000.mp4"),
            PathBuf::from("work/segment_0001.mp4"),
        ];
        assert_eq!(
            concat_list(&parts),
            "file 'segment_0000.mp4'\nfile 'segment_0001.mp4'\n"
        );

        let args = concat_args(Path::new("work/segments.txt"), Path::new("output/movie.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "concat"));
        assert!(args.windows(2).any(|w| w[0] == "-c" && w[1] == "copy"));
        assert_eq!(args.last().unwrap(), "output/movie.mp4");
    }

    #[test]
    fn test_escape_filter_path() {
        assert_eq!(escape_filter_path("C:\\fonts\\a.ttc"), "C\\:/fonts/a.ttc");
        assert_eq!(escape_filter_path("it's.txt"), "it'\\''s.txt");
    }

    #[tokio::test]
    async fn test_missing_encoder_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VideoConfig::default();
        config.ffmpeg = "definitely-not-an-ffmpeg-binary".to_string();
        let renderer = FfmpegRenderer::new(&config);
        let timeline = timeline(vec![Cue::Narration("a".to_string())]);

        let err = renderer
            .render(&timeline, &dir.path().join("work"), &dir.path().join("out.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompositionError::Encoder(_)));
        // Caption files were prepared before the encoder was started
        assert!(dir.path().join("work/caption_0000_2.txt").exists());
    }
}
