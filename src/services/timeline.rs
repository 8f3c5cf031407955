//! Lays out voice segments, captions and images on one continuous timeline.
//!
//! Segment durations are only known after synthesis, so layout happens here rather than
//! in the renderer: every segment gets its start offset, its visual stack and its audio,
//! and the renderer only has to draw what it is given.

use crate::core::config::{CaptionStyle, IntroCaption, VideoConfig};
use crate::core::error::{CompositionError, GenerationError};
use crate::services::story::StoryScript;
use crate::services::tts::VoiceSegment;
use std::time::Duration;

pub const INTRO_PADDING: Duration = Duration::from_millis(2500);
pub const TITLE_PADDING: Duration = Duration::from_millis(1500);
pub const NARRATION_PADDING: Duration = Duration::from_millis(1000);
pub const OUTRO_PADDING: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRole {
    Intro,
    Title,
    Narration,
    Outro,
}

impl SegmentRole {
    /// Extra time after the speech so captions can settle before the cut.
    pub fn padding(self) -> Duration {
        match self {
            SegmentRole::Intro => INTRO_PADDING,
            SegmentRole::Title => TITLE_PADDING,
            SegmentRole::Narration => NARRATION_PADDING,
            SegmentRole::Outro => OUTRO_PADDING,
        }
    }
}

/// What a segment shows, by role.
#[derive(Debug, Clone, PartialEq)]
pub enum Cue {
    /// Opening announcement; captions come from the configured intro schedule.
    Intro,
    Title(String),
    Narration(String),
    /// Closing sign-off, no caption.
    Outro,
}

impl Cue {
    pub fn role(&self) -> SegmentRole {
        match self {
            Cue::Intro => SegmentRole::Intro,
            Cue::Title(_) => SegmentRole::Title,
            Cue::Narration(_) => SegmentRole::Narration,
            Cue::Outro => SegmentRole::Outro,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineInput {
    pub cue: Cue,
    pub voice: VoiceSegment,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Position {
    /// Top-left corner of the frame.
    Origin,
    At { x: i32, y: i32 },
    Center,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImageFit {
    /// Stretched to the frame size.
    Frame,
    /// Native size multiplied by a factor.
    Scale(f64),
}

/// Relative to the start of the owning segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Duration,
    pub end: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerContent {
    Image {
        path: String,
        fit: ImageFit,
    },
    Text {
        lines: Vec<String>,
        font_size: u32,
        stroke_width: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisualLayer {
    pub content: LayerContent,
    pub position: Position,
    pub window: TimeWindow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub path: String,
    /// Never longer than the owning segment.
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineSegment {
    pub ordinal: usize,
    pub role: SegmentRole,
    pub start: Duration,
    pub duration: Duration,
    /// Bottom to top.
    pub layers: Vec<VisualLayer>,
    pub audio: AudioTrack,
}

impl TimelineSegment {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    segments: Vec<TimelineSegment>,
}

impl Timeline {
    pub fn segments(&self) -> &[TimelineSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_duration(&self) -> Duration {
        self.segments.iter().map(|s| s.duration).sum()
    }
}

/// Splits `text` into lines of at most `width` characters. Never drops characters.
pub fn wrap_caption(text: &str, width: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if width == 0 || chars.is_empty() {
        return vec![text.to_string()];
    }
    chars
        .chunks(width)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Estimates caption sizes and checks them against the frame.
///
/// The builder lays captions out with the same measurements, so a story accepted by
/// [`CaptionLimits::check_story`] never fails the caption bounds checks later.
#[derive(Debug, Clone)]
pub struct CaptionLimits {
    frame: (u32, u32),
    style: CaptionStyle,
    wrap_width: usize,
}

impl CaptionLimits {
    pub fn new(video: &VideoConfig) -> Self {
        Self {
            frame: (video.width, video.height),
            style: video.caption.clone(),
            wrap_width: video.wrap_width,
        }
    }

    /// Pixel width and height of `lines` at `font_size`.
    fn measure(&self, lines: &[String], font_size: u32) -> (u32, u32) {
        let longest = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
        let width = (longest as f64 * font_size as f64 * self.style.glyph_width).ceil() as u32;
        let height =
            (lines.len() as f64 * font_size as f64 * self.style.line_height).ceil() as u32;
        (width, height)
    }

    fn fits(&self, lines: &[String], font_size: u32) -> bool {
        let (width, height) = self.measure(lines, font_size);
        width <= self.frame.0 && height <= self.frame.1
    }

    /// Rejects a story whose title or narration would not fit on screen.
    pub fn check_story(&self, story: &StoryScript) -> Result<(), GenerationError> {
        let title = story.title();
        if !self.fits(&[title.to_string()], self.style.title_font_size) {
            return Err(GenerationError::CaptionTooLarge {
                line: 1,
                chars: title.chars().count(),
            });
        }
        for (i, line) in story.display_lines().iter().enumerate().skip(1) {
            if !self.fits(&wrap_caption(line, self.wrap_width), self.style.font_size) {
                return Err(GenerationError::CaptionTooLarge {
                    line: i + 1,
                    chars: line.chars().count(),
                });
            }
        }
        Ok(())
    }
}

pub struct TimelineBuilder {
    limits: CaptionLimits,
    background_image: String,
    presenter_image: String,
    presenter_position: (i32, i32),
    presenter_scale: f64,
    intro_captions: Vec<IntroCaption>,
}

impl TimelineBuilder {
    pub fn new(video: &VideoConfig) -> Self {
        Self {
            limits: CaptionLimits::new(video),
            background_image: video.background_image.clone(),
            presenter_image: video.presenter_image.clone(),
            presenter_position: video.presenter_position,
            presenter_scale: video.presenter_scale,
            intro_captions: video.intro_captions.clone(),
        }
    }

    /// Builds the timeline. Inputs must already be in playback order.
    pub fn build(&self, inputs: &[TimelineInput]) -> Result<Timeline, CompositionError> {
        if inputs.is_empty() {
            return Err(CompositionError::Empty);
        }

        let mut segments = Vec::with_capacity(inputs.len());
        let mut cursor = Duration::ZERO;
        let mut previous: Option<usize> = None;

        for input in inputs {
            let ordinal = input.voice.index;
            if let Some(previous) = previous {
                if ordinal <= previous {
                    return Err(CompositionError::OutOfOrder { previous, ordinal });
                }
            }
            previous = Some(ordinal);

            if input.voice.audio_duration.is_zero() {
                return Err(CompositionError::NonPositiveDuration { ordinal });
            }

            let role = input.cue.role();
            let duration = input.voice.audio_duration + role.padding();
            let whole = TimeWindow {
                start: Duration::ZERO,
                end: duration,
            };

            let mut layers = vec![
                VisualLayer {
                    content: LayerContent::Image {
                        path: self.background_image.clone(),
                        fit: ImageFit::Frame,
                    },
                    position: Position::Origin,
                    window: whole,
                },
                VisualLayer {
                    content: LayerContent::Image {
                        path: self.presenter_image.clone(),
                        fit: ImageFit::Scale(self.presenter_scale),
                    },
                    position: Position::At {
                        x: self.presenter_position.0,
                        y: self.presenter_position.1,
                    },
                    window: whole,
                },
            ];
            layers.extend(self.caption_layers(ordinal, &input.cue, duration)?);

            segments.push(TimelineSegment {
                ordinal,
                role,
                start: cursor,
                duration,
                layers,
                audio: AudioTrack {
                    path: input.voice.audio_path.clone(),
                    duration: input.voice.audio_duration.min(duration),
                },
            });
            cursor += duration;
        }

        Ok(Timeline { segments })
    }

    fn caption_layers(
        &self,
        ordinal: usize,
        cue: &Cue,
        duration: Duration,
    ) -> Result<Vec<VisualLayer>, CompositionError> {
        let whole = TimeWindow {
            start: Duration::ZERO,
            end: duration,
        };
        let style = &self.limits.style;

        match cue {
            Cue::Outro => Ok(Vec::new()),
            Cue::Title(title) => {
                let layer = self.text_layer(
                    ordinal,
                    vec![title.clone()],
                    style.title_font_size,
                    style.title_stroke_width,
                    whole,
                )?;
                Ok(vec![layer])
            }
            Cue::Narration(text) => {
                let layer = self.text_layer(
                    ordinal,
                    wrap_caption(text, self.limits.wrap_width),
                    style.font_size,
                    style.stroke_width,
                    whole,
                )?;
                Ok(vec![layer])
            }
            Cue::Intro => self
                .intro_windows(ordinal, duration)?
                .into_iter()
                .map(|(text, window)| {
                    self.text_layer(
                        ordinal,
                        vec![text.to_string()],
                        style.font_size,
                        style.stroke_width,
                        window,
                    )
                })
                .collect(),
        }
    }

    /// Places the intro captions one after another inside the segment.
    ///
    /// A caption ends at its configured end, the next caption's start, or the segment end,
    /// whichever comes first, so two intro captions are never on screen together.
    fn intro_windows(
        &self,
        ordinal: usize,
        duration: Duration,
    ) -> Result<Vec<(&str, TimeWindow)>, CompositionError> {
        let mut captions: Vec<&IntroCaption> = self.intro_captions.iter().collect();
        captions.sort_by(|a, b| a.start.total_cmp(&b.start));

        let mut windows = Vec::with_capacity(captions.len());
        for (i, caption) in captions.iter().enumerate() {
            let start = seconds(caption.start);
            let mut end = caption.end.map(seconds).unwrap_or(duration).min(duration);
            if let Some(next) = captions.get(i + 1) {
                end = end.min(seconds(next.start));
            }
            if start >= end {
                return Err(CompositionError::CaptionOutsideSegment {
                    ordinal,
                    start,
                    segment: duration,
                });
            }
            windows.push((caption.text.as_str(), TimeWindow { start, end }));
        }
        Ok(windows)
    }

    fn text_layer(
        &self,
        ordinal: usize,
        lines: Vec<String>,
        font_size: u32,
        stroke_width: u32,
        window: TimeWindow,
    ) -> Result<VisualLayer, CompositionError> {
        let (frame_width, frame_height) = self.limits.frame;
        let (width, height) = self.limits.measure(&lines, font_size);
        if width > frame_width {
            return Err(CompositionError::CaptionTooWide {
                ordinal,
                width,
                frame_width,
            });
        }
        if height > frame_height {
            return Err(CompositionError::CaptionTooTall {
                ordinal,
                height,
                frame_height,
            });
        }

        Ok(VisualLayer {
            content: LayerContent::Text {
                lines,
                font_size,
                stroke_width,
            },
            position: Position::Center,
            window,
        })
    }
}

fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}
