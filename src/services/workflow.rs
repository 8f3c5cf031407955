use crate::core::config::Config;
use crate::core::error::{PipelineError, PublishError};
use crate::core::io::Storage;
use crate::core::shutdown::Shutdown;
use crate::core::state::{RunStateStore, Stage};
use crate::services::publish::{PublishMetadata, Publisher};
use crate::services::render::Renderer;
use crate::services::story::{StoryGenerator, StoryScript};
use crate::services::timeline::{CaptionLimits, Cue, TimelineBuilder, TimelineInput};
use crate::services::tts::{VoiceRequest, VoiceSegment, VoiceSynthesizer};
use chrono::{NaiveDate, NaiveDateTime};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// Wall clock in the machine's local time zone.
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayDecision {
    /// Today's story is already out.
    Wait,
    Run,
}

pub fn day_decision(last_completed: Option<NaiveDate>, today: NaiveDate) -> DayDecision {
    match last_completed {
        Some(last) if last >= today => DayDecision::Wait,
        _ => DayDecision::Run,
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed { date: NaiveDate, video_id: String },
    /// Publishing failed; the day was not recorded and will be attempted again.
    Aborted(PublishError),
    /// Shutdown was requested before the cycle finished.
    Interrupted,
}

/// Drives one story from generation to publication, once per calendar day.
pub struct Pipeline {
    config: Config,
    story: Box<dyn StoryGenerator>,
    synthesizer: VoiceSynthesizer,
    limits: CaptionLimits,
    timeline: TimelineBuilder,
    renderer: Box<dyn Renderer>,
    publisher: Box<dyn Publisher>,
    state: Box<dyn RunStateStore>,
    storage: Arc<dyn Storage>,
    clock: Box<dyn Clock>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        story: Box<dyn StoryGenerator>,
        synthesizer: VoiceSynthesizer,
        renderer: Box<dyn Renderer>,
        publisher: Box<dyn Publisher>,
        state: Box<dyn RunStateStore>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let limits = CaptionLimits::new(&config.video);
        let timeline = TimelineBuilder::new(&config.video);
        Self {
            config,
            story,
            synthesizer,
            limits,
            timeline,
            renderer,
            publisher,
            state,
            storage,
            clock: Box::new(LocalClock),
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs cycles until shutdown is requested or a stage fails fatally.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<(), PipelineError> {
        loop {
            if shutdown.is_triggered() {
                info!("Shutdown requested, stopping");
                return Ok(());
            }
            if !self.wait_for_day(shutdown).await? {
                info!("Shutdown requested while waiting for the next day");
                return Ok(());
            }

            match self.run_cycle(shutdown).await? {
                CycleOutcome::Completed { date, video_id } => {
                    info!("Cycle for {} completed, published as {}", date, video_id);
                }
                CycleOutcome::Interrupted => {
                    info!("Shutdown requested, cycle abandoned");
                    return Ok(());
                }
                CycleOutcome::Aborted(err) => {
                    let backoff = self.config.schedule.aborted_cycle_backoff();
                    error!("[{}] Cycle aborted: {}", Stage::Publishing, err);
                    warn!("Retrying today's cycle in {:?}", backoff);
                    if !shutdown.sleep(backoff).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Polls the run state until today has no completed cycle. Returns `false` on shutdown.
    async fn wait_for_day(&self, shutdown: &Shutdown) -> Result<bool, PipelineError> {
        let poll = self.config.schedule.poll_interval();
        let mut announced = false;
        loop {
            let last = self.state.load().await.map_err(PipelineError::StateLoad)?;
            let today = self.clock.today();
            if day_decision(last, today) == DayDecision::Run {
                return Ok(true);
            }
            if !announced {
                info!("[{}] {} is already done", Stage::WaitingForDay, today);
                announced = true;
            }
            if !shutdown.sleep(poll).await {
                return Ok(false);
            }
        }
    }

    /// Runs a single cycle for the current day.
    pub async fn run_cycle(&self, shutdown: &Shutdown) -> Result<CycleOutcome, PipelineError> {
        let started = self.clock.now();
        let today = started.date();
        let stamp = started.format("%Y%m%d%H%M").to_string();
        let work_dir = format!("{}/{}", self.config.video.build_folder, stamp);
        info!("Starting cycle for {} in {}", today, work_dir);

        info!("[{}]", Stage::GeneratingStory);
        let Some(story) = self.generate_story(shutdown).await? else {
            return Ok(CycleOutcome::Interrupted);
        };
        self.save_script(&story, &work_dir).await;

        info!("[{}] {} lines", Stage::SynthesizingVoice, story.line_count() + 2);
        let requests = voice_requests(
            &story,
            &self.config.audio.intro_text,
            &self.config.audio.outro_text,
        );
        let voice_dir = format!("{}/voice", work_dir);
        if let Err(e) = self.storage.delete(&voice_dir).await {
            warn!("Could not clear {}: {:#}", voice_dir, e);
        }
        let Some(segments) = self
            .synthesizer
            .synthesize_all(&requests, &voice_dir, shutdown)
            .await?
        else {
            return Ok(CycleOutcome::Interrupted);
        };

        info!("[{}]", Stage::BuildingTimeline);
        let timeline = self.timeline.build(&timeline_inputs(&story, segments))?;
        let render_dir = PathBuf::from(format!("{}/render", work_dir));
        let output = Path::new(&self.config.video.output_folder).join(format!("movie_{}.mp4", stamp));
        self.renderer.render(&timeline, &render_dir, &output).await?;

        if shutdown.is_triggered() {
            return Ok(CycleOutcome::Interrupted);
        }

        info!("[{}] {}", Stage::Publishing, output.display());
        let metadata = PublishMetadata::for_story(&self.config.publish, story.title());
        let video_id = match self.publish(&output, &metadata, shutdown).await {
            Ok(id) => id,
            Err(err) => return Ok(CycleOutcome::Aborted(err)),
        };

        info!("[{}] {}", Stage::RecordingCompletion, today);
        self.state
            .save(today)
            .await
            .map_err(PipelineError::StateSave)?;

        Ok(CycleOutcome::Completed {
            date: today,
            video_id,
        })
    }

    /// Asks for a story until one validates. Returns `None` on shutdown.
    async fn generate_story(
        &self,
        shutdown: &Shutdown,
    ) -> Result<Option<StoryScript>, PipelineError> {
        let attempts = self.config.schedule.generation_retries + 1;
        let mut attempt = 0;
        loop {
            if shutdown.is_triggered() {
                return Ok(None);
            }
            attempt += 1;
            let generated = self
                .story
                .generate()
                .await
                .and_then(|story| self.limits.check_story(&story).map(|()| story));
            match generated {
                Ok(story) => {
                    info!("Story \"{}\" has {} lines", story.title(), story.line_count());
                    return Ok(Some(story));
                }
                Err(err) if attempt < attempts => {
                    warn!("Story attempt {}/{} rejected: {}", attempt, attempts, err);
                }
                Err(last) => {
                    return Err(PipelineError::StoryRetriesExhausted { attempts, last });
                }
            }
        }
    }

    async fn publish(
        &self,
        media: &Path,
        metadata: &PublishMetadata,
        shutdown: &Shutdown,
    ) -> Result<String, PublishError> {
        let attempts = self.config.schedule.publish_retries + 1;
        let delay = self.config.schedule.publish_retry_delay();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.publisher.publish(media, metadata).await {
                Ok(id) => return Ok(id),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(
                        "Publish attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, attempts, err, delay
                    );
                    if !shutdown.sleep(delay).await {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Keeps both tracks next to the cycle's audio for inspection.
    async fn save_script(&self, story: &StoryScript, work_dir: &str) {
        let content = format!(
            "{}\n;\n{}\n",
            story.display_lines().join("\n"),
            story.speak_lines().join("\n")
        );
        let path = format!("{}/story.txt", work_dir);
        if let Err(e) = self.storage.write(&path, content.as_bytes()).await {
            warn!("Could not save {}: {:#}", path, e);
        }
    }
}

/// Intro first, then every speak line, then the outro. Indices follow playback order.
fn voice_requests(story: &StoryScript, intro: &str, outro: &str) -> Vec<VoiceRequest> {
    let mut requests = Vec::with_capacity(story.line_count() + 2);
    requests.push(VoiceRequest {
        index: 0,
        text: intro.to_string(),
    });
    for (i, line) in story.speak_lines().iter().enumerate() {
        requests.push(VoiceRequest {
            index: i + 1,
            text: line.clone(),
        });
    }
    requests.push(VoiceRequest {
        index: story.line_count() + 1,
        text: outro.to_string(),
    });
    requests
}

fn timeline_inputs(story: &StoryScript, segments: Vec<VoiceSegment>) -> Vec<TimelineInput> {
    let outro = story.line_count() + 1;
    segments
        .into_iter()
        .map(|voice| {
            let cue = match voice.index {
                0 => Cue::Intro,
                1 => Cue::Title(story.title().to_string()),
                i if i == outro => Cue::Outro,
                i => Cue::Narration(story.display_lines()[i - 1].clone()),
            };
            TimelineInput { cue, voice }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{CompositionError, GenerationError, SynthesisError};
    use crate::core::io::MemoryStorage;
    use crate::core::shutdown::{shutdown_channel, ShutdownTrigger};
    use crate::core::state::JsonRunStateStore;
    use crate::services::llm::LlmClient;
    use crate::services::story::LlmStoryGenerator;
    use crate::services::timeline::{SegmentRole, Timeline};
    use crate::services::tts::{TtsClient, VoiceProfile};
    use crate::utils::audio::create_dummy_wav;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    const STORY: &str = "星の子\n空から星が落ちた。\n子供が拾った。\n;\nほしのこ\nそらからほしがおちた。\nこどもがひろった。\n";
    const MISMATCHED: &str = "a\nb\nc\nd\ne\n;\nA\nB\nC\nD\n";
    const STATE_PATH: &str = "build/state.json";

    #[derive(Debug)]
    struct ScriptedLlm {
        responses: Mutex<VecDeque<String>>,
        calls: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("no more responses"))
        }
    }

    /// One second of audio for every line.
    struct SteadyTts;

    #[async_trait]
    impl TtsClient for SteadyTts {
        async fn synthesize(
            &self,
            _text: &str,
            _voice: &VoiceProfile,
        ) -> Result<Vec<u8>, SynthesisError> {
            Ok(create_dummy_wav(48_000, 24_000))
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        rendered: Arc<Mutex<Vec<(Timeline, PathBuf)>>>,
    }

    #[async_trait]
    impl Renderer for RecordingRenderer {
        async fn render(
            &self,
            timeline: &Timeline,
            _work_dir: &Path,
            output: &Path,
        ) -> Result<(), CompositionError> {
            self.rendered
                .lock()
                .unwrap()
                .push((timeline.clone(), output.to_path_buf()));
            Ok(())
        }
    }

    struct ScriptedPublisher {
        results: Mutex<VecDeque<Result<String, PublishError>>>,
        published: Arc<Mutex<Vec<PublishMetadata>>>,
        /// Fired after a successful upload so `run` has a way out.
        stop_after_success: Option<ShutdownTrigger>,
    }

    #[async_trait]
    impl Publisher for ScriptedPublisher {
        async fn publish(
            &self,
            _media: &Path,
            metadata: &PublishMetadata,
        ) -> Result<String, PublishError> {
            self.published.lock().unwrap().push(metadata.clone());
            let result = self
                .results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("video-id".to_string()));
            if result.is_ok() {
                if let Some(trigger) = &self.stop_after_success {
                    trigger.trigger();
                }
            }
            result
        }
    }

    struct FixedClock(NaiveDateTime);

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            self.0
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    struct Harness {
        pipeline: Pipeline,
        storage: Arc<MemoryStorage>,
        llm_calls: Arc<Mutex<usize>>,
        rendered: Arc<Mutex<Vec<(Timeline, PathBuf)>>>,
        published: Arc<Mutex<Vec<PublishMetadata>>>,
    }

    impl Harness {
        fn new(
            responses: &[&str],
            publish_results: Vec<Result<String, PublishError>>,
            stop_after_success: Option<ShutdownTrigger>,
        ) -> Self {
            let config = Config::from_yaml(
                r#"
llm:
  provider: openai
publish:
  client_id: id
  client_secret: secret
  refresh_token: refresh
video:
  intro_captions:
    - text: ようこそ
      start: 0.0
"#,
            )
            .unwrap();

            let storage = Arc::new(MemoryStorage::new());
            let llm_calls = Arc::new(Mutex::new(0));
            let llm = ScriptedLlm {
                responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
                calls: llm_calls.clone(),
            };
            let renderer = RecordingRenderer::default();
            let rendered = renderer.rendered.clone();
            let published = Arc::new(Mutex::new(Vec::new()));
            let publisher = ScriptedPublisher {
                results: Mutex::new(publish_results.into()),
                published: published.clone(),
                stop_after_success,
            };
            let synthesizer = VoiceSynthesizer::new(
                Arc::new(SteadyTts),
                storage.clone(),
                config.audio.voice_profile(),
                2,
            );
            let clock = FixedClock(today().and_hms_opt(6, 30, 0).unwrap());

            let pipeline = Pipeline::new(
                config,
                Box::new(LlmStoryGenerator::new(Box::new(llm))),
                synthesizer,
                Box::new(renderer),
                Box::new(publisher),
                Box::new(JsonRunStateStore::new(STATE_PATH, storage.clone())),
                storage.clone(),
            )
            .with_clock(Box::new(clock));

            Self {
                pipeline,
                storage,
                llm_calls,
                rendered,
                published,
            }
        }

        async fn last_completed(&self) -> Option<NaiveDate> {
            JsonRunStateStore::new(STATE_PATH, self.storage.clone())
                .load()
                .await
                .unwrap()
        }
    }

    #[test]
    fn test_day_decision() {
        let today = today();
        let yesterday = today.pred_opt().unwrap();
        assert_eq!(day_decision(None, today), DayDecision::Run);
        assert_eq!(day_decision(Some(yesterday), today), DayDecision::Run);
        assert_eq!(day_decision(Some(today), today), DayDecision::Wait);
        // A clock that went backwards does not cause a second run
        assert_eq!(day_decision(Some(today), yesterday), DayDecision::Wait);
    }

    #[test]
    fn test_day_decision_is_idempotent() {
        let today = today();
        for last in [None, Some(today), today.pred_opt()] {
            let first = day_decision(last, today);
            for _ in 0..3 {
                assert_eq!(day_decision(last, today), first);
            }
        }
    }

    #[test]
    fn test_voice_requests_and_cues_follow_playback_order() {
        let story = StoryScript::parse(STORY).unwrap();
        let requests = voice_requests(&story, "intro", "outro");
        let texts: Vec<&str> = requests.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["intro", "ほしのこ", "そらからほしがおちた。", "こどもがひろった。", "outro"]
        );

        let segments = requests
            .iter()
            .map(|r| VoiceSegment {
                index: r.index,
                audio_duration: Duration::from_secs(1),
                audio_path: String::new(),
            })
            .collect();
        let cues: Vec<Cue> = timeline_inputs(&story, segments)
            .into_iter()
            .map(|i| i.cue)
            .collect();
        assert_eq!(
            cues,
            vec![
                Cue::Intro,
                Cue::Title("星の子".to_string()),
                Cue::Narration("空から星が落ちた。".to_string()),
                Cue::Narration("子供が拾った。".to_string()),
                Cue::Outro,
            ]
        );
    }

    #[tokio::test]
    async fn test_mismatched_story_is_retried_once() {
        let h = Harness::new(&[MISMATCHED, STORY], vec![], None);

        let outcome = h.pipeline.run_cycle(&Shutdown::never()).await.unwrap();

        assert!(matches!(outcome, CycleOutcome::Completed { date, .. } if date == today()));
        assert_eq!(*h.llm_calls.lock().unwrap(), 2);
        assert_eq!(h.last_completed().await, Some(today()));

        let rendered = h.rendered.lock().unwrap();
        let (timeline, output) = &rendered[0];
        assert_eq!(output, &PathBuf::from("output/movie_202406010630.mp4"));
        let roles: Vec<SegmentRole> = timeline.segments().iter().map(|s| s.role).collect();
        assert_eq!(
            roles,
            vec![
                SegmentRole::Intro,
                SegmentRole::Title,
                SegmentRole::Narration,
                SegmentRole::Narration,
                SegmentRole::Outro
            ]
        );
        // 5 seconds of speech plus 2.5 + 1.5 + 1 + 1 + 1.5 padding
        assert_eq!(timeline.total_duration(), Duration::from_millis(12_500));

        let published = h.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert!(published[0].title.contains("【星の子】"));

        let paths = h.storage.paths();
        assert!(paths.contains(&"build/202406010630/story.txt".to_string()));
        assert!(paths.contains(&"build/202406010630/voice/0004.wav".to_string()));
    }

    #[tokio::test]
    async fn test_oversized_title_is_regenerated() {
        let wide = format!("{}\n空。\n;\nほし\nそら。\n", "星".repeat(20));
        let h = Harness::new(&[wide.as_str(), STORY], vec![], None);

        let outcome = h.pipeline.run_cycle(&Shutdown::never()).await.unwrap();

        assert!(matches!(outcome, CycleOutcome::Completed { .. }));
        assert_eq!(*h.llm_calls.lock().unwrap(), 2);
        assert!(h.published.lock().unwrap()[0].title.contains("【星の子】"));
        assert_eq!(h.last_completed().await, Some(today()));
    }

    #[tokio::test]
    async fn test_stale_voice_files_are_cleared() {
        let h = Harness::new(&[STORY], vec![], None);
        h.storage
            .write("build/202406010630/voice/0099.wav", b"old")
            .await
            .unwrap();

        h.pipeline.run_cycle(&Shutdown::never()).await.unwrap();

        let paths = h.storage.paths();
        assert!(!paths.contains(&"build/202406010630/voice/0099.wav".to_string()));
        assert!(paths.contains(&"build/202406010630/voice/0000.wav".to_string()));
        assert!(paths.contains(&"build/202406010630/voice/0004.wav".to_string()));
    }

    #[tokio::test]
    async fn test_exhausted_generation_is_fatal() {
        let h = Harness::new(&["no delimiter"; 5], vec![], None);

        let err = h.pipeline.run(&Shutdown::never()).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::StoryRetriesExhausted {
                attempts: 5,
                last: GenerationError::MissingDelimiter(';')
            }
        ));
        assert_eq!(err.stage(), Stage::GeneratingStory);
        assert_eq!(*h.llm_calls.lock().unwrap(), 5);
        assert!(h.rendered.lock().unwrap().is_empty());
        assert_eq!(h.last_completed().await, None);
    }

    #[tokio::test]
    async fn test_terminal_publish_error_leaves_day_open() {
        let h = Harness::new(
            &[STORY],
            vec![Err(PublishError::from_status(403, "quotaExceeded"))],
            None,
        );

        let outcome = h.pipeline.run_cycle(&Shutdown::never()).await.unwrap();

        assert!(matches!(outcome, CycleOutcome::Aborted(ref e) if !e.is_retryable()));
        assert_eq!(h.published.lock().unwrap().len(), 1);
        assert_eq!(h.last_completed().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_day_is_attempted_again() {
        let (trigger, shutdown) = shutdown_channel();
        let h = Harness::new(
            &[STORY, STORY],
            vec![Err(PublishError::from_status(400, "invalid metadata"))],
            Some(trigger),
        );

        h.pipeline.run(&shutdown).await.unwrap();

        assert_eq!(*h.llm_calls.lock().unwrap(), 2);
        assert_eq!(h.published.lock().unwrap().len(), 2);
        assert_eq!(h.last_completed().await, Some(today()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_publish_errors_are_bounded() {
        let retryable = || PublishError::from_status(503, "backend error");

        let h = Harness::new(&[STORY], vec![Err(retryable()), Ok("abc".to_string())], None);
        let outcome = h.pipeline.run_cycle(&Shutdown::never()).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed { ref video_id, .. } if video_id == "abc"));
        assert_eq!(h.published.lock().unwrap().len(), 2);

        let h = Harness::new(
            &[STORY],
            vec![Err(retryable()), Err(retryable()), Err(retryable())],
            None,
        );
        let outcome = h.pipeline.run_cycle(&Shutdown::never()).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Aborted(ref e) if e.is_retryable()));
        // Default of two retries
        assert_eq!(h.published.lock().unwrap().len(), 3);
        assert_eq!(h.last_completed().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_day_waits_until_shutdown() {
        let (trigger, shutdown) = shutdown_channel();
        let h = Harness::new(&[STORY], vec![], None);
        JsonRunStateStore::new(STATE_PATH, h.storage.clone())
            .save(today())
            .await
            .unwrap();

        let (result, _) = tokio::join!(h.pipeline.run(&shutdown), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.trigger();
        });

        assert!(result.is_ok());
        assert_eq!(*h.llm_calls.lock().unwrap(), 0);
        assert!(h.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_before_cycle_interrupts() {
        let (trigger, shutdown) = shutdown_channel();
        trigger.trigger();
        let h = Harness::new(&[STORY], vec![], None);

        let outcome = h.pipeline.run_cycle(&shutdown).await.unwrap();

        assert!(matches!(outcome, CycleOutcome::Interrupted));
        assert_eq!(*h.llm_calls.lock().unwrap(), 0);
        assert_eq!(h.last_completed().await, None);
    }
}
