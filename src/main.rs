use anyhow::{Context, Result};
use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;
use story2video::core::config::Config;
use story2video::core::io::{NativeStorage, Storage};
use story2video::core::shutdown::shutdown_channel;
use story2video::core::state::{JsonRunStateStore, Stage};
use story2video::services::llm::create_llm;
use story2video::services::publish::YoutubeUploader;
use story2video::services::render::FfmpegRenderer;
use story2video::services::story::LlmStoryGenerator;
use story2video::services::tts::{create_tts_client, VoiceSynthesizer};
use story2video::services::workflow::Pipeline;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // 1. Load config
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yml".to_string());
    let config = match Config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure '{}' exists with LLM and publish settings.", path);
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());

    // 2. Story backend
    let llm = create_llm(&config.llm)?;
    let story = LlmStoryGenerator::new(llm)
        .with_prompts(config.llm.system_prompt.clone(), config.llm.prompt.clone());

    // 3. Speech backend, checked before the first cycle
    let tts = create_tts_client(&config.audio)?;
    let synthesizer = VoiceSynthesizer::new(
        tts,
        storage.clone(),
        config.audio.voice_profile(),
        config.audio.concurrency,
    );
    synthesizer
        .verify()
        .await
        .with_context(|| format!("[{}] Speech backend check failed", Stage::SynthesizingVoice))?;

    // 4. Stop cleanly on Ctrl-C
    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping at the next step boundary");
            trigger.trigger();
        }
    });

    // 5. Run
    let state = JsonRunStateStore::new(config.schedule.state_path.clone(), storage.clone());
    let renderer = FfmpegRenderer::new(&config.video);
    let publisher = YoutubeUploader::new(config.publish.clone());
    let pipeline = Pipeline::new(
        config,
        Box::new(story),
        synthesizer,
        Box::new(renderer),
        Box::new(publisher),
        Box::new(state),
        storage,
    );

    if let Err(e) = pipeline.run(&shutdown).await {
        let stage = e.stage();
        return Err(anyhow::Error::new(e).context(format!("Fatal error while {}", stage)));
    }
    info!("Stopped");
    Ok(())
}
