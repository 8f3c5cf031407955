pub mod llm;
pub mod publish;
pub mod render;
pub mod story;
pub mod timeline;
pub mod tts;
pub mod workflow;
