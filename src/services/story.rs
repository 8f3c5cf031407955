use crate::core::error::GenerationError;
use crate::services::llm::LlmClient;
use async_trait::async_trait;
use log::debug;

/// Separates the display track from the speak track in a backend response.
pub const TRACK_DELIMITER: char = ';';

pub const DEFAULT_SYSTEM_PROMPT: &str = "あなたは子供向けの物語作家です。";

pub const DEFAULT_PROMPT: &str = "\
6000文字程度の長い物語を作成してください。
最初の行に物語のタイトルだけを書いてください。「タイトル」という必要はありません。

出力は「通常バージョン」と「ひらがなとカタカナのバージョン」の２つを作成してください。
「ひらがなとカタカナのバージョン」は、通常バージョンをひらがなとカタカナのみの表記に変換したものです。
どちらのバージョンにおいても必ず「。」のあとで改行し、それ以外の箇所では改行しないでください。
両バージョンで改行する位置は揃えてください。つまり、両バージョンの行数が同じになるはずです。
この文章は読み上げソフトによって読み上げられるので、いかなるマークダウン記法も使用しないでください。
以下の書式を守り、()の中身は出力しないでください。２つのバージョンの間の行には「;」だけを書いてください。

(通常バージョンの物語)
;
(ひらがなとカタカナのバージョンの物語)
";

/// A validated two-track story: captions to show and the same lines spelled for speech.
///
/// Both tracks have the same, non-zero number of lines. The first display line is the title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryScript {
    display_lines: Vec<String>,
    speak_lines: Vec<String>,
}

impl StoryScript {
    /// Builds a script from raw tracks, dropping blank lines from each track independently.
    pub fn new<D, S>(display: D, speak: S) -> Result<Self, GenerationError>
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        let display_lines = non_blank_lines(display);
        let speak_lines = non_blank_lines(speak);

        if display_lines.len() != speak_lines.len() {
            return Err(GenerationError::LineCountMismatch {
                display: display_lines.len(),
                speak: speak_lines.len(),
            });
        }
        if display_lines.is_empty() {
            return Err(GenerationError::Empty);
        }

        Ok(Self {
            display_lines,
            speak_lines,
        })
    }

    /// Parses a backend response: two newline-separated tracks split on the first delimiter.
    pub fn parse(response: &str) -> Result<Self, GenerationError> {
        let response = strip_code_blocks(response);
        let (display, speak) = response
            .split_once(TRACK_DELIMITER)
            .ok_or(GenerationError::MissingDelimiter(TRACK_DELIMITER))?;
        Self::new(display.split('\n'), speak.split('\n'))
    }

    pub fn title(&self) -> &str {
        &self.display_lines[0]
    }

    pub fn display_lines(&self) -> &[String] {
        &self.display_lines
    }

    pub fn speak_lines(&self) -> &[String] {
        &self.speak_lines
    }

    /// Number of lines in each track, title included. Never zero.
    pub fn line_count(&self) -> usize {
        self.display_lines.len()
    }
}

fn non_blank_lines<I>(lines: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    lines
        .into_iter()
        .map(|l| l.as_ref().trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

pub fn strip_code_blocks(s: &str) -> &str {
    let s = s.trim();
    match s.strip_prefix("```") {
        Some(rest) => {
            // Drop an optional language tag on the opening fence
            let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
            rest.trim_end().trim_end_matches("```").trim()
        }
        None => s,
    }
}

#[async_trait]
pub trait StoryGenerator: Send + Sync {
    /// One attempt at producing a valid script. Retrying is the caller's decision.
    async fn generate(&self) -> Result<StoryScript, GenerationError>;
}

#[derive(Debug)]
pub struct LlmStoryGenerator {
    llm: Box<dyn LlmClient>,
    system_prompt: String,
    prompt: String,
}

impl LlmStoryGenerator {
    pub fn new(llm: Box<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }

    pub fn with_prompts(mut self, system_prompt: Option<String>, prompt: Option<String>) -> Self {
        if let Some(system_prompt) = system_prompt {
            self.system_prompt = system_prompt;
        }
        if let Some(prompt) = prompt {
            self.prompt = prompt;
        }
        self
    }
}

#[async_trait]
impl StoryGenerator for LlmStoryGenerator {
    async fn generate(&self) -> Result<StoryScript, GenerationError> {
        let response = self
            .llm
            .chat(&self.system_prompt, &self.prompt)
            .await
            .map_err(GenerationError::Backend)?;
        debug!("Story backend returned {} bytes", response.len());
        StoryScript::parse(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use std::sync::Mutex;

    #[test]
    fn test_parse_valid_story() {
        let script = StoryScript::parse("森の歌\n小鳥が歌った。\n;\nもりのうた\nことりがうたった。\n")
            .unwrap();
        assert_eq!(script.line_count(), 2);
        assert_eq!(script.title(), "森の歌");
        assert_eq!(script.speak_lines()[1], "ことりがうたった。");
    }

    #[test]
    fn test_blank_lines_are_stripped_per_track() {
        let script =
            StoryScript::parse("\n\nTitle\n\nLine one.\n   \n;\nTITLE\nLINE ONE.\n\n\n").unwrap();
        assert_eq!(script.display_lines(), ["Title", "Line one."]);
        assert_eq!(script.speak_lines(), ["TITLE", "LINE ONE."]);
    }

    #[test]
    fn test_line_count_mismatch_is_rejected() {
        let err = StoryScript::parse("a\nb\nc\nd\ne\n;\na\nb\nc\nd").unwrap_err();
        assert!(matches!(
            err,
            GenerationError::LineCountMismatch {
                display: 5,
                speak: 4
            }
        ));
    }

    #[test]
    fn test_missing_delimiter_is_rejected() {
        let err = StoryScript::parse("only one track\nhere").unwrap_err();
        assert!(matches!(err, GenerationError::MissingDelimiter(';')));
    }

    #[test]
    fn test_empty_tracks_are_rejected() {
        let err = StoryScript::parse("\n \n;\n\n").unwrap_err();
        assert!(matches!(err, GenerationError::Empty));
    }

    #[test]
    fn test_split_happens_on_first_delimiter_only() {
        // A stray delimiter in the speak track stays part of the line
        let script = StoryScript::parse("Title\n;\nTI;TLE").unwrap();
        assert_eq!(script.speak_lines(), ["TI;TLE"]);
    }

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("text"), "text");
        assert_eq!(strip_code_blocks("```\na\n;\nb\n```"), "a\n;\nb");
        assert_eq!(strip_code_blocks("  ```text  \n a \n ```  "), "a");
    }

    #[derive(Debug)]
    struct ScriptedLlm {
        responses: Mutex<Vec<Result<String>>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _system: &str, user: &str) -> Result<String> {
            assert!(user.contains(";"));
            self.responses.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn test_generator_maps_backend_failure() {
        let llm = ScriptedLlm {
            responses: Mutex::new(vec![Err(anyhow!("connection refused"))]),
        };
        let generator = LlmStoryGenerator::new(Box::new(llm));
        let err = generator.generate().await.unwrap_err();
        assert!(matches!(err, GenerationError::Backend(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_generator_parses_response() {
        let llm = ScriptedLlm {
            responses: Mutex::new(vec![Ok("Title\nBody.\n;\nTITLE\nBODY.".to_string())]),
        };
        let generator = LlmStoryGenerator::new(Box::new(llm)).with_prompts(None, None);
        let script = generator.generate().await.unwrap();
        assert_eq!(script.title(), "Title");
        assert_eq!(script.display_lines(), ["Title", "Body."]);
        assert_eq!(script.speak_lines(), ["TITLE", "BODY."]);
    }
}
