//! Uploads finished videos to YouTube.
//!
//! Authorization uses a stored OAuth refresh token, so no interactive consent is needed
//! once the channel has been authorized.

use crate::core::error::PublishError;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct YoutubeConfig {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,

    /// `{title}` is replaced by the story title.
    #[serde(default = "default_title_template")]
    pub title_template: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_tags")]
    pub tags: Vec<String>,
    #[serde(default = "default_category_id")]
    pub category_id: String,
    #[serde(default = "default_privacy")]
    pub privacy: String,

    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_upload_url")]
    pub upload_url: String,
}

fn default_title_template() -> String {
    "【睡眠導入】ずんだもんがささやき声で物語を読み聞かせるのだ【{title}】".to_string()
}
fn default_description() -> String {
    "こんばんは。ずんだもんなのだ。このチャンネルでは僕が毎日いろんな物語をささやき声で読み聞かせる動画を投稿しているのだ。気に入ったらぜひ高評価とチャンネル登録をしていただけるとうれしいのだ。".to_string()
}
fn default_tags() -> Vec<String> {
    [
        "語りのずんだ",
        "ずんだもん",
        "物語",
        "読み聞かせ",
        "ささやき声",
        "ささやき声で物語を読み聞かせるのだ【{title}】",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_category_id() -> String {
    "22".to_string()
}
fn default_privacy() -> String {
    "public".to_string()
}
fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}
fn default_upload_url() -> String {
    "https://www.googleapis.com/upload/youtube/v3/videos".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

impl PublishMetadata {
    /// Fills the configured templates with the story title.
    pub fn for_story(config: &YoutubeConfig, story_title: &str) -> Self {
        let fill = |s: &str| s.replace("{title}", story_title);
        Self {
            title: fill(&config.title_template),
            description: fill(&config.description),
            tags: config.tags.iter().map(|t| fill(t)).collect(),
        }
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Uploads `media` and returns the remote identifier.
    async fn publish(&self, media: &Path, metadata: &PublishMetadata)
        -> Result<String, PublishError>;
}

pub struct YoutubeUploader {
    config: YoutubeConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct VideoResource {
    id: String,
}

impl YoutubeUploader {
    pub fn new(config: YoutubeConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn access_token(&self) -> Result<String, PublishError> {
        let resp = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("refresh_token", self.config.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(network_error)?;
        let resp = check_status(resp).await?;
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| terminal(format!("Malformed token response: {}", e)))?;
        Ok(token.access_token)
    }

    fn video_resource(&self, metadata: &PublishMetadata) -> serde_json::Value {
        json!({
            "snippet": {
                "title": metadata.title,
                "description": metadata.description,
                "tags": metadata.tags,
                "categoryId": self.config.category_id,
            },
            "status": {
                "privacyStatus": self.config.privacy,
                "selfDeclaredMadeForKids": false,
            }
        })
    }

    /// Opens a resumable upload session and returns its URL.
    async fn start_session(
        &self,
        token: &str,
        metadata: &PublishMetadata,
        length: usize,
    ) -> Result<String, PublishError> {
        let resp = self
            .client
            .post(&self.config.upload_url)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(token)
            .header("X-Upload-Content-Type", "video/mp4")
            .header("X-Upload-Content-Length", length.to_string())
            .json(&self.video_resource(metadata))
            .send()
            .await
            .map_err(network_error)?;
        let resp = check_status(resp).await?;

        resp.headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| terminal("Upload session response has no Location header".to_string()))
    }
}

#[async_trait]
impl Publisher for YoutubeUploader {
    async fn publish(
        &self,
        media: &Path,
        metadata: &PublishMetadata,
    ) -> Result<String, PublishError> {
        let bytes = tokio::fs::read(media)
            .await
            .map_err(|e| terminal(format!("Cannot read {}: {}", media.display(), e)))?;

        let token = self.access_token().await?;
        let session = self.start_session(&token, metadata, bytes.len()).await?;
        debug!("Upload session opened for {} bytes", bytes.len());

        let resp = self
            .client
            .put(&session)
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_TYPE, "video/mp4")
            .body(bytes)
            .send()
            .await
            .map_err(network_error)?;
        let resp = check_status(resp).await?;
        let video: VideoResource = resp
            .json()
            .await
            .map_err(|e| terminal(format!("Malformed upload response: {}", e)))?;

        info!("Uploaded \"{}\" as video {}", metadata.title, video.id);
        Ok(video.id)
    }
}

fn network_error(e: reqwest::Error) -> PublishError {
    PublishError::Retryable {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

fn terminal(message: String) -> PublishError {
    PublishError::Terminal {
        status: None,
        message,
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, PublishError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(PublishError::from_status(status.as_u16(), body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> YoutubeConfig {
        serde_yaml_ng::from_str(
            "client_id: id\nclient_secret: secret\nrefresh_token: refresh\n",
        )
        .unwrap()
    }

    #[test]
    fn test_metadata_substitutes_title() {
        let metadata = PublishMetadata::for_story(&config(), "星の子");

        assert_eq!(
            metadata.title,
            "【睡眠導入】ずんだもんがささやき声で物語を読み聞かせるのだ【星の子】"
        );
        assert!(!metadata.description.contains("{title}"));
        assert_eq!(metadata.tags.len(), 6);
        assert_eq!(metadata.tags[5], "ささやき声で物語を読み聞かせるのだ【星の子】");
        assert_eq!(metadata.tags[0], "語りのずんだ");
    }

    #[test]
    fn test_video_resource_layout() {
        let uploader = YoutubeUploader::new(config());
        let metadata = PublishMetadata {
            title: "t".to_string(),
            description: "d".to_string(),
            tags: vec!["a".to_string()],
        };
        let resource = uploader.video_resource(&metadata);

        assert_eq!(resource["snippet"]["title"], "t");
        assert_eq!(resource["snippet"]["tags"][0], "a");
        assert_eq!(resource["snippet"]["categoryId"], "22");
        assert_eq!(resource["status"]["privacyStatus"], "public");
        assert_eq!(resource["status"]["selfDeclaredMadeForKids"], false);
    }

    #[tokio::test]
    async fn test_missing_media_is_terminal() {
        let uploader = YoutubeUploader::new(config());
        let metadata = PublishMetadata::for_story(&config(), "x");
        let err = uploader
            .publish(Path::new("definitely/not/here.mp4"), &metadata)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("movie.mp4");
        std::fs::write(&media, b"not really a video").unwrap();

        let mut config = config();
        // Nothing listens on the discard port
        config.token_url = "http://127.0.0.1:9/token".to_string();
        let uploader = YoutubeUploader::new(config.clone());

        let err = uploader
            .publish(&media, &PublishMetadata::for_story(&config, "x"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
