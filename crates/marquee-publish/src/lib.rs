//! Publish boundary: hands finished export files to an external content store.
//!
//! The sync pipeline only ever sees a [`PublishSink`]. Credentials are read by
//! the concrete sink from the environment and never pass through the core.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "marquee-publish";

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_COMMIT_MESSAGE: &str = "Update CSV file";
pub const DEFAULT_UPLOAD_DELAY: Duration = Duration::from_secs(5);

/// A finished file ready to be published under `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportArtifact {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish sink is not configured: {0}")]
    Config(String),
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[async_trait]
pub trait PublishSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Publish every artifact in order, returning how many were accepted.
    async fn publish(&self, artifacts: &[ExportArtifact]) -> Result<usize, PublishError>;
}

/// Sink that accepts nothing; the default when publishing is off.
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl PublishSink for NoopSink {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn publish(&self, _artifacts: &[ExportArtifact]) -> Result<usize, PublishError> {
        Ok(0)
    }
}

#[derive(Clone)]
pub struct ContentApiConfig {
    pub api_base: String,
    pub owner: String,
    pub repo: String,
    pub token: String,
    pub message: String,
    pub delay: Duration,
    pub user_agent: String,
}

impl fmt::Debug for ContentApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentApiConfig")
            .field("api_base", &self.api_base)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("token", &"<redacted>")
            .field("message", &self.message)
            .field("delay", &self.delay)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl ContentApiConfig {
    pub fn from_env() -> Result<Self, PublishError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PublishError> {
        let token = lookup("MARQUEE_PUBLISH_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| PublishError::Config("MARQUEE_PUBLISH_TOKEN is not set".into()))?;
        let repo_slug = lookup("MARQUEE_PUBLISH_REPO")
            .ok_or_else(|| PublishError::Config("MARQUEE_PUBLISH_REPO is not set".into()))?;
        let (owner, repo) = repo_slug
            .trim()
            .split_once('/')
            .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty() && !repo.contains('/'))
            .ok_or_else(|| {
                PublishError::Config(format!(
                    "MARQUEE_PUBLISH_REPO must look like owner/name, got {repo_slug:?}"
                ))
            })?;
        let delay = lookup("MARQUEE_PUBLISH_DELAY_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_UPLOAD_DELAY);

        Ok(Self {
            api_base: lookup("MARQUEE_PUBLISH_API").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token,
            message: lookup("MARQUEE_PUBLISH_MESSAGE")
                .unwrap_or_else(|| DEFAULT_COMMIT_MESSAGE.to_string()),
            delay,
            user_agent: lookup("MARQUEE_USER_AGENT").unwrap_or_else(|| "marquee/0.1".to_string()),
        })
    }
}

/// Request body for a create-or-update of one file.
pub fn build_update_body(message: &str, content: &[u8], sha: Option<&str>) -> JsonValue {
    let encoded = base64::engine::general_purpose::STANDARD.encode(content);
    let mut body = serde_json::json!({
        "message": message,
        "content": encoded,
    });
    if let Some(sha) = sha {
        body["sha"] = JsonValue::String(sha.to_string());
    }
    body
}

/// Uploads each artifact to a repository contents API, one at a time with a
/// fixed pause in between.
#[derive(Debug)]
pub struct ContentApiSink {
    client: reqwest::Client,
    config: ContentApiConfig,
}

impl ContentApiSink {
    pub fn new(config: ContentApiConfig) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn contents_url(&self, name: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.owner,
            self.config.repo,
            name
        )
    }

    async fn current_revision(&self, url: &str) -> Result<Option<String>, PublishError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.config.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(PublishError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body: JsonValue = resp.json().await?;
        Ok(body.get("sha").and_then(|v| v.as_str()).map(str::to_string))
    }

    async fn upload(&self, artifact: &ExportArtifact) -> Result<(), PublishError> {
        let content = tokio::fs::read(&artifact.path)
            .await
            .map_err(|source| PublishError::Io {
                path: artifact.path.clone(),
                source,
            })?;
        let url = self.contents_url(&artifact.name);
        let sha = self.current_revision(&url).await?;
        let body = build_update_body(&self.config.message, &content, sha.as_deref());

        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.config.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PublishError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        info!(bytes = content.len(), updated = sha.is_some(), "artifact published");
        Ok(())
    }
}

#[async_trait]
impl PublishSink for ContentApiSink {
    fn name(&self) -> &'static str {
        "content-api"
    }

    async fn publish(&self, artifacts: &[ExportArtifact]) -> Result<usize, PublishError> {
        for (i, artifact) in artifacts.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.delay).await;
            }
            let span = info_span!("publish", artifact = %artifact.name);
            self.upload(artifact).instrument(span).await?;
        }
        Ok(artifacts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_requires_a_token() {
        let err =
            ContentApiConfig::from_lookup(lookup_from(&[("MARQUEE_PUBLISH_REPO", "me/movies")]))
                .expect_err("token is required");
        assert!(matches!(err, PublishError::Config(_)));
    }

    #[test]
    fn config_reads_repo_slug_and_defaults() {
        let config = ContentApiConfig::from_lookup(lookup_from(&[
            ("MARQUEE_PUBLISH_TOKEN", "secret-value"),
            ("MARQUEE_PUBLISH_REPO", "me/movie-finder"),
        ]))
        .expect("config");
        assert_eq!(config.owner, "me");
        assert_eq!(config.repo, "movie-finder");
        assert_eq!(config.message, DEFAULT_COMMIT_MESSAGE);
        assert_eq!(config.delay, DEFAULT_UPLOAD_DELAY);
        assert!(!format!("{config:?}").contains("secret-value"));
    }

    #[test]
    fn malformed_repo_slug_is_rejected() {
        let err = ContentApiConfig::from_lookup(lookup_from(&[
            ("MARQUEE_PUBLISH_TOKEN", "t"),
            ("MARQUEE_PUBLISH_REPO", "just-a-name"),
        ]))
        .expect_err("slug needs an owner");
        assert!(err.to_string().contains("owner/name"));
    }

    #[test]
    fn update_body_encodes_content_and_carries_revision() {
        let body = build_update_body("Update CSV file", b"Title;Year\n", Some("abc123"));
        assert_eq!(body["message"], "Update CSV file");
        assert_eq!(body["content"], "VGl0bGU7WWVhcgo=");
        assert_eq!(body["sha"], "abc123");

        let create = build_update_body("Update CSV file", b"", None);
        assert!(create.get("sha").is_none());
    }

    #[test]
    fn contents_url_joins_repo_and_file_name() {
        let config = ContentApiConfig::from_lookup(lookup_from(&[
            ("MARQUEE_PUBLISH_TOKEN", "t"),
            ("MARQUEE_PUBLISH_REPO", "me/movies"),
            ("MARQUEE_PUBLISH_API", "https://git.example.test/api/"),
        ]))
        .expect("config");
        let sink = ContentApiSink::new(config).expect("sink");
        assert_eq!(
            sink.contents_url("movies_part1.csv"),
            "https://git.example.test/api/repos/me/movies/contents/movies_part1.csv"
        );
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    break;
                }
            }
            let n = stream.read(&mut chunk).await.expect("read request");
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Answer one request per canned reply, in order, and hand back every
    /// request as received.
    async fn serve(replies: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status, body) in replies {
                let (mut stream, _) = listener.accept().await.expect("accept");
                requests.push(read_request(&mut stream).await);
                let reply = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(reply.as_bytes()).await.expect("write reply");
                stream.shutdown().await.expect("shutdown");
            }
            requests
        });
        (base, handle)
    }

    fn sink_for(api: &str) -> ContentApiSink {
        let config = ContentApiConfig::from_lookup(lookup_from(&[
            ("MARQUEE_PUBLISH_TOKEN", "test-token"),
            ("MARQUEE_PUBLISH_REPO", "me/movies"),
            ("MARQUEE_PUBLISH_API", api),
            ("MARQUEE_PUBLISH_DELAY_SECS", "0"),
        ]))
        .expect("config");
        ContentApiSink::new(config).expect("sink")
    }

    fn artifact(dir: &Path, name: &str, content: &str) -> ExportArtifact {
        let path = dir.join(name);
        std::fs::write(&path, content).expect("write artifact");
        ExportArtifact {
            name: name.to_string(),
            path,
        }
    }

    fn body_of(request: &str) -> JsonValue {
        let (_, body) = request.split_once("\r\n\r\n").expect("request body");
        serde_json::from_str(body).expect("json body")
    }

    #[tokio::test]
    async fn existing_file_is_updated_and_new_file_is_created() {
        let (base, server) = serve(vec![
            (200, r#"{"sha":"abc123"}"#),
            (200, "{}"),
            (404, r#"{"message":"Not Found"}"#),
            (201, "{}"),
        ])
        .await;
        let dir = tempdir().expect("tempdir");
        let artifacts = vec![
            artifact(dir.path(), "movies_part1.csv", "Title;Year\n"),
            artifact(dir.path(), "movies_part2.csv", "Title;Year\nB;2001\n"),
        ];

        let published = sink_for(&base).publish(&artifacts).await.expect("publish");
        assert_eq!(published, 2);

        let requests = server.await.expect("server");
        assert_eq!(requests.len(), 4);
        assert!(requests[0].starts_with("GET /repos/me/movies/contents/movies_part1.csv "));
        assert!(requests[1].starts_with("PUT /repos/me/movies/contents/movies_part1.csv "));
        assert!(requests[2].starts_with("GET /repos/me/movies/contents/movies_part2.csv "));
        assert!(requests[3].starts_with("PUT /repos/me/movies/contents/movies_part2.csv "));
        for request in &requests {
            assert!(request.to_ascii_lowercase().contains("authorization: bearer test-token"));
        }

        let update = body_of(&requests[1]);
        assert_eq!(update["sha"], "abc123");
        assert_eq!(update["message"], DEFAULT_COMMIT_MESSAGE);
        assert_eq!(update["content"], "VGl0bGU7WWVhcgo=");

        let create = body_of(&requests[3]);
        assert!(create.get("sha").is_none());
    }

    #[tokio::test]
    async fn rejected_upload_is_an_http_status_error() {
        let (base, server) = serve(vec![(404, "{}"), (422, r#"{"message":"invalid"}"#)]).await;
        let dir = tempdir().expect("tempdir");
        let artifacts = vec![artifact(dir.path(), "movies_part1.csv", "Title\n")];

        let err = sink_for(&base)
            .publish(&artifacts)
            .await
            .expect_err("422 must fail");
        match err {
            PublishError::HttpStatus { status, url } => {
                assert_eq!(status, 422);
                assert!(url.ends_with("/contents/movies_part1.csv"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.await.expect("server").len(), 2);
    }

    #[tokio::test]
    async fn noop_sink_accepts_nothing() {
        let artifacts = vec![ExportArtifact {
            name: "movies_part1.csv".into(),
            path: PathBuf::from("movies_part1.csv"),
        }];
        assert_eq!(NoopSink.publish(&artifacts).await.expect("noop"), 0);
    }
}
