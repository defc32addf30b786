use std::collections::HashMap;
use std::future::Future;

use crate::error::{Error, Result};
use crate::models::{MediaPlaylist, MediaSegment, RawChatPage};

/// First page or resume-by-time goes by offset, later pages by the opaque
/// cursor the previous page returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    Offset(i64),
    Cursor(String),
}

/// Manifest-fetch collaborator: ordered segment list for a video source.
pub trait ManifestSource: Send + Sync + 'static {
    fn fetch_playlist(&self, url: &str) -> impl Future<Output = Result<MediaPlaylist>> + Send;
}

/// Paginated chat-history collaborator.
pub trait ChatSource: Clone + Send + Sync + 'static {
    fn next_page(
        &self,
        video_id: &str,
        request: &PageRequest,
    ) -> impl Future<Output = Result<RawChatPage>> + Send;
}

/// Raw image bytes for emote/badge embedding.
pub trait ImageFetch: Send + Sync + 'static {
    fn fetch_image(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

#[derive(Clone)]
pub struct HttpManifestSource {
    client: reqwest::Client,
}

impl HttpManifestSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ManifestSource for HttpManifestSource {
    async fn fetch_playlist(&self, url: &str) -> Result<MediaPlaylist> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::HttpStatus(resp.status().as_u16(), url.to_owned()));
        }
        let bytes = resp.bytes().await?;
        parse_media_playlist(&bytes)
    }
}

/// Parse an m3u8 media playlist into the planner's model, computing the
/// cumulative relative start time of each segment.
pub fn parse_media_playlist(bytes: &[u8]) -> Result<MediaPlaylist> {
    let playlist = m3u8_rs::parse_media_playlist_res(bytes)
        .map_err(|e| Error::Playlist(e.to_string()))?;
    let target_duration_ms = (playlist.target_duration as u64) * 1000;
    let mut relative_ms = 0u64;
    let mut segments = Vec::with_capacity(playlist.segments.len());
    for track in &playlist.segments {
        let duration_ms = (track.duration * 1000.0) as u64;
        segments.push(MediaSegment::new(relative_ms, duration_ms, track.uri.clone()));
        relative_ms += duration_ms;
    }
    Ok(MediaPlaylist::new(target_duration_ms, segments))
}

/// Chat-history client against a paginated JSON endpoint. The wire shape is
/// the collaborator's concern; this client only maps the response envelope
/// into `RawChatPage` and surfaces the integrity-check failure distinctly.
#[derive(Clone)]
pub struct HttpChatSource {
    client: reqwest::Client,
    endpoint: String,
    headers: HashMap<String, String>,
}

impl HttpChatSource {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

impl ChatSource for HttpChatSource {
    async fn next_page(&self, video_id: &str, request: &PageRequest) -> Result<RawChatPage> {
        let body = match request {
            PageRequest::Offset(offset) => serde_json::json!({
                "videoId": video_id,
                "contentOffsetSeconds": offset,
            }),
            PageRequest::Cursor(cursor) => serde_json::json!({
                "videoId": video_id,
                "cursor": cursor,
            }),
        };
        let mut req = self.client.post(&self.endpoint).json(&body);
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(Error::HttpStatus(
                resp.status().as_u16(),
                self.endpoint.clone(),
            ));
        }
        let value: serde_json::Value = resp.json().await?;
        if value
            .pointer("/error")
            .and_then(|e| e.as_str())
            .is_some_and(|e| e.contains("failed integrity check"))
        {
            return Err(Error::IntegrityCheck);
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Clone)]
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ImageFetch for HttpImageFetcher {
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::HttpStatus(resp.status().as_u16(), url.to_owned()));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}
