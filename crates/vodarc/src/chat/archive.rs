use std::collections::HashSet;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::api::ImageFetch;
use crate::chat::catalog::{AssetCatalog, CheerEmote, ThirdPartyEmote, TwitchBadge, TwitchEmote};
use crate::error::Result;
use crate::models::{ArchiveVideoMetadata, ChatPage};

/// In-memory sets preventing re-embedding of an already-archived binary
/// asset, across any number of resumed runs.
#[derive(Debug, Clone, Default)]
pub struct DedupeSets {
    pub twitch_emote_ids: HashSet<String>,
    pub badges: HashSet<(String, String)>,
    pub emote_names: HashSet<String>,
}

enum Scope {
    Object { count: usize },
    Array { count: usize },
}

/// JSON token writer that counts every byte it emits. `position()` is the
/// exact length of the document written so far, which is what the task record
/// persists for truncate-and-continue.
pub struct JsonStreamWriter {
    file: File,
    position: u64,
    stack: Vec<Scope>,
    after_name: bool,
}

impl JsonStreamWriter {
    pub fn new(file: File) -> Self {
        Self {
            file,
            position: 0,
            stack: Vec::new(),
            after_name: false,
        }
    }

    /// Continue a document whose top-level object is open and already holds
    /// at least one member.
    pub fn resume_object(file: File, position: u64) -> Self {
        Self {
            file,
            position,
            stack: vec![Scope::Object { count: 1 }],
            after_name: false,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes).await?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    async fn pre_value(&mut self) -> Result<()> {
        if self.after_name {
            self.after_name = false;
            return Ok(());
        }
        let needs_comma = match self.stack.last_mut() {
            Some(Scope::Array { count }) => {
                let needed = *count > 0;
                *count += 1;
                needed
            }
            _ => false,
        };
        if needs_comma {
            self.write_bytes(b",").await?;
        }
        Ok(())
    }

    pub async fn begin_object(&mut self) -> Result<()> {
        self.pre_value().await?;
        self.write_bytes(b"{").await?;
        self.stack.push(Scope::Object { count: 0 });
        Ok(())
    }

    pub async fn end_object(&mut self) -> Result<()> {
        self.stack.pop();
        self.write_bytes(b"}").await
    }

    pub async fn begin_array(&mut self) -> Result<()> {
        self.pre_value().await?;
        self.write_bytes(b"[").await?;
        self.stack.push(Scope::Array { count: 0 });
        Ok(())
    }

    pub async fn end_array(&mut self) -> Result<()> {
        self.stack.pop();
        self.write_bytes(b"]").await
    }

    pub async fn name(&mut self, key: &str) -> Result<()> {
        let needs_comma = match self.stack.last_mut() {
            Some(Scope::Object { count }) => {
                let needed = *count > 0;
                *count += 1;
                needed
            }
            _ => false,
        };
        if needs_comma {
            self.write_bytes(b",").await?;
        }
        let escaped = serde_json::to_string(key)?;
        self.write_bytes(escaped.as_bytes()).await?;
        self.write_bytes(b":").await?;
        self.after_name = true;
        Ok(())
    }

    pub async fn string_value(&mut self, value: &str) -> Result<()> {
        self.pre_value().await?;
        let escaped = serde_json::to_string(value)?;
        self.write_bytes(escaped.as_bytes()).await
    }

    pub async fn number_value(&mut self, value: i64) -> Result<()> {
        self.pre_value().await?;
        self.write_bytes(value.to_string().as_bytes()).await
    }

    pub async fn bool_value(&mut self, value: bool) -> Result<()> {
        self.pre_value().await?;
        self.write_bytes(if value { b"true" as &[u8] } else { b"false" }).await
    }

    /// Copy a server value through verbatim, minus `__typename` keys and
    /// nulls.
    pub async fn raw_value(&mut self, value: &Value) -> Result<()> {
        self.pre_value().await?;
        let cleaned = strip_meta(value).unwrap_or(Value::Object(Default::default()));
        let rendered = serde_json::to_string(&cleaned)?;
        self.write_bytes(rendered.as_bytes()).await
    }

    /// Write one byte that is not counted into `position()`: the at-rest
    /// document close that the next resume truncates away.
    async fn write_uncounted(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes).await?;
        Ok(())
    }

    async fn truncate_to_position(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.set_len(self.position).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

fn strip_meta(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let mut cleaned = serde_json::Map::new();
            for (key, val) in map {
                if key == "__typename" {
                    continue;
                }
                if let Some(kept) = strip_meta(val) {
                    cleaned.insert(key.clone(), kept);
                }
            }
            Some(Value::Object(cleaned))
        }
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(strip_meta).collect(),
        )),
        other => Some(other.clone()),
    }
}

async fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().append(true).open(path).await?)
}

/// Incremental writer for the single-document chat archive. Pages are
/// appended as repeated `comments` / asset arrays; after every page the file
/// is sealed with a document close that is excluded from the resumable
/// position, so the file at rest always parses while a crash loses at most
/// the in-flight page.
pub struct ChatArchiveWriter {
    writer: JsonStreamWriter,
    path: PathBuf,
    sealed: bool,
}

impl ChatArchiveWriter {
    /// Start a fresh archive: header object with video metadata plus the
    /// start-of-window timestamp.
    pub async fn create(
        path: impl Into<PathBuf>,
        video: &ArchiveVideoMetadata,
        start_time_seconds: i64,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .await?;
            file.sync_all().await?;
        }
        let mut writer = JsonStreamWriter::new(open_append(&path).await?);
        writer.begin_object().await?;
        writer.name("video").await?;
        writer.begin_object().await?;
        writer.name("id").await?;
        writer.string_value(&video.id).await?;
        let optional = [
            ("title", &video.title),
            ("uploadDate", &video.upload_date),
            ("channelId", &video.channel_id),
            ("channelLogin", &video.channel_login),
            ("channelName", &video.channel_name),
            ("gameId", &video.game_id),
            ("gameSlug", &video.game_slug),
            ("gameName", &video.game_name),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                writer.name(key).await?;
                writer.string_value(value).await?;
            }
        }
        writer.end_object().await?;
        writer.name("startTime").await?;
        writer.number_value(start_time_seconds).await?;
        Ok(Self {
            writer,
            path,
            sealed: false,
        })
    }

    /// Continue an interrupted archive. The file is truncated to the last
    /// durable position first, dropping the at-rest close and any partial
    /// tail from a killed run.
    pub async fn resume(path: impl Into<PathBuf>, position: u64) -> Result<Self> {
        let path = path.into();
        {
            let file = OpenOptions::new().write(true).open(&path).await?;
            file.set_len(position).await?;
            file.sync_all().await?;
        }
        let writer = JsonStreamWriter::resume_object(open_append(&path).await?, position);
        Ok(Self {
            writer,
            path,
            sealed: true,
        })
    }

    pub fn position(&self) -> u64 {
        self.writer.position()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one fetched page: its comment objects, then any assets not yet
    /// embedded. Dedupe sets are updated in place.
    pub async fn append_page<I: ImageFetch>(
        &mut self,
        page: &ChatPage,
        dedupe: &mut DedupeSets,
        catalog: &AssetCatalog,
        images: &I,
        quality: u8,
    ) -> Result<()> {
        if self.sealed {
            self.writer.truncate_to_position().await?;
            self.sealed = false;
        }
        if !page.comments.is_empty() {
            self.writer.name("comments").await?;
            self.writer.begin_array().await?;
            for comment in &page.comments {
                self.writer.raw_value(comment).await?;
            }
            self.writer.end_array().await?;
        }

        let mut twitch_emotes: Vec<TwitchEmote> = Vec::new();
        for id in &page.emote_ids_used {
            if dedupe.twitch_emote_ids.insert(id.clone()) {
                twitch_emotes.push(catalog.twitch_emote(id));
            }
        }
        let mut badges: Vec<&TwitchBadge> = Vec::new();
        for badge_ref in &page.badges_used {
            let pair = (badge_ref.set_id.clone(), badge_ref.version.clone());
            if dedupe.badges.insert(pair) {
                if let Some(badge) = catalog.find_badge(&badge_ref.set_id, &badge_ref.version) {
                    badges.push(badge);
                }
            }
        }
        let mut cheer_emotes: Vec<&CheerEmote> = Vec::new();
        let mut emotes: Vec<&ThirdPartyEmote> = Vec::new();
        for word in &page.words_used {
            if dedupe.emote_names.contains(word) {
                continue;
            }
            if let Some(cheer) = catalog.match_cheer(word) {
                dedupe.emote_names.insert(word.clone());
                cheer_emotes.push(cheer);
            } else if let Some(emote) = catalog.find_emote(word) {
                dedupe.emote_names.insert(word.clone());
                emotes.push(emote);
            }
        }

        if !twitch_emotes.is_empty() {
            self.writer.name("twitchEmotes").await?;
            self.writer.begin_array().await?;
            for emote in &twitch_emotes {
                if let Some(data) = fetch_asset(images, emote.urls.url_for(quality)).await? {
                    self.writer.begin_object().await?;
                    self.writer.name("data").await?;
                    self.writer.string_value(&data).await?;
                    self.writer.name("id").await?;
                    self.writer.string_value(&emote.id).await?;
                    self.writer.end_object().await?;
                }
            }
            self.writer.end_array().await?;
        }
        if !badges.is_empty() {
            self.writer.name("twitchBadges").await?;
            self.writer.begin_array().await?;
            for badge in &badges {
                if let Some(data) = fetch_asset(images, badge.urls.url_for(quality)).await? {
                    self.writer.begin_object().await?;
                    self.writer.name("data").await?;
                    self.writer.string_value(&data).await?;
                    self.writer.name("setId").await?;
                    self.writer.string_value(&badge.set_id).await?;
                    self.writer.name("version").await?;
                    self.writer.string_value(&badge.version).await?;
                    self.writer.end_object().await?;
                }
            }
            self.writer.end_array().await?;
        }
        if !cheer_emotes.is_empty() {
            self.writer.name("cheerEmotes").await?;
            self.writer.begin_array().await?;
            for cheer in &cheer_emotes {
                if let Some(data) = fetch_asset(images, cheer.urls.url_for(quality)).await? {
                    self.writer.begin_object().await?;
                    self.writer.name("data").await?;
                    self.writer.string_value(&data).await?;
                    self.writer.name("name").await?;
                    self.writer.string_value(&cheer.name).await?;
                    self.writer.name("minBits").await?;
                    self.writer.number_value(cheer.min_bits as i64).await?;
                    if let Some(color) = &cheer.color {
                        self.writer.name("color").await?;
                        self.writer.string_value(color).await?;
                    }
                    self.writer.end_object().await?;
                }
            }
            self.writer.end_array().await?;
        }
        if !emotes.is_empty() {
            self.writer.name("emotes").await?;
            self.writer.begin_array().await?;
            for emote in &emotes {
                if let Some(data) = fetch_asset(images, emote.urls.url_for(quality)).await? {
                    self.writer.begin_object().await?;
                    self.writer.name("data").await?;
                    self.writer.string_value(&data).await?;
                    self.writer.name("name").await?;
                    self.writer.string_value(&emote.name).await?;
                    self.writer.name("isZeroWidth").await?;
                    self.writer.bool_value(emote.is_zero_width).await?;
                    self.writer.end_object().await?;
                }
            }
            self.writer.end_array().await?;
        }
        Ok(())
    }

    /// Close the document at rest. The close byte stays outside `position()`
    /// so the next resume can truncate it away and keep appending.
    pub async fn seal(&mut self) -> Result<()> {
        if !self.sealed {
            self.writer.write_uncounted(b"}").await?;
            self.sealed = true;
        }
        self.writer.flush().await
    }
}

async fn fetch_asset<I: ImageFetch>(images: &I, url: Option<&str>) -> Result<Option<String>> {
    let Some(url) = url else {
        log::warn!("asset has no image url at any quality, skipping");
        return Ok(None);
    };
    let bytes = images.fetch_image(url).await?;
    Ok(Some(STANDARD_NO_PAD.encode(bytes)))
}
