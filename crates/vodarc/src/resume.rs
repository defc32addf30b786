use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::de::{DeserializeSeed, IgnoredAny, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;

use crate::chat::archive::DedupeSets;
use crate::chat::fetcher::parse_message;
use crate::error::Result;
use crate::models::{ChatArchiveEntry, DownloadTask};
use crate::store::FileStore;

/// State recovered from a partial chat archive: the asset dedupe sets and the
/// entries already saved at the boundary offset, so the first resumed page can
/// drop what the previous run archived.
#[derive(Debug, Default)]
pub struct ChatResumeState {
    pub dedupe: DedupeSets,
    pub boundary_entries: Vec<ChatArchiveEntry>,
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Deserialize)]
struct NameOnly {
    name: String,
}

#[derive(Deserialize)]
struct BadgePair {
    #[serde(rename = "setId")]
    set_id: String,
    version: String,
}

/// Seeded visitor over the archive's top-level object. The document repeats
/// `comments` and asset keys once per appended page, so a derived struct
/// would silently keep only the last occurrence; walking the map by hand
/// sees every one.
struct ArchiveScanSeed {
    boundary_offset: i64,
}

impl<'de> DeserializeSeed<'de> for ArchiveScanSeed {
    type Value = ChatResumeState;

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ArchiveScanSeed {
    type Value = ChatResumeState;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a chat archive object")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut state = ChatResumeState::default();
        let mut emote_ids = HashSet::new();
        let mut badges = HashSet::new();
        let mut emote_names = HashSet::new();
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "comments" => {
                    let comments: Vec<Value> = map.next_value()?;
                    for comment in &comments {
                        if let Some(entry) = parse_message(comment) {
                            if entry.offset_seconds == Some(self.boundary_offset) {
                                state.boundary_entries.push(entry);
                            }
                        }
                    }
                }
                "twitchEmotes" => {
                    let items: Vec<IdOnly> = map.next_value()?;
                    emote_ids.extend(items.into_iter().map(|i| i.id));
                }
                "twitchBadges" => {
                    let items: Vec<BadgePair> = map.next_value()?;
                    badges.extend(items.into_iter().map(|b| (b.set_id, b.version)));
                }
                "cheerEmotes" | "emotes" => {
                    let items: Vec<NameOnly> = map.next_value()?;
                    emote_names.extend(items.into_iter().map(|i| i.name));
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        state.dedupe = DedupeSets {
            twitch_emote_ids: emote_ids,
            badges,
            emote_names,
        };
        Ok(state)
    }
}

/// Everything a rerun needs to continue where the record left off.
#[derive(Debug, Default)]
pub struct ResumePoint {
    pub media_bytes: u64,
    pub chat: ChatResumeState,
}

/// Bring on-disk artifacts back in line with the persisted record before a
/// rerun: drop any torn tail past the durable media byte count and rebuild
/// the chat archive's dedupe state from its durable prefix.
pub async fn prepare_resume(files: &FileStore, task: &DownloadTask) -> Result<ResumePoint> {
    if task.playlist_to_file {
        if let Some(uri) = &task.result_file_uri {
            files.truncate_to(PathBuf::from(uri), task.bytes_written).await?;
        }
    }
    let chat = match &task.chat_file_uri {
        Some(uri) if task.chat_bytes_written > 0 => {
            scan_chat_archive(
                Path::new(uri),
                task.chat_bytes_written,
                task.chat_offset_seconds,
            )
            .await?
        }
        _ => ChatResumeState::default(),
    };
    Ok(ResumePoint {
        media_bytes: task.bytes_written,
        chat,
    })
}

/// Rebuild resume state from an interrupted archive. Only the first
/// `durable_len` bytes are trusted; everything past that is a torn tail or
/// the at-rest close and is ignored. The durable prefix is an open top-level
/// object, so the scan closes it in memory before parsing.
pub async fn scan_chat_archive(
    path: &Path,
    durable_len: u64,
    boundary_offset: i64,
) -> Result<ChatResumeState> {
    if durable_len == 0 || !tokio::fs::try_exists(path).await? {
        return Ok(ChatResumeState::default());
    }
    let bytes = tokio::fs::read(path).await?;
    let take = (durable_len as usize).min(bytes.len());
    let mut doc = String::from_utf8_lossy(&bytes[..take]).into_owned();
    doc.push('}');

    let mut de = serde_json::Deserializer::from_str(&doc);
    let state = ArchiveScanSeed { boundary_offset }.deserialize(&mut de)?;
    Ok(state)
}
