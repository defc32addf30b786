use derive_builder::Builder;
use derive_getters::Getters;
use serde::{Deserialize, Serialize};

/// One fixed-duration chunk of encoded media referenced by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
pub struct MediaSegment {
    relative_start_ms: u64,
    duration_ms: u64,
    uri: String,
}

impl MediaSegment {
    pub fn new(relative_start_ms: u64, duration_ms: u64, uri: impl Into<String>) -> Self {
        Self {
            relative_start_ms,
            duration_ms,
            uri: uri.into(),
        }
    }

    pub fn with_uri(&self, uri: impl Into<String>) -> Self {
        Self {
            relative_start_ms: self.relative_start_ms,
            duration_ms: self.duration_ms,
            uri: uri.into(),
        }
    }
}

/// Ordered segment sequence, immutable once parsed.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
pub struct MediaPlaylist {
    target_duration_ms: u64,
    segments: Vec<MediaSegment>,
}

impl MediaPlaylist {
    pub fn new(target_duration_ms: u64, segments: Vec<MediaSegment>) -> Self {
        Self {
            target_duration_ms,
            segments,
        }
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.segments.iter().map(|s| s.duration_ms).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Status {
    #[default]
    Pending,
    Queued,
    QueuedWifi,
    Blocked,
    Downloading,
    Converting,
    Moving,
    Deleting,
    Downloaded,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Queued => "queued",
            Status::QueuedWifi => "queued-wifi",
            Status::Blocked => "blocked",
            Status::Downloading => "downloading",
            Status::Converting => "converting",
            Status::Moving => "moving",
            Status::Deleting => "deleting",
            Status::Downloaded => "downloaded",
        };
        write!(f, "{}", s)
    }
}

/// Persistent per-download record. Single source of truth for resumability:
/// every progress mutation is persisted before the next unit starts.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(setter(into, strip_option), default)]
pub struct DownloadTask {
    pub id: u64,
    pub source_url: String,
    pub download_path: String,
    pub from_time_ms: u64,
    pub to_time_ms: u64,
    pub progress: u32,
    pub max_progress: u32,
    pub bytes_written: u64,
    pub status: Status,
    /// Combined-file mode when true, one file per segment otherwise.
    pub playlist_to_file: bool,
    pub download_chat: bool,
    pub download_chat_emotes: bool,
    pub chat_progress: u32,
    pub max_chat_progress: u32,
    pub chat_bytes_written: u64,
    pub chat_offset_seconds: i64,
    pub result_file_uri: Option<String>,
    pub chat_file_uri: Option<String>,
    pub source_start_position_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub video_id: Option<String>,
    pub quality: Option<String>,
    pub download_date: u64,
    pub title: Option<String>,
    pub upload_date: Option<String>,
    pub channel_id: Option<String>,
    pub channel_login: Option<String>,
    pub channel_name: Option<String>,
    pub game_id: Option<String>,
    pub game_slug: Option<String>,
    pub game_name: Option<String>,
}

impl Default for DownloadTask {
    fn default() -> Self {
        Self {
            id: 0,
            source_url: String::new(),
            download_path: String::new(),
            from_time_ms: 0,
            to_time_ms: 0,
            progress: 0,
            max_progress: 0,
            bytes_written: 0,
            status: Status::Pending,
            playlist_to_file: true,
            download_chat: false,
            download_chat_emotes: false,
            chat_progress: 0,
            max_chat_progress: 0,
            chat_bytes_written: 0,
            chat_offset_seconds: 0,
            result_file_uri: None,
            chat_file_uri: None,
            source_start_position_ms: None,
            duration_ms: None,
            video_id: None,
            quality: None,
            download_date: 0,
            title: None,
            upload_date: None,
            channel_id: None,
            channel_login: None,
            channel_name: None,
            game_id: None,
            game_slug: None,
            game_name: None,
        }
    }
}

impl DownloadTask {
    pub fn media_done(&self) -> bool {
        self.progress >= self.max_progress
    }

    pub fn chat_done(&self) -> bool {
        !self.download_chat || self.chat_progress >= self.max_chat_progress
    }
}

/// Emote occurrence inside a message, in character offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteSpan {
    pub id: String,
    pub begin: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BadgeRef {
    #[serde(rename = "setId", alias = "setID")]
    pub set_id: String,
    pub version: String,
}

/// One archived chat message. Written once, never mutated after write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatArchiveEntry {
    pub id: Option<String>,
    pub offset_seconds: Option<i64>,
    pub user_id: Option<String>,
    pub user_login: Option<String>,
    pub user_name: Option<String>,
    pub color: Option<String>,
    pub message: String,
    pub emotes: Vec<EmoteSpan>,
    pub badges: Vec<BadgeRef>,
}

/// Raw page as returned by the chat-history collaborator. `comments` holds the
/// untouched server objects so the archiver can copy them through verbatim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawChatPage {
    #[serde(default)]
    pub comments: Vec<serde_json::Value>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default, rename = "lastOffsetSeconds")]
    pub last_offset_seconds: Option<i64>,
    #[serde(default, rename = "hasNextPage")]
    pub has_next_page: Option<bool>,
}

/// A fetched page plus the usage sets the archiver dedupes against.
#[derive(Debug, Clone, Default)]
pub struct ChatPage {
    pub comments: Vec<serde_json::Value>,
    pub entries: Vec<ChatArchiveEntry>,
    pub emote_ids_used: Vec<String>,
    pub badges_used: Vec<BadgeRef>,
    pub words_used: Vec<String>,
    pub cursor: Option<String>,
    pub last_offset_seconds: Option<i64>,
    pub has_next_page: Option<bool>,
}

/// Header block written once at the top of a chat archive.
#[derive(Debug, Clone, Default, Builder)]
#[builder(setter(into, strip_option), default)]
pub struct ArchiveVideoMetadata {
    pub id: String,
    pub title: Option<String>,
    pub upload_date: Option<String>,
    pub channel_id: Option<String>,
    pub channel_login: Option<String>,
    pub channel_name: Option<String>,
    pub game_id: Option<String>,
    pub game_slug: Option<String>,
    pub game_name: Option<String>,
}

impl ArchiveVideoMetadata {
    pub fn from_task(task: &DownloadTask, video_id: &str) -> Self {
        Self {
            id: video_id.to_owned(),
            title: task.title.clone(),
            upload_date: task.upload_date.clone(),
            channel_id: task.channel_id.clone(),
            channel_login: task.channel_login.clone(),
            channel_name: task.channel_name.clone(),
            game_id: task.game_id.clone(),
            game_slug: task.game_slug.clone(),
            game_name: task.game_name.clone(),
        }
    }
}
