use serde_json::Value;

use crate::api::{ChatSource, PageRequest};
use crate::error::Result;
use crate::models::{BadgeRef, ChatArchiveEntry, ChatPage, EmoteSpan, RawChatPage};

/// Parse one raw comment object into an archive entry. Returns `None` when
/// the object carries no message block.
pub fn parse_message(value: &Value) -> Option<ChatArchiveEntry> {
    let obj = value.as_object()?;
    let id = obj.get("id").and_then(|v| v.as_str()).map(str::to_owned);
    let offset_seconds = obj.get("contentOffsetSeconds").and_then(|v| v.as_i64());
    let commenter = obj.get("commenter").and_then(|v| v.as_object());
    let user_id = commenter
        .and_then(|c| c.get("id"))
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    let user_login = commenter
        .and_then(|c| c.get("login"))
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    let user_name = commenter
        .and_then(|c| c.get("displayName"))
        .and_then(|v| v.as_str())
        .map(str::to_owned);

    let message_obj = obj.get("message").and_then(|v| v.as_object())?;
    let mut message = String::new();
    let mut emotes = Vec::new();
    if let Some(fragments) = message_obj.get("fragments").and_then(|v| v.as_array()) {
        for fragment in fragments {
            let text = fragment
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let emote_id = fragment
                .get("emote")
                .and_then(|e| e.get("emoteID"))
                .and_then(|v| v.as_str());
            if let Some(emote_id) = emote_id.filter(|id| !id.is_empty() && !text.is_empty()) {
                let begin = message.chars().count();
                emotes.push(EmoteSpan {
                    id: emote_id.to_owned(),
                    begin,
                    end: begin + text.chars().count().saturating_sub(1),
                });
            }
            message.push_str(text);
        }
    }
    let mut badges = Vec::new();
    if let Some(user_badges) = message_obj.get("userBadges").and_then(|v| v.as_array()) {
        for badge in user_badges {
            let set_id = badge.get("setID").and_then(|v| v.as_str());
            let version = badge.get("version").and_then(|v| v.as_str());
            if let (Some(set_id), Some(version)) = (set_id, version) {
                if !set_id.is_empty() && !version.is_empty() {
                    badges.push(BadgeRef {
                        set_id: set_id.to_owned(),
                        version: version.to_owned(),
                    });
                }
            }
        }
    }
    let color = message_obj
        .get("userColor")
        .and_then(|v| v.as_str())
        .map(str::to_owned);

    Some(ChatArchiveEntry {
        id,
        offset_seconds,
        user_id,
        user_login,
        user_name,
        color,
        message,
        emotes,
        badges,
    })
}

/// Parse entries out of a raw page and collect the usage sets the archiver
/// dedupes embedded assets against.
pub fn enrich_page(raw: RawChatPage) -> ChatPage {
    let entries: Vec<ChatArchiveEntry> =
        raw.comments.iter().filter_map(parse_message).collect();
    let mut emote_ids_used = Vec::new();
    let mut badges_used = Vec::new();
    let mut words_used = Vec::new();
    for entry in &entries {
        for emote in &entry.emotes {
            if !emote_ids_used.contains(&emote.id) {
                emote_ids_used.push(emote.id.clone());
            }
        }
        for badge in &entry.badges {
            if !badges_used.contains(badge) {
                badges_used.push(badge.clone());
            }
        }
        for word in entry.message.split_whitespace() {
            if !words_used.iter().any(|w| w == word) {
                words_used.push(word.to_owned());
            }
        }
    }
    ChatPage {
        comments: raw.comments,
        entries,
        emote_ids_used,
        badges_used,
        words_used,
        cursor: raw.cursor,
        last_offset_seconds: raw.last_offset_seconds,
        has_next_page: raw.has_next_page,
    }
}

/// The loop's three-way AND: keep fetching while the last offset has not
/// reached the window end, a cursor remains, and the server has not said
/// `hasNextPage: false`. A `false` there is an unconditional stop signal even
/// when the offset check would continue.
pub fn should_continue(
    last_offset_seconds: Option<i64>,
    end_time_seconds: i64,
    cursor: &Option<String>,
    has_next_page: Option<bool>,
) -> bool {
    if last_offset_seconds.is_some_and(|offset| offset >= end_time_seconds) {
        return false;
    }
    if !cursor.as_deref().is_some_and(|c| !c.trim().is_empty()) {
        return false;
    }
    has_next_page != Some(false)
}

/// At the resume boundary offset, drop entries that were already archived;
/// only entries strictly newer than the last saved one at that offset stay.
pub fn filter_boundary(page: &mut ChatPage, saved_offset: i64, saved: &[ChatArchiveEntry]) {
    let keep = |entry: &ChatArchiveEntry| -> bool {
        match entry.offset_seconds {
            Some(offset) if offset > saved_offset => true,
            Some(offset) if offset == saved_offset => !saved.contains(entry),
            _ => false,
        }
    };
    let kept: Vec<bool> = page
        .comments
        .iter()
        .map(|value| parse_message(value).map(|e| keep(&e)).unwrap_or(false))
        .collect();
    let mut idx = 0;
    page.comments.retain(|_| {
        let keep = kept[idx];
        idx += 1;
        keep
    });
    page.entries.retain(keep);
}

/// Cursor-driven page iterator over a chat-history source. Yields enriched
/// pages until the termination condition trips, then `None`.
pub struct ChatReplayFetcher<S: ChatSource> {
    source: S,
    video_id: String,
    end_time_seconds: i64,
    next_request: Option<PageRequest>,
}

impl<S: ChatSource> ChatReplayFetcher<S> {
    pub fn new(
        source: S,
        video_id: impl Into<String>,
        start_offset_seconds: i64,
        end_time_seconds: i64,
    ) -> Self {
        Self {
            source,
            video_id: video_id.into(),
            end_time_seconds,
            next_request: Some(PageRequest::Offset(start_offset_seconds)),
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<ChatPage>> {
        let Some(request) = self.next_request.take() else {
            return Ok(None);
        };
        let raw = self.source.next_page(&self.video_id, &request).await?;
        let page = enrich_page(raw);
        if should_continue(
            page.last_offset_seconds,
            self.end_time_seconds,
            &page.cursor,
            page.has_next_page,
        ) {
            self.next_request = page.cursor.clone().map(PageRequest::Cursor);
        }
        Ok(Some(page))
    }
}
