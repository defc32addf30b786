use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ChatSource, PageRequest};
use crate::chat::fetcher::enrich_page;
use crate::consts::{REPLAY_BUFFER_REFILL, RESYNC_WINDOW_MS};
use crate::error::Error;
use crate::models::ChatArchiveEntry;

/// Playback position and speed, read live on every scheduling decision.
pub trait PlayerClock: Send + Sync + 'static {
    /// Current position in the video, or `None` while the player is not ready.
    fn position_ms(&self) -> Option<u64>;
    fn speed(&self) -> f32;
}

/// Receives replayed messages in playback order.
pub trait ChatReplayListener: Send + Sync + 'static {
    fn on_message(&self, entry: ChatArchiveEntry);
    /// The visible backlog is stale; drop it before new messages arrive.
    fn clear(&self);
    fn on_integrity_failure(&self);
}

struct Shared {
    queue: Mutex<VecDeque<ChatArchiveEntry>>,
    refill: Notify,
    reschedule: Notify,
}

/// Replays archived chat against a live playback clock. One loader task keeps
/// the queue topped up page by page; one delivery task releases messages when
/// the clock reaches their offset, scaled by playback speed. Seeks outside a
/// small forward window tear both tasks down and reload from the new offset.
pub struct ChatReplayScheduler<S: ChatSource, C: PlayerClock, L: ChatReplayListener> {
    source: S,
    clock: Arc<C>,
    listener: Arc<L>,
    video_id: String,
    start_time_seconds: i64,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    load_handle: Option<JoinHandle<()>>,
    deliver_handle: Option<JoinHandle<()>>,
    last_position_ms: u64,
    started: bool,
}

impl<S: ChatSource, C: PlayerClock, L: ChatReplayListener> ChatReplayScheduler<S, C, L> {
    pub fn new(
        source: S,
        clock: Arc<C>,
        listener: Arc<L>,
        video_id: impl Into<String>,
        start_time_seconds: i64,
    ) -> Self {
        Self {
            source,
            clock,
            listener,
            video_id: video_id.into(),
            start_time_seconds,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                refill: Notify::new(),
                reschedule: Notify::new(),
            }),
            cancel: CancellationToken::new(),
            load_handle: None,
            deliver_handle: None,
            last_position_ms: 0,
            started: false,
        }
    }

    pub fn start(&mut self) {
        let position = self.clock.position_ms().unwrap_or(0);
        self.restart_from(position);
        self.started = true;
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.load_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.deliver_handle.take() {
            handle.abort();
        }
        self.started = false;
    }

    /// Call after a seek. A jump backwards, or forwards past the resync
    /// window, reloads from the new offset; a small forward drift is left to
    /// the delivery task, which reads the clock live.
    pub fn update_position(&mut self) {
        if !self.started {
            return;
        }
        let position = self.clock.position_ms().unwrap_or(0);
        if position < self.last_position_ms
            || position > self.last_position_ms + RESYNC_WINDOW_MS
        {
            self.restart_from(position);
        } else {
            self.last_position_ms = position;
            self.shared.reschedule.notify_waiters();
        }
    }

    /// Call after a speed change; wakes the delivery wait so it recomputes.
    pub fn update_speed(&mut self) {
        self.shared.reschedule.notify_waiters();
    }

    fn restart_from(&mut self, position_ms: u64) {
        self.cancel.cancel();
        if let Some(handle) = self.load_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.deliver_handle.take() {
            handle.abort();
        }
        self.listener.clear();
        self.shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            refill: Notify::new(),
            reschedule: Notify::new(),
        });
        self.cancel = CancellationToken::new();
        self.last_position_ms = position_ms;

        let start_offset = self.start_time_seconds + (position_ms / 1000) as i64;
        self.load_handle = Some(tokio::spawn(load_loop(
            self.source.clone(),
            self.video_id.clone(),
            start_offset,
            Arc::clone(&self.shared),
            Arc::clone(&self.listener),
            self.cancel.clone(),
        )));
        self.deliver_handle = Some(tokio::spawn(deliver_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.clock),
            Arc::clone(&self.listener),
            self.start_time_seconds,
            self.cancel.clone(),
        )));
    }
}

impl<S: ChatSource, C: PlayerClock, L: ChatReplayListener> Drop
    for ChatReplayScheduler<S, C, L>
{
    fn drop(&mut self) {
        self.stop();
    }
}

async fn load_loop<S: ChatSource, L: ChatReplayListener>(
    source: S,
    video_id: String,
    start_offset: i64,
    shared: Arc<Shared>,
    listener: Arc<L>,
    cancel: CancellationToken,
) {
    let mut next_request = Some(PageRequest::Offset(start_offset));
    while let Some(request) = next_request.take() {
        if cancel.is_cancelled() {
            return;
        }
        let raw = match source.next_page(&video_id, &request).await {
            Ok(raw) => raw,
            Err(Error::IntegrityCheck) => {
                listener.on_integrity_failure();
                return;
            }
            Err(e) => {
                log::warn!("chat replay page fetch failed: {}", e);
                return;
            }
        };
        let page = enrich_page(raw);
        let exhausted = page.has_next_page == Some(false)
            || !page.cursor.as_deref().is_some_and(|c| !c.trim().is_empty());
        if !exhausted {
            next_request = page.cursor.clone().map(PageRequest::Cursor);
        }
        {
            let mut queue = shared.queue.lock().await;
            queue.extend(page.entries);
        }
        if next_request.is_none() {
            return;
        }
        // hold the next fetch until the delivery side drains the buffer
        loop {
            let pending = shared.queue.lock().await.len();
            if pending <= REPLAY_BUFFER_REFILL {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = shared.refill.notified() => {}
            }
        }
    }
}

async fn deliver_loop<C: PlayerClock, L: ChatReplayListener>(
    shared: Arc<Shared>,
    clock: Arc<C>,
    listener: Arc<L>,
    start_time_seconds: i64,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let next = shared.queue.lock().await.front().cloned();
        let Some(entry) = next else {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
            continue;
        };
        let offset = entry.offset_seconds.unwrap_or(start_time_seconds);
        let target_ms = (offset - start_time_seconds).max(0) as u64 * 1000;
        loop {
            let position = clock.position_ms().unwrap_or(0);
            if position >= target_ms {
                break;
            }
            let speed = f64::from(clock.speed()).max(0.1);
            let wait_ms = ((target_ms - position) as f64 / speed).ceil() as u64;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = shared.reschedule.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            }
        }
        {
            let mut queue = shared.queue.lock().await;
            queue.pop_front();
            if queue.len() <= REPLAY_BUFFER_REFILL {
                shared.refill.notify_waiters();
            }
        }
        listener.on_message(entry);
    }
}
