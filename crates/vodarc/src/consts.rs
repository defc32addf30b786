/// Cap on concurrent in-flight segment requests.
pub const DEFAULT_CONCURRENT_LIMIT: usize = 10;

/// Queue size at which the replay scheduler fetches the next page.
pub const REPLAY_BUFFER_REFILL: usize = 25;

/// Position jumps beyond this window count as a seek and flush the replay queue.
pub const RESYNC_WINDOW_MS: u64 = 20_000;

/// Image quality for embedded chat assets, 1x..4x.
pub const DEFAULT_EMOTE_QUALITY: u8 = 4;
