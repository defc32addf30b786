use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{ChatSource, ImageFetch, ManifestSource};
use crate::chat::archive::{ChatArchiveWriter, DedupeSets};
use crate::chat::catalog::AssetCatalog;
use crate::chat::fetcher::{filter_boundary, ChatReplayFetcher};
use crate::consts::{DEFAULT_CONCURRENT_LIMIT, DEFAULT_EMOTE_QUALITY};
use crate::error::{Error, Result};
use crate::models::{ArchiveVideoMetadata, MediaSegment, Status};
use crate::planner::plan;
use crate::pool::{ProgressSink, SegmentFetch, SegmentFetcherPool};
use crate::resume::{prepare_resume, ChatResumeState};
use crate::store::FileStore;
use crate::task::{TaskRecord, TaskStore};

/// One resumable download execution: media transfer and chat archiving run
/// concurrently against the same task record. Every progress step is
/// persisted before the next unit starts, so a kill at any point leaves a
/// record a later run can pick up.
pub struct DownloadJob<S, M, F, C, I>
where
    S: TaskStore,
    M: ManifestSource,
    F: SegmentFetch,
    C: ChatSource,
    I: ImageFetch,
{
    store: Arc<S>,
    files: FileStore,
    manifest: M,
    fetcher: F,
    pool: SegmentFetcherPool<F>,
    chat: C,
    images: I,
    catalog: AssetCatalog,
    cancel: CancellationToken,
}

struct PreparedMedia {
    segments: Vec<MediaSegment>,
    base_url: String,
    combined: bool,
    out: PathBuf,
}

impl<S, M, F, C, I> DownloadJob<S, M, F, C, I>
where
    S: TaskStore,
    M: ManifestSource,
    F: SegmentFetch,
    C: ChatSource,
    I: ImageFetch,
{
    pub fn new(
        store: Arc<S>,
        files: FileStore,
        manifest: M,
        fetcher: F,
        chat: C,
        images: I,
    ) -> Self {
        Self {
            store,
            files,
            manifest,
            pool: SegmentFetcherPool::with_concurrency(fetcher.clone(), DEFAULT_CONCURRENT_LIMIT),
            fetcher,
            chat,
            images,
            catalog: AssetCatalog::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Catalog for asset embedding. Load one only when the task asks for
    /// embedded emotes; the default empty catalog embeds nothing.
    pub fn with_catalog(mut self, catalog: AssetCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.pool = SegmentFetcherPool::with_concurrency(self.fetcher.clone(), concurrency);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the task to completion or to the first interruption. Returns the
    /// final persisted status: `Downloaded` when both sides finished,
    /// `Pending` when anything remains for a retry.
    pub async fn run(&self, id: u64) -> Result<Status> {
        let record = Arc::new(TaskRecord::load(Arc::clone(&self.store), id).await?);
        record.set_status(Status::Downloading).await?;
        let task = record.snapshot().await;
        log::info!("task {}: starting download of {}", id, task.source_url);
        let resume = prepare_resume(&self.files, &task).await?;

        if task.source_url.contains(".m3u8") {
            // window planning must finish before chat starts: the chat window
            // is anchored at the planned start position
            let prepared = self.prepare_playlist(&record).await?;
            let (media, chat) = tokio::join!(
                self.transfer_media(&record, prepared),
                self.run_chat(&record, resume.chat)
            );
            media?;
            chat?;
        } else {
            let (media, chat) = tokio::join!(
                self.run_direct(&record),
                self.run_chat(&record, resume.chat)
            );
            media?;
            chat?;
        }

        let task = record.snapshot().await;
        let status = if task.media_done() && task.chat_done() {
            Status::Downloaded
        } else {
            Status::Pending
        };
        record.set_status(status).await?;
        log::info!(
            "task {}: {} ({}/{} media units, {} chat pages)",
            id,
            status,
            task.progress,
            task.max_progress,
            task.chat_progress
        );
        Ok(status)
    }

    async fn prepare_playlist(&self, record: &Arc<TaskRecord<S>>) -> Result<PreparedMedia> {
        let task = record.snapshot().await;
        let playlist = self.manifest.fetch_playlist(&task.source_url).await?;
        let plan = plan(&playlist, task.from_time_ms, task.to_time_ms)
            .ok_or_else(|| Error::Playlist("manifest has no segments".to_owned()))?;

        let combined = task.playlist_to_file;
        let name = media_name(&task.video_id, task.id);
        let out = if combined {
            PathBuf::from(&task.download_path).join(format!("{}.ts", name))
        } else {
            PathBuf::from(&task.download_path).join(&name)
        };

        if task.source_start_position_ms.is_none() {
            let uri = if combined {
                out.clone()
            } else {
                out.join("index.m3u8")
            };
            record
                .update(|t| {
                    t.source_start_position_ms = Some(plan.start_position_ms);
                    // playback cuts the trailing second so the player never
                    // runs past the final keyframe
                    t.duration_ms = Some(plan.duration_ms.saturating_sub(1000));
                    t.max_progress = plan.segment_count() as u32;
                    t.result_file_uri = Some(uri.to_string_lossy().into_owned());
                })
                .await?;
        }

        let segments: Vec<MediaSegment> = playlist.segments()
            [plan.start_index..=plan.end_index]
            .iter()
            .map(|s| s.with_uri(s.uri().replace("-unmuted", "-muted")))
            .collect();
        Ok(PreparedMedia {
            segments,
            base_url: base_url(&task.source_url),
            combined,
            out,
        })
    }

    async fn transfer_media(
        &self,
        record: &Arc<TaskRecord<S>>,
        prepared: PreparedMedia,
    ) -> Result<()> {
        let task = record.snapshot().await;
        let progress = Arc::new(MediaProgress {
            record: Arc::clone(record),
        });
        if prepared.combined {
            if task.media_done() {
                return Ok(());
            }
            let remaining = prepared.segments[task.progress as usize..].to_vec();
            self.pool
                .fetch_combined(
                    remaining,
                    &prepared.base_url,
                    &prepared.out,
                    progress,
                    self.cancel.clone(),
                )
                .await
        } else {
            self.write_local_playlist(&prepared).await?;
            let existing = self.existing_segments(&prepared.out).await?;
            // directory progress counts this run's pass over the full list,
            // skipped files included
            record.update(|t| t.progress = 0).await?;
            self.pool
                .fetch_directory(
                    prepared.segments,
                    &prepared.base_url,
                    &prepared.out,
                    existing,
                    progress,
                    self.cancel.clone(),
                )
                .await
        }
    }

    /// Rewrite the manifest with local segment names so the directory is
    /// playable as downloaded.
    async fn write_local_playlist(&self, prepared: &PreparedMedia) -> Result<()> {
        let mut playlist = m3u8_rs::MediaPlaylist::default();
        playlist.version = Some(3);
        playlist.end_list = true;
        let mut target_secs = 0u64;
        for segment in &prepared.segments {
            let duration = *segment.duration_ms() as f32 / 1000.0;
            target_secs = target_secs.max(segment.duration_ms().div_ceil(1000));
            playlist.segments.push(m3u8_rs::MediaSegment {
                uri: segment_file_local_name(segment),
                duration,
                ..Default::default()
            });
        }
        playlist.target_duration = target_secs;
        let mut buf = Vec::new();
        playlist
            .write_to(&mut buf)
            .map_err(|e| Error::Playlist(e.to_string()))?;
        tokio::fs::create_dir_all(&prepared.out).await?;
        tokio::fs::write(prepared.out.join("index.m3u8"), buf).await?;
        Ok(())
    }

    /// Segment files already present and non-empty from a previous run.
    async fn existing_segments(&self, dir: &Path) -> Result<HashSet<String>> {
        let mut existing = HashSet::new();
        for name in self.files.list_files(dir).await? {
            if name.ends_with(".m3u8") {
                continue;
            }
            if let Some(len) = self.files.file_len(dir.join(&name)).await? {
                if len > 0 {
                    existing.insert(name);
                }
            }
        }
        Ok(existing)
    }

    /// Non-playlist source: one fetch, one progress unit.
    async fn run_direct(&self, record: &Arc<TaskRecord<S>>) -> Result<()> {
        let task = record.snapshot().await;
        let out = PathBuf::from(&task.download_path).join(direct_file_name(&task.source_url));
        if task.max_progress == 0 {
            record
                .update(|t| {
                    t.max_progress = 1;
                    t.result_file_uri = Some(out.to_string_lossy().into_owned());
                })
                .await?;
        } else if task.media_done() {
            return Ok(());
        }
        let bytes = match self.fetcher.fetch(&task.source_url).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_retryable() => {
                log::warn!("direct fetch failed, task stays resumable: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if let Some(parent) = out.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&out, &bytes).await?;
        record
            .update(|t| {
                t.progress = 1;
                t.bytes_written = bytes.len() as u64;
            })
            .await?;
        Ok(())
    }

    async fn run_chat(
        &self,
        record: &Arc<TaskRecord<S>>,
        chat_state: ChatResumeState,
    ) -> Result<()> {
        let task = record.snapshot().await;
        if !task.download_chat {
            return Ok(());
        }
        let Some(video_id) = task.video_id.clone() else {
            log::warn!("task {}: chat requested but no video id, skipping", task.id);
            return Ok(());
        };
        let start_seconds =
            (task.source_start_position_ms.unwrap_or(task.from_time_ms) / 1000) as i64;
        let end_seconds = start_seconds
            + (task
                .duration_ms
                .unwrap_or(task.to_time_ms.saturating_sub(task.from_time_ms))
                / 1000) as i64;

        let chat_path = match &task.chat_file_uri {
            Some(uri) => PathBuf::from(uri),
            None => PathBuf::from(&task.download_path)
                .join(format!("{}_chat.json", media_name(&task.video_id, task.id))),
        };
        let resumed = task.chat_bytes_written > 0;
        let saved_offset = task.chat_offset_seconds;

        let (mut archive, mut dedupe, boundary, start_offset) = if resumed {
            let archive = ChatArchiveWriter::resume(&chat_path, task.chat_bytes_written).await?;
            (
                archive,
                chat_state.dedupe,
                chat_state.boundary_entries,
                saved_offset,
            )
        } else {
            let meta = ArchiveVideoMetadata::from_task(&task, &video_id);
            let archive = ChatArchiveWriter::create(&chat_path, &meta, start_seconds).await?;
            record
                .update(|t| {
                    t.chat_file_uri = Some(chat_path.to_string_lossy().into_owned());
                    t.max_chat_progress = t.chat_progress + 1;
                    t.chat_bytes_written = archive.position();
                })
                .await?;
            (archive, DedupeSets::default(), Vec::new(), start_seconds)
        };

        let empty_catalog = AssetCatalog::default();
        let catalog = if task.download_chat_emotes {
            &self.catalog
        } else {
            &empty_catalog
        };

        let mut fetcher =
            ChatReplayFetcher::new(self.chat.clone(), video_id, start_offset, end_seconds);
        let mut first = resumed;
        loop {
            // an in-flight page races the token so cancellation never waits
            // out a full page of fetches
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => None,
                page = fetcher.next_page() => Some(page),
            };
            let mut page = match fetched {
                None => {
                    archive.seal().await?;
                    return Ok(());
                }
                Some(Ok(Some(page))) => page,
                Some(Ok(None)) => break,
                Some(Err(e)) if e.is_retryable() => {
                    log::warn!("chat page fetch failed, task stays resumable: {}", e);
                    archive.seal().await?;
                    return Ok(());
                }
                Some(Err(e)) => return Err(e),
            };
            if first {
                filter_boundary(&mut page, saved_offset, &boundary);
                first = false;
            }
            let appended = tokio::select! {
                _ = self.cancel.cancelled() => None,
                res = archive.append_page(
                    &page,
                    &mut dedupe,
                    catalog,
                    &self.images,
                    DEFAULT_EMOTE_QUALITY,
                ) => Some(res),
            };
            match appended {
                None => {
                    archive.seal().await?;
                    return Ok(());
                }
                Some(Ok(())) => {}
                Some(Err(e)) if e.is_retryable() => {
                    // the durable position was last persisted after a sealed
                    // page, so the partial append is truncated on resume
                    log::warn!("chat asset embedding failed, task stays resumable: {}", e);
                    archive.seal().await?;
                    return Ok(());
                }
                Some(Err(e)) => return Err(e),
            }
            archive.seal().await?;
            let position = archive.position();
            record
                .update(|t| {
                    t.chat_progress += 1;
                    t.max_chat_progress = t.chat_progress + 1;
                    t.chat_bytes_written = position;
                    if let Some(offset) = page.last_offset_seconds {
                        t.chat_offset_seconds = offset;
                    }
                })
                .await?;
        }
        archive.seal().await?;
        // moving ceiling collapses onto progress once the history is exhausted
        record.update(|t| t.max_chat_progress = t.chat_progress).await?;
        Ok(())
    }
}

/// Mark a task deleted and remove its files and record.
pub async fn delete_download<S: TaskStore>(
    store: Arc<S>,
    files: &FileStore,
    id: u64,
) -> Result<()> {
    let record = TaskRecord::load(Arc::clone(&store), id).await?;
    record.set_status(Status::Deleting).await?;
    let task = record.snapshot().await;
    if let Some(uri) = &task.result_file_uri {
        let path = PathBuf::from(uri);
        if task.playlist_to_file {
            files.delete_file(&path).await?;
        } else if let Some(dir) = path.parent() {
            files.delete_dir(dir).await?;
        }
    }
    if let Some(uri) = &task.chat_file_uri {
        files.delete_file(PathBuf::from(uri)).await?;
    }
    store.delete(id).await
}

struct MediaProgress<S: TaskStore> {
    record: Arc<TaskRecord<S>>,
}

impl<S: TaskStore> ProgressSink for MediaProgress<S> {
    async fn unit_done(&self, bytes: u64) -> Result<()> {
        self.record
            .update(|t| {
                t.progress += 1;
                t.bytes_written += bytes;
            })
            .await
    }
}

fn media_name(video_id: &Option<String>, id: u64) -> String {
    video_id.clone().unwrap_or_else(|| id.to_string())
}

fn base_url(source: &str) -> String {
    match source.rfind('/') {
        Some(i) => source[..=i].to_owned(),
        None => String::new(),
    }
}

fn direct_file_name(source: &str) -> String {
    let name = crate::pool::segment_file_name(source);
    if name.is_empty() {
        "download.bin".to_owned()
    } else {
        name
    }
}

fn segment_file_local_name(segment: &MediaSegment) -> String {
    crate::pool::segment_file_name(segment.uri())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadTaskBuilder, RawChatPage};
    use crate::task::{JsonTaskStore, TaskStore};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone)]
    struct MockManifest {
        body: String,
    }

    impl ManifestSource for MockManifest {
        async fn fetch_playlist(&self, _url: &str) -> Result<crate::models::MediaPlaylist> {
            crate::api::parse_media_playlist(self.body.as_bytes())
        }
    }

    #[derive(Clone, Default)]
    struct MockFetch {
        data: Arc<HashMap<String, Vec<u8>>>,
        fail: Arc<std::collections::HashSet<String>>,
    }

    impl SegmentFetch for MockFetch {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            if self.fail.contains(url) {
                return Err(Error::HttpStatus(500, url.to_owned()));
            }
            self.data
                .get(url)
                .cloned()
                .ok_or_else(|| Error::HttpStatus(404, url.to_owned()))
        }
    }

    #[derive(Clone)]
    struct MockChat {
        pages: Arc<StdMutex<Vec<RawChatPage>>>,
    }

    impl ChatSource for MockChat {
        async fn next_page(
            &self,
            _video_id: &str,
            _request: &crate::api::PageRequest,
        ) -> Result<RawChatPage> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                Ok(RawChatPage::default())
            } else {
                Ok(pages.remove(0))
            }
        }
    }

    #[derive(Clone)]
    struct StubImages;

    impl ImageFetch for StubImages {
        async fn fetch_image(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(vec![0xAB])
        }
    }

    fn manifest_body() -> String {
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n\
         #EXTINF:2.000,\n0.ts\n#EXTINF:2.000,\n1.ts\n\
         #EXTINF:2.000,\n2.ts\n#EXTINF:2.000,\n3.ts\n#EXT-X-ENDLIST\n"
            .to_owned()
    }

    fn segment_data() -> HashMap<String, Vec<u8>> {
        (0..4)
            .map(|i| {
                (
                    format!("https://cdn/vod/{}.ts", i),
                    format!("seg{}", i).into_bytes(),
                )
            })
            .collect()
    }

    fn comment(id: &str, offset: i64) -> serde_json::Value {
        json!({
            "id": id,
            "contentOffsetSeconds": offset,
            "commenter": { "id": "u", "login": "v", "displayName": "V" },
            "message": { "fragments": [{ "text": "hello" }], "userBadges": [] }
        })
    }

    fn chat_pages() -> Vec<RawChatPage> {
        vec![
            RawChatPage {
                comments: vec![comment("a", 1), comment("b", 3)],
                cursor: Some("c1".into()),
                last_offset_seconds: Some(3),
                has_next_page: Some(true),
            },
            RawChatPage {
                comments: vec![comment("c", 6)],
                cursor: None,
                last_offset_seconds: Some(6),
                has_next_page: Some(false),
            },
        ]
    }

    fn job(
        store: Arc<JsonTaskStore>,
        root: &Path,
        fetch: MockFetch,
        pages: Vec<RawChatPage>,
    ) -> DownloadJob<JsonTaskStore, MockManifest, MockFetch, MockChat, StubImages> {
        DownloadJob::new(
            store,
            FileStore::new(root),
            MockManifest {
                body: manifest_body(),
            },
            fetch,
            MockChat {
                pages: Arc::new(StdMutex::new(pages)),
            },
            StubImages,
        )
    }

    async fn seed_task(store: &JsonTaskStore, dir: &Path, combined: bool) -> Result<u64> {
        let task = DownloadTaskBuilder::default()
            .id(1u64)
            .source_url("https://cdn/vod/index.m3u8")
            .download_path(dir.to_string_lossy().into_owned())
            .from_time_ms(0u64)
            .to_time_ms(7999u64)
            .playlist_to_file(combined)
            .download_chat(true)
            .video_id("v42")
            .build()
            .unwrap();
        store.put(&task).await?;
        Ok(task.id)
    }

    #[tokio::test]
    async fn combined_download_with_chat_completes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonTaskStore::new(dir.path().join("tasks")));
        let id = seed_task(&store, dir.path(), true).await?;

        let fetch = MockFetch {
            data: Arc::new(segment_data()),
            fail: Arc::default(),
        };
        let job = job(Arc::clone(&store), dir.path(), fetch, chat_pages());
        let status = job.run(id).await?;
        assert_eq!(status, Status::Downloaded);

        let task = store.get(id).await?.unwrap();
        assert_eq!(task.progress, 4);
        assert_eq!(task.max_progress, 4);
        let media = tokio::fs::read(task.result_file_uri.as_deref().unwrap()).await?;
        assert_eq!(media, b"seg0seg1seg2seg3");

        let doc = tokio::fs::read_to_string(task.chat_file_uri.as_deref().unwrap()).await?;
        let value: serde_json::Value = serde_json::from_str(&doc)?;
        assert_eq!(value["video"]["id"], "v42");
        assert_eq!(task.chat_progress, 2);
        assert!(task.chat_done());
        Ok(())
    }

    #[tokio::test]
    async fn failed_segment_leaves_resumable_task_then_retry_finishes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonTaskStore::new(dir.path().join("tasks")));
        let id = seed_task(&store, dir.path(), true).await?;

        let mut fail = std::collections::HashSet::new();
        fail.insert("https://cdn/vod/2.ts".to_owned());
        let broken = MockFetch {
            data: Arc::new(segment_data()),
            fail: Arc::new(fail),
        };
        let status = job(Arc::clone(&store), dir.path(), broken, chat_pages())
            .run(id)
            .await?;
        assert_eq!(status, Status::Pending);

        let task = store.get(id).await?.unwrap();
        assert_eq!(task.progress, 2);
        let media = tokio::fs::read(task.result_file_uri.as_deref().unwrap()).await?;
        assert_eq!(media.len() as u64, task.bytes_written);

        // retry with a healthy fetcher picks up after the clean prefix
        let healthy = MockFetch {
            data: Arc::new(segment_data()),
            fail: Arc::default(),
        };
        let status = job(Arc::clone(&store), dir.path(), healthy, Vec::new())
            .run(id)
            .await?;
        assert_eq!(status, Status::Downloaded);
        let task = store.get(id).await?.unwrap();
        let media = tokio::fs::read(task.result_file_uri.as_deref().unwrap()).await?;
        assert_eq!(media, b"seg0seg1seg2seg3");
        Ok(())
    }

    #[tokio::test]
    async fn directory_mode_writes_local_playlist_and_segments() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonTaskStore::new(dir.path().join("tasks")));
        let id = seed_task(&store, dir.path(), false).await?;

        let fetch = MockFetch {
            data: Arc::new(segment_data()),
            fail: Arc::default(),
        };
        let status = job(Arc::clone(&store), dir.path(), fetch, chat_pages())
            .run(id)
            .await?;
        assert_eq!(status, Status::Downloaded);

        let out = dir.path().join("v42");
        let local = tokio::fs::read_to_string(out.join("index.m3u8")).await?;
        assert!(local.contains("0.ts"));
        assert!(local.contains("3.ts"));
        assert_eq!(tokio::fs::read(out.join("2.ts")).await?, b"seg2");
        Ok(())
    }

    #[tokio::test]
    async fn chat_resume_drops_boundary_duplicates() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonTaskStore::new(dir.path().join("tasks")));
        let id = seed_task(&store, dir.path(), true).await?;

        let fetch = MockFetch {
            data: Arc::new(segment_data()),
            fail: Arc::default(),
        };
        // first run sees page one and then a network failure
        #[derive(Clone)]
        struct FlakyChat {
            pages: Arc<StdMutex<Vec<RawChatPage>>>,
            calls: Arc<StdMutex<u32>>,
        }
        impl ChatSource for FlakyChat {
            async fn next_page(
                &self,
                _v: &str,
                _r: &crate::api::PageRequest,
            ) -> Result<RawChatPage> {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                if *calls == 2 {
                    return Err(Error::HttpStatus(502, "chat".into()));
                }
                let mut pages = self.pages.lock().unwrap();
                if pages.is_empty() {
                    Ok(RawChatPage::default())
                } else {
                    Ok(pages.remove(0))
                }
            }
        }
        let chat = FlakyChat {
            pages: Arc::new(StdMutex::new(chat_pages())),
            calls: Arc::new(StdMutex::new(0)),
        };
        let job1 = DownloadJob::new(
            Arc::clone(&store),
            FileStore::new(dir.path()),
            MockManifest {
                body: manifest_body(),
            },
            fetch.clone(),
            chat.clone(),
            StubImages,
        );
        let status = job1.run(id).await?;
        assert_eq!(status, Status::Pending);
        let task = store.get(id).await?.unwrap();
        assert_eq!(task.chat_progress, 1);
        assert_eq!(task.chat_offset_seconds, 3);

        // second run: the server replays the boundary message "b" at offset 3
        let replayed = vec![
            RawChatPage {
                comments: vec![comment("b", 3), comment("c", 6)],
                cursor: None,
                last_offset_seconds: Some(6),
                has_next_page: Some(false),
            },
        ];
        let status = job(Arc::clone(&store), dir.path(), fetch, replayed)
            .run(id)
            .await?;
        assert_eq!(status, Status::Downloaded);

        let task = store.get(id).await?.unwrap();
        let doc = tokio::fs::read_to_string(task.chat_file_uri.as_deref().unwrap()).await?;
        assert!(serde_json::from_str::<serde::de::IgnoredAny>(&doc).is_ok());
        assert_eq!(doc.matches("\"id\":\"b\"").count(), 1);
        assert_eq!(doc.matches("\"id\":\"c\"").count(), 1);
        Ok(())
    }

    #[derive(Clone)]
    struct FailingImages;

    impl ImageFetch for FailingImages {
        async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
            Err(Error::HttpStatus(503, url.to_owned()))
        }
    }

    #[tokio::test]
    async fn failed_asset_fetch_leaves_resumable_status() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonTaskStore::new(dir.path().join("tasks")));
        let task = DownloadTaskBuilder::default()
            .id(1u64)
            .source_url("https://cdn/vod/index.m3u8")
            .download_path(dir.path().to_string_lossy().into_owned())
            .from_time_ms(0u64)
            .to_time_ms(7999u64)
            .download_chat(true)
            .download_chat_emotes(true)
            .video_id("v42")
            .build()
            .unwrap();
        store.put(&task).await?;

        let emote_page = vec![RawChatPage {
            comments: vec![json!({
                "id": "a",
                "contentOffsetSeconds": 1,
                "commenter": { "id": "u", "login": "v", "displayName": "V" },
                "message": {
                    "fragments": [{ "text": "Kappa", "emote": { "emoteID": "25" } }],
                    "userBadges": []
                }
            })],
            cursor: None,
            last_offset_seconds: Some(1),
            has_next_page: Some(false),
        }];
        let catalog = AssetCatalog::default().with_emote_url_template("https://cdn/e/{id}/{scale}");
        let broken = DownloadJob::new(
            Arc::clone(&store),
            FileStore::new(dir.path()),
            MockManifest {
                body: manifest_body(),
            },
            MockFetch {
                data: Arc::new(segment_data()),
                fail: Arc::default(),
            },
            MockChat {
                pages: Arc::new(StdMutex::new(emote_page.clone())),
            },
            FailingImages,
        )
        .with_catalog(catalog.clone());
        // the embed failure must not strand the record at Downloading
        let status = broken.run(1).await?;
        assert_eq!(status, Status::Pending);
        let saved = store.get(1).await?.unwrap();
        assert_eq!(saved.status, Status::Pending);
        assert_eq!(saved.chat_progress, 0);

        // retry with a healthy image source finishes the archive
        let healthy = DownloadJob::new(
            Arc::clone(&store),
            FileStore::new(dir.path()),
            MockManifest {
                body: manifest_body(),
            },
            MockFetch {
                data: Arc::new(segment_data()),
                fail: Arc::default(),
            },
            MockChat {
                pages: Arc::new(StdMutex::new(emote_page)),
            },
            StubImages,
        )
        .with_catalog(catalog);
        let status = healthy.run(1).await?;
        assert_eq!(status, Status::Downloaded);
        let saved = store.get(1).await?.unwrap();
        let doc = tokio::fs::read_to_string(saved.chat_file_uri.as_deref().unwrap()).await?;
        let value: serde_json::Value = serde_json::from_str(&doc)?;
        assert_eq!(value["twitchEmotes"][0]["id"], "25");
        Ok(())
    }

    #[derive(Clone)]
    struct HangingChat;

    impl ChatSource for HangingChat {
        async fn next_page(
            &self,
            _v: &str,
            _r: &crate::api::PageRequest,
        ) -> Result<RawChatPage> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_chat_page() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonTaskStore::new(dir.path().join("tasks")));
        let id = seed_task(&store, dir.path(), true).await?;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let job = DownloadJob::new(
            Arc::clone(&store),
            FileStore::new(dir.path()),
            MockManifest {
                body: manifest_body(),
            },
            MockFetch {
                data: Arc::new(segment_data()),
                fail: Arc::default(),
            },
            HangingChat,
            StubImages,
        )
        .with_cancel(cancel);

        // a page fetch that never resolves must not block the shutdown
        let status =
            tokio::time::timeout(std::time::Duration::from_secs(5), job.run(id)).await??;
        assert_eq!(status, Status::Pending);
        assert_eq!(store.get(id).await?.unwrap().status, Status::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_files_and_record() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonTaskStore::new(dir.path().join("tasks")));
        let id = seed_task(&store, dir.path(), true).await?;
        let fetch = MockFetch {
            data: Arc::new(segment_data()),
            fail: Arc::default(),
        };
        job(Arc::clone(&store), dir.path(), fetch, chat_pages())
            .run(id)
            .await?;

        let task = store.get(id).await?.unwrap();
        let media_path = PathBuf::from(task.result_file_uri.as_deref().unwrap());
        assert!(media_path.exists());

        let files = FileStore::new(dir.path());
        delete_download(Arc::clone(&store), &files, id).await?;
        assert!(!media_path.exists());
        assert!(store.get(id).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn direct_source_downloads_in_one_unit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonTaskStore::new(dir.path().join("tasks")));
        let task = DownloadTaskBuilder::default()
            .id(9u64)
            .source_url("https://cdn/files/clip.mp4")
            .download_path(dir.path().to_string_lossy().into_owned())
            .build()
            .unwrap();
        store.put(&task).await?;

        let mut data = HashMap::new();
        data.insert(
            "https://cdn/files/clip.mp4".to_owned(),
            b"clipbytes".to_vec(),
        );
        let fetch = MockFetch {
            data: Arc::new(data),
            fail: Arc::default(),
        };
        let status = job(Arc::clone(&store), dir.path(), fetch, Vec::new())
            .run(9)
            .await?;
        assert_eq!(status, Status::Downloaded);
        let saved = store.get(9).await?.unwrap();
        assert_eq!(saved.bytes_written, 9);
        assert_eq!(
            tokio::fs::read(saved.result_file_uri.as_deref().unwrap()).await?,
            b"clipbytes"
        );
        Ok(())
    }
}
