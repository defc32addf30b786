use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::consts::DEFAULT_CONCURRENT_LIMIT;
use crate::error::{Error, Result};
use crate::models::MediaSegment;

/// Segment byte retrieval, separated out so the ordering logic is testable
/// without a network.
pub trait SegmentFetch: Clone + Send + Sync + 'static {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Receives one call per durably written unit. Implementations persist the
/// task record; calls are already serialized by the pool.
pub trait ProgressSink: Send + Sync + 'static {
    fn unit_done(&self, bytes: u64) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone)]
pub struct HttpSegmentFetcher {
    client: reqwest::Client,
}

impl HttpSegmentFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl SegmentFetch for HttpSegmentFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        use futures_util::TryStreamExt;

        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::HttpStatus(resp.status().as_u16(), url.to_owned()));
        }
        let mut out = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.try_next().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

struct GateState {
    next: u64,
    closed_at: u64,
}

/// Ticket gate for out-of-order completion with in-order writes. The holder
/// of ticket `k` may write only once the counter reaches `k`; closing at `k`
/// blocks every ticket at or above `k` from ever writing.
struct WriteGate {
    state: std::sync::Mutex<GateState>,
    notify: Notify,
}

impl WriteGate {
    fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(GateState {
                next: 0,
                closed_at: u64::MAX,
            }),
            notify: Notify::new(),
        }
    }

    /// Returns false when the gate was closed at or below `ticket`.
    async fn wait_turn(&self, ticket: u64) -> bool {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().unwrap();
                if ticket >= state.closed_at {
                    return false;
                }
                if state.next == ticket {
                    return true;
                }
            }
            notified.await;
        }
    }

    fn advance(&self) {
        self.state.lock().unwrap().next += 1;
        self.notify.notify_waiters();
    }

    fn close(&self, ticket: u64) {
        let mut state = self.state.lock().unwrap();
        state.closed_at = state.closed_at.min(ticket);
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Bounded-concurrency segment fetcher. Fetches run up to `concurrency` at a
/// time; combined-file appends are strictly ordered by segment index through
/// the write gate, directory-mode writes are unordered.
pub struct SegmentFetcherPool<F: SegmentFetch> {
    fetcher: F,
    concurrency: usize,
}

impl<F: SegmentFetch> SegmentFetcherPool<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            concurrency: DEFAULT_CONCURRENT_LIMIT,
        }
    }

    pub fn with_concurrency(fetcher: F, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
        }
    }

    /// Append `segments` to `out_path` in order. The caller has already
    /// truncated the file to the last durable byte; `segments` holds only the
    /// not-yet-written remainder.
    ///
    /// A failed unit closes the gate at its ticket: earlier in-flight units
    /// still land, later ones are dropped so the file stays a clean prefix.
    /// The final progress-versus-max check decides overall task status, not
    /// the per-unit errors.
    pub async fn fetch_combined<P: ProgressSink>(
        &self,
        segments: Vec<MediaSegment>,
        base_url: &str,
        out_path: &Path,
        progress: Arc<P>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if segments.is_empty() {
            return Ok(());
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(out_path)
            .await?;
        let file = Arc::new(Mutex::new(file));
        let gate = Arc::new(WriteGate::new());
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for (ticket, segment) in segments.into_iter().enumerate() {
            let ticket = ticket as u64;
            let url = join_url(base_url, segment.uri());
            let fetcher = self.fetcher.clone();
            let file = file.clone();
            let gate = gate.clone();
            let semaphore = semaphore.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                // the permit covers network I/O only; holding it across the
                // gate wait could starve the lowest unwritten ticket
                let permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Channel(e.to_string()))?;
                let bytes = tokio::select! {
                    _ = cancel.cancelled() => {
                        gate.close(ticket);
                        return Ok(());
                    }
                    res = fetcher.fetch(&url) => match res {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::warn!("segment {} fetch failed: {}", url, e);
                            gate.close(ticket);
                            return Ok(());
                        }
                    }
                };
                drop(permit);
                let turn = tokio::select! {
                    _ = cancel.cancelled() => {
                        gate.close(ticket);
                        return Ok(());
                    }
                    turn = gate.wait_turn(ticket) => turn,
                };
                if !turn {
                    return Ok(());
                }
                {
                    let mut file = file.lock().await;
                    file.write_all(&bytes).await?;
                    file.flush().await?;
                }
                progress.unit_done(bytes.len() as u64).await?;
                gate.advance();
                Ok::<(), Error>(())
            });
        }

        while let Some(joined) = set.join_next().await {
            joined.map_err(|e| Error::Future(e.to_string()))??;
        }
        Ok(())
    }

    /// One file per segment under `dir`. Segments named in `existing` were
    /// written by a prior run and are skipped; completion order is free.
    pub async fn fetch_directory<P: ProgressSink>(
        &self,
        segments: Vec<MediaSegment>,
        base_url: &str,
        dir: &Path,
        existing: HashSet<String>,
        progress: Arc<P>,
        cancel: CancellationToken,
    ) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let existing = Arc::new(existing);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for segment in segments {
            let url = join_url(base_url, segment.uri());
            let name = segment_file_name(segment.uri());
            let path = dir.join(&name);
            let fetcher = self.fetcher.clone();
            let existing = existing.clone();
            let semaphore = semaphore.clone();
            let progress = progress.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Channel(e.to_string()))?;
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if !existing.contains(&name) {
                    let bytes = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        res = fetcher.fetch(&url) => match res {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                log::warn!("segment {} fetch failed: {}", url, e);
                                return Ok(());
                            }
                        }
                    };
                    tokio::fs::write(&path, &bytes).await?;
                    progress.unit_done(bytes.len() as u64).await?;
                } else {
                    progress.unit_done(0).await?;
                }
                Ok::<(), Error>(())
            });
        }

        while let Some(joined) = set.join_next().await {
            joined.map_err(|e| Error::Future(e.to_string()))??;
        }
        Ok(())
    }
}

pub fn join_url(base: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        uri.to_owned()
    } else {
        format!("{}{}", base, uri)
    }
}

/// Local file name for a segment uri: last path component, query stripped.
pub fn segment_file_name(uri: &str) -> String {
    let uri = uri.split('?').next().unwrap_or(uri);
    uri.rsplit('/').next().unwrap_or(uri).to_owned()
}
