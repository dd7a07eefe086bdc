use crate::{
    backend::{Invalidation, InvalidationSender},
    pricing::PriceTable,
    storage::{IngestStateRow, NewEntry, Storage},
    usage::TokenUsage,
};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{
    collections::{HashMap, VecDeque},
    fs::{self, File},
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle, time};

const UNKNOWN: &str = "unknown";

pub struct IngestHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<Result<()>>,
}

impl IngestHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!(err)),
        }
    }
}

/// Polls the log roots and broadcasts an [`Invalidation`] whenever a scan stores new entries.
pub async fn spawn(
    roots: Vec<PathBuf>,
    poll_interval: Duration,
    storage: Storage,
    prices: PriceTable,
    invalidations: InvalidationSender,
) -> Result<IngestHandle> {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let mut ingestor = LogIngestor::new(roots, storage, prices, invalidations).await?;
    let poll_interval = poll_interval.max(Duration::from_secs(1));

    let join = tokio::spawn(async move {
        let mut ticker = time::interval(poll_interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = ingestor.scan_once().await {
                        tracing::warn!(error = %err, "usage log scan failed");
                    }
                }
                _ = &mut shutdown_rx => {
                    break;
                }
            }
        }
        Ok(())
    });

    Ok(IngestHandle {
        shutdown: Some(shutdown_tx),
        join,
    })
}

struct LogIngestor {
    roots: Vec<PathBuf>,
    storage: Storage,
    prices: PriceTable,
    invalidations: InvalidationSender,
    offsets: HashMap<PathBuf, u64>,
}

impl LogIngestor {
    async fn new(
        roots: Vec<PathBuf>,
        storage: Storage,
        prices: PriceTable,
        invalidations: InvalidationSender,
    ) -> Result<Self> {
        let offsets = storage
            .load_ingest_state()
            .await?
            .into_iter()
            .map(|state| (state.path, state.last_offset))
            .collect();
        Ok(Self {
            roots,
            storage,
            prices,
            invalidations,
            offsets,
        })
    }

    /// Returns how many new entries were stored.
    async fn scan_once(&mut self) -> Result<usize> {
        let mut paths = Vec::new();
        for root in &self.roots {
            if !root.exists() {
                tracing::debug!(root = %root.display(), "log root not found");
                continue;
            }
            paths.extend(jsonl_files_under(root));
        }

        let mut stored = 0;
        for path in paths {
            match self.process_file(&path).await {
                Ok(count) => stored += count,
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "skipping log file this scan");
                }
            }
        }

        if stored > 0 {
            tracing::debug!(stored, "new usage entries ingested");
            // No receivers just means nobody is listening yet.
            let _ = self.invalidations.send(Invalidation);
        }
        Ok(stored)
    }

    /// Stores entries from the unread tail of `path`. Stops at the first entry that cannot be
    /// stored so the next scan resumes from that line.
    async fn process_file(&mut self, path: &Path) -> Result<usize> {
        let len = path
            .metadata()
            .with_context(|| format!("failed to stat log file {}", path.display()))?
            .len();

        let mut offset = self.offsets.get(path).copied().unwrap_or(0);
        if len == offset {
            return Ok(0);
        }
        if len < offset {
            tracing::info!(path = %path.display(), "log file shrank, rescanning from start");
            offset = 0;
        }

        let lines = read_complete_lines(path, offset)?;
        let mut reached = offset;
        let mut stored = 0;
        for line in &lines {
            if let Some(entry) = parse_entry(&line.text, &self.prices) {
                match self.storage.insert_entry(&entry).await {
                    Ok(true) => stored += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            path = %path.display(),
                            offset = reached,
                            "failed to store usage entry, retrying from this line next scan"
                        );
                        break;
                    }
                }
            }
            reached = line.end;
        }

        if reached != self.offsets.get(path).copied().unwrap_or(0) {
            self.offsets.insert(path.to_path_buf(), reached);
            let state = IngestStateRow {
                path: path.to_path_buf(),
                last_offset: reached,
            };
            // Stored entries are deduplicated, so a lost offset only costs a re-read after restart.
            if let Err(err) = self.storage.upsert_ingest_state(&state).await {
                tracing::warn!(error = %err, path = %path.display(), "failed to persist ingest offset");
            }
        }
        Ok(stored)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogLine {
    timestamp: String,
    session_id: Option<String>,
    cwd: Option<String>,
    request_id: Option<String>,
    #[serde(rename = "costUSD")]
    cost_usd: Option<f64>,
    message: LogMessage,
}

#[derive(Debug, Deserialize)]
struct LogMessage {
    id: Option<String>,
    model: Option<String>,
    usage: Option<LogUsage>,
}

#[derive(Debug, Deserialize)]
struct LogUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

/// Lines that are not usage-bearing assistant messages yield `None`.
fn parse_entry(line: &str, prices: &PriceTable) -> Option<NewEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let parsed: LogLine = serde_json::from_str(line).ok()?;
    let usage = parsed.message.usage?;
    let timestamp = parse_timestamp(&parsed.timestamp)?;

    let tokens = TokenUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_creation_input_tokens: usage.cache_creation_input_tokens.unwrap_or(0),
        cache_read_input_tokens: usage.cache_read_input_tokens.unwrap_or(0),
    };
    let model = parsed.message.model.unwrap_or_else(|| UNKNOWN.to_string());
    let cost_usd = parsed
        .cost_usd
        .unwrap_or_else(|| prices.cost(&model, &tokens))
        .max(0.0);

    Some(NewEntry {
        timestamp,
        session_id: parsed.session_id.unwrap_or_else(|| UNKNOWN.to_string()),
        project_path: parsed.cwd.unwrap_or_else(|| UNKNOWN.to_string()),
        model,
        message_id: parsed.message.id,
        request_id: parsed.request_id,
        tokens,
        cost_usd,
    })
}

/// Every `.jsonl` file below `root`, in path order. Unreadable directories are skipped.
fn jsonl_files_under(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = pending.pop_front() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, dir = %dir.display(), "failed to read log directory");
                continue;
            }
        };
        for path in entries.filter_map(|entry| entry.ok().map(|entry| entry.path())) {
            if path.is_dir() {
                pending.push_back(path);
            } else if path.extension().is_some_and(|ext| ext == "jsonl") {
                found.push(path);
            }
        }
    }
    found.sort();
    found
}

/// A newline-terminated line and the file offset just past its newline.
#[derive(Debug, PartialEq)]
struct CompleteLine {
    text: String,
    end: u64,
}

/// Lines after `offset` that already end in a newline. A trailing partial line is left for a
/// later scan.
fn read_complete_lines(path: &Path, offset: u64) -> Result<Vec<CompleteLine>> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open log file {}", path.display()))?;
    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("failed to seek log file {}", path.display()))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)
        .with_context(|| format!("failed to read log file {}", path.display()))?;

    let mut end = offset;
    let lines = tail
        .split_inclusive(|byte| *byte == b'\n')
        .take_while(|chunk| chunk.ends_with(b"\n"))
        .map(|chunk| {
            end += chunk.len() as u64;
            let body = &chunk[..chunk.len() - 1];
            let body = body.strip_suffix(b"\r").unwrap_or(body);
            CompleteLine {
                text: String::from_utf8_lossy(body).into_owned(),
                end,
            }
        })
        .collect();
    Ok(lines)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
