use crate::{
    storage::{Storage, StoredEntry},
    usage::{
        BillingWindow, SessionSummary, TimeRange, UsageData,
        windows::{WindowSample, calculate_billing_windows},
    },
};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use std::{collections::HashMap, future::Future};
use thiserror::Error;
use tokio::sync::broadcast;

/// "Something changed, re-fetch." Carries no payload on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation;

pub type InvalidationSender = broadcast::Sender<Invalidation>;
pub type InvalidationReceiver = broadcast::Receiver<Invalidation>;

pub fn invalidation_channel() -> InvalidationSender {
    let (tx, _) = broadcast::channel(16);
    tx
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendQueryError {
    #[error("usage storage query failed: {0}")]
    Storage(String),
    #[error("usage backend unreachable: {0}")]
    Transport(String),
    #[error("usage backend responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode usage backend response: {0}")]
    Decode(String),
}

impl From<anyhow::Error> for BackendQueryError {
    fn from(err: anyhow::Error) -> Self {
        BackendQueryError::Storage(format!("{err:#}"))
    }
}

/// The query surface the dashboard reads from. Every call is independent and may fail.
pub trait UsageBackend: Send + Sync + 'static {
    fn usage_data(
        &self,
        range: TimeRange,
    ) -> impl Future<Output = Result<UsageData, BackendQueryError>> + Send;

    fn billing_windows(
        &self,
    ) -> impl Future<Output = Result<Vec<BillingWindow>, BackendQueryError>> + Send;

    fn session_breakdown(
        &self,
    ) -> impl Future<Output = Result<Vec<SessionSummary>, BackendQueryError>> + Send;
}

/// Answers queries straight from the local usage database.
#[derive(Clone)]
pub struct LocalBackend {
    storage: Storage,
}

impl LocalBackend {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    async fn usage_data_at<Tz: TimeZone>(
        &self,
        range: TimeRange,
        now: DateTime<Tz>,
    ) -> Result<UsageData, BackendQueryError> {
        let (start, end) = range_bounds(range, &now);
        let model_breakdown = self.storage.model_totals_between(start, end).await?;

        let mut usage = UsageData::empty(now.with_timezone(&Utc));
        for model in &model_breakdown {
            usage.total_tokens.add(&model.tokens);
            usage.total_cost_usd += model.cost_usd;
        }
        usage.model_breakdown = model_breakdown;
        Ok(usage)
    }

    async fn billing_windows_at<Tz: TimeZone>(
        &self,
        now: DateTime<Tz>,
    ) -> Result<Vec<BillingWindow>, BackendQueryError> {
        let entries = self.today_entries(&now).await?;
        let samples: Vec<WindowSample> = entries
            .iter()
            .map(|entry| WindowSample {
                timestamp: entry.timestamp,
                tokens: entry.tokens,
                cost_usd: entry.cost_usd,
            })
            .collect();
        Ok(calculate_billing_windows(&samples, now.with_timezone(&Utc)))
    }

    async fn session_breakdown_at<Tz: TimeZone>(
        &self,
        now: DateTime<Tz>,
    ) -> Result<Vec<SessionSummary>, BackendQueryError> {
        let entries = self.today_entries(&now).await?;
        Ok(summarize_sessions(&entries))
    }

    async fn today_entries<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
    ) -> Result<Vec<StoredEntry>, BackendQueryError> {
        let (start, end) = range_bounds(TimeRange::Today, now);
        Ok(self.storage.entries_between(start, end).await?)
    }
}

impl UsageBackend for LocalBackend {
    async fn usage_data(&self, range: TimeRange) -> Result<UsageData, BackendQueryError> {
        self.usage_data_at(range, Local::now()).await
    }

    async fn billing_windows(&self) -> Result<Vec<BillingWindow>, BackendQueryError> {
        self.billing_windows_at(Local::now()).await
    }

    async fn session_breakdown(&self) -> Result<Vec<SessionSummary>, BackendQueryError> {
        self.session_breakdown_at(Local::now()).await
    }
}

/// `[start, end)` in UTC for a range evaluated in `now`'s time zone. All ranges end at the
/// start of tomorrow.
pub fn range_bounds<Tz: TimeZone>(range: TimeRange, now: &DateTime<Tz>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    let first_day = match range {
        TimeRange::Today => today,
        TimeRange::Week => today - ChronoDuration::days(7),
        TimeRange::Month => NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today),
    };
    let tomorrow = today.succ_opt().unwrap_or(today);
    let tz = now.timezone();
    (start_of_day(&tz, first_day), start_of_day(&tz, tomorrow))
}

fn start_of_day<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// One summary per session, most recently active first.
fn summarize_sessions(entries: &[StoredEntry]) -> Vec<SessionSummary> {
    let mut sessions: HashMap<&str, SessionSummary> = HashMap::new();

    for entry in entries {
        let session = sessions
            .entry(entry.session_id.as_str())
            .or_insert_with(|| SessionSummary {
                session_id: entry.session_id.clone(),
                project_path: entry.project_path.clone(),
                start_time: entry.timestamp,
                end_time: entry.timestamp,
                message_count: 0,
                total_cost_usd: 0.0,
                models: Vec::new(),
            });

        session.start_time = session.start_time.min(entry.timestamp);
        session.end_time = session.end_time.max(entry.timestamp);
        session.message_count = session.message_count.saturating_add(1);
        session.total_cost_usd += entry.cost_usd;
        if !session.models.contains(&entry.model) {
            session.models.push(entry.model.clone());
        }
    }

    let mut sessions: Vec<SessionSummary> = sessions.into_values().collect();
    sessions.sort_by(|a, b| {
        b.end_time
            .cmp(&a.end_time)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    sessions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{storage::NewEntry, usage::TokenUsage};
    use tempfile::NamedTempFile;

    fn utc(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, hour, minute, 0).unwrap()
    }

    fn new_entry(at: DateTime<Utc>, session: &str, model: &str, input: u64, cost: f64) -> NewEntry {
        NewEntry {
            timestamp: at,
            session_id: session.to_string(),
            project_path: format!("/work/{session}"),
            model: model.to_string(),
            message_id: None,
            request_id: None,
            tokens: TokenUsage {
                input_tokens: input,
                output_tokens: 0,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 0,
            },
            cost_usd: cost,
        }
    }

    async fn backend_with(entries: &[NewEntry]) -> (NamedTempFile, LocalBackend) {
        let db_file = NamedTempFile::new().unwrap();
        let storage = Storage::connect(db_file.path()).await.unwrap();
        storage.ensure_schema().await.unwrap();
        for entry in entries {
            storage.insert_entry(entry).await.unwrap();
        }
        (db_file, LocalBackend::new(storage))
    }

    #[test]
    fn range_bounds_follow_calendar_days() {
        let now = utc(18, 15, 30);

        let (start, end) = range_bounds(TimeRange::Today, &now);
        assert_eq!(start, utc(18, 0, 0));
        assert_eq!(end, utc(19, 0, 0));

        let (start, _) = range_bounds(TimeRange::Week, &now);
        assert_eq!(start, utc(11, 0, 0));

        let (start, _) = range_bounds(TimeRange::Month, &now);
        assert_eq!(start, utc(1, 0, 0));
    }

    #[test]
    fn range_bounds_respect_local_offset() {
        let tz = chrono::FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2025, 6, 18, 1, 0, 0).unwrap();
        let (start, _) = range_bounds(TimeRange::Today, &now);
        assert_eq!(start, utc(17, 22, 0));
    }

    #[tokio::test]
    async fn usage_data_totals_models_in_range() {
        let (_db, backend) = backend_with(&[
            new_entry(utc(18, 9, 0), "s1", "claude-sonnet-4-5", 100, 0.3),
            new_entry(utc(18, 10, 0), "s1", "claude-opus-4-5", 40, 1.2),
            new_entry(utc(15, 10, 0), "s0", "claude-opus-4-5", 7, 0.7),
            new_entry(utc(2, 10, 0), "s0", "claude-haiku-4-5", 1, 0.01),
        ])
        .await;
        let now = utc(18, 12, 0);

        let today = backend.usage_data_at(TimeRange::Today, now).await.unwrap();
        assert_eq!(today.total_tokens.input_tokens, 140);
        assert!((today.total_cost_usd - 1.5).abs() < 1e-9);
        assert_eq!(today.model_breakdown.len(), 2);
        assert_eq!(today.last_updated, now);

        let week = backend.usage_data_at(TimeRange::Week, now).await.unwrap();
        assert_eq!(week.total_tokens.input_tokens, 147);

        let month = backend.usage_data_at(TimeRange::Month, now).await.unwrap();
        assert_eq!(month.total_tokens.input_tokens, 148);
        assert_eq!(month.model_breakdown.len(), 3);
    }

    #[tokio::test]
    async fn billing_windows_cover_only_today() {
        let (_db, backend) = backend_with(&[
            new_entry(utc(17, 23, 0), "s0", "m", 500, 5.0),
            new_entry(utc(18, 8, 0), "s1", "m", 100, 1.0),
            new_entry(utc(18, 9, 0), "s1", "m", 50, 0.5),
        ])
        .await;

        let windows = backend.billing_windows_at(utc(18, 10, 0)).await.unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start_time, utc(18, 8, 0));
        assert_eq!(windows[0].total_tokens, 150);
        assert_eq!(windows[0].remaining_minutes, 180);
        assert!(windows[0].is_active);
    }

    #[tokio::test]
    async fn sessions_are_grouped_and_ordered_by_recency() {
        let (_db, backend) = backend_with(&[
            new_entry(utc(18, 8, 0), "older", "claude-opus-4-5", 1, 0.5),
            new_entry(utc(18, 8, 30), "newer", "claude-sonnet-4-5", 1, 0.1),
            new_entry(utc(18, 9, 0), "older", "claude-sonnet-4-5", 1, 0.25),
            new_entry(utc(18, 9, 45), "newer", "claude-sonnet-4-5", 1, 0.1),
            new_entry(utc(18, 9, 50), "newer", "claude-haiku-4-5", 1, 0.05),
        ])
        .await;

        let sessions = backend.session_breakdown_at(utc(18, 12, 0)).await.unwrap();
        assert_eq!(sessions.len(), 2);

        assert_eq!(sessions[0].session_id, "newer");
        assert_eq!(sessions[0].message_count, 3);
        assert_eq!(sessions[0].start_time, utc(18, 8, 30));
        assert_eq!(sessions[0].end_time, utc(18, 9, 50));
        assert_eq!(sessions[0].models, vec!["claude-sonnet-4-5", "claude-haiku-4-5"]);
        assert!((sessions[0].total_cost_usd - 0.25).abs() < 1e-9);

        assert_eq!(sessions[1].session_id, "older");
        assert_eq!(sessions[1].project_path, "/work/older");
        assert_eq!(sessions[1].models, vec!["claude-opus-4-5", "claude-sonnet-4-5"]);
    }

    #[test]
    fn storage_failures_map_to_readable_messages() {
        let err: BackendQueryError = anyhow::anyhow!("disk I/O error")
            .context("failed to load model totals")
            .into();
        assert_eq!(
            err.to_string(),
            "usage storage query failed: failed to load model totals: disk I/O error"
        );
    }
}
