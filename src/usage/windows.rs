use super::{BillingWindow, TokenUsage};
use chrono::{DateTime, Duration as ChronoDuration, Utc};

pub const WINDOW_HOURS: i64 = 5;

/// The slice of a log entry that matters for window accounting.
#[derive(Debug, Clone, Copy)]
pub struct WindowSample {
    pub timestamp: DateTime<Utc>,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
}

/// Groups samples into fixed 5-hour windows. A window opens at the first sample not covered by
/// the previous one and absorbs every later sample within five hours of its start.
pub fn calculate_billing_windows(samples: &[WindowSample], now: DateTime<Utc>) -> Vec<BillingWindow> {
    let mut ordered: Vec<&WindowSample> = samples.iter().collect();
    ordered.sort_by_key(|sample| sample.timestamp);

    let window = ChronoDuration::hours(WINDOW_HOURS);
    let mut windows = Vec::new();
    let mut current: Option<WindowAccumulator> = None;

    for sample in ordered {
        match current.as_mut() {
            Some(acc) if sample.timestamp - acc.start <= window => acc.push(sample),
            _ => {
                if let Some(acc) = current.take() {
                    windows.push(acc.finish(now));
                }
                let mut acc = WindowAccumulator::new(sample.timestamp);
                acc.push(sample);
                current = Some(acc);
            }
        }
    }

    if let Some(acc) = current {
        windows.push(acc.finish(now));
    }

    windows
}

struct WindowAccumulator {
    start: DateTime<Utc>,
    total_tokens: u64,
    cost_usd: f64,
}

impl WindowAccumulator {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            total_tokens: 0,
            cost_usd: 0.0,
        }
    }

    fn push(&mut self, sample: &WindowSample) {
        self.total_tokens = self.total_tokens.saturating_add(sample.tokens.total());
        self.cost_usd += sample.cost_usd;
    }

    fn finish(self, now: DateTime<Utc>) -> BillingWindow {
        let end = self.start + ChronoDuration::hours(WINDOW_HOURS);
        BillingWindow {
            id: self.start.to_rfc3339(),
            start_time: self.start,
            end_time: end,
            total_tokens: self.total_tokens,
            cost_usd: self.cost_usd,
            remaining_minutes: (end - now).num_minutes().max(0),
            is_active: now >= self.start && now < end,
        }
    }
}
