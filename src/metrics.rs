//! Presentation-ready values derived from a [`DashboardSnapshot`].
//!
//! Everything here is a pure function of its inputs and is recomputed on every read; nothing
//! is cached and the snapshot is never modified.

use crate::{
    plans::PlanConfig,
    usage::{BillingWindow, DashboardSnapshot, ModelUsage, SessionSummary, TokenUsage},
};
use std::fmt;

pub const WINDOW_MINUTES: i64 = 300;

/// Share of the active window already elapsed, in percent.
pub fn time_progress(remaining_minutes: i64) -> f64 {
    let elapsed = (WINDOW_MINUTES - remaining_minutes) as f64;
    clamp_percent(elapsed / WINDOW_MINUTES as f64 * 100.0)
}

/// Share of the plan's quota consumed, in percent.
pub fn quota_progress(total_tokens: u64, plan: &PlanConfig) -> f64 {
    if plan.token_limit == 0 {
        return if total_tokens == 0 { 0.0 } else { 100.0 };
    }
    clamp_percent(total_tokens as f64 / plan.token_limit as f64 * 100.0)
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

pub fn active_window(windows: &[BillingWindow]) -> Option<&BillingWindow> {
    windows.iter().find(|window| window.is_active)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowProgress<'a> {
    pub window: &'a BillingWindow,
    pub plan: &'a PlanConfig,
    pub time_percent: f64,
    pub quota_percent: f64,
    pub remaining: DurationParts,
}

/// Progress for the active window, if there is one.
pub fn window_progress<'a>(
    windows: &'a [BillingWindow],
    plan: &'a PlanConfig,
) -> Option<WindowProgress<'a>> {
    let window = active_window(windows)?;
    Some(WindowProgress {
        window,
        plan,
        time_percent: time_progress(window.remaining_minutes),
        quota_percent: quota_progress(window.total_tokens, plan),
        remaining: DurationParts::from_minutes(window.remaining_minutes),
    })
}

/// Models that saw any tokens, most expensive first. Equal costs keep the backend's order.
pub fn model_breakdown(models: &[ModelUsage]) -> Vec<&ModelUsage> {
    let mut active: Vec<&ModelUsage> = models
        .iter()
        .filter(|model| !model.tokens.is_zero())
        .collect();
    // `sort_by` is stable.
    active.sort_by(|a, b| b.cost_usd.total_cmp(&a.cost_usd));
    active
}

pub fn total_tokens(usage: &TokenUsage) -> u64 {
    usage.total()
}

pub fn recent_sessions(snapshot: &DashboardSnapshot, limit: usize) -> &[SessionSummary] {
    let end = snapshot.sessions.len().min(limit);
    &snapshot.sessions[..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationParts {
    pub hours: i64,
    pub minutes: i64,
}

impl DurationParts {
    /// Negative input is treated as zero.
    pub fn from_minutes(total: i64) -> Self {
        let total = total.max(0);
        Self {
            hours: total / 60,
            minutes: total % 60,
        }
    }
}

impl fmt::Display for DurationParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hours > 0 {
            write!(f, "{}h {}m", self.hours, self.minutes)
        } else {
            write!(f, "{}m", self.minutes)
        }
    }
}
