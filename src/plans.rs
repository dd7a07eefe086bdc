//! Subscription tiers and the user's persisted choice among them.

use crate::storage::Storage;
use anyhow::{Result, bail};
use std::future::Future;

pub const PLAN_PREFERENCE_KEY: &str = "plan";
const FALLBACK_PLAN_ID: &str = "pro";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanConfig {
    pub id: &'static str,
    pub display_name: &'static str,
    /// Tokens allowed within one active billing window.
    pub token_limit: u64,
}

/// Ordered from the smallest quota to the largest.
pub const PLANS: [PlanConfig; 3] = [
    PlanConfig {
        id: "pro",
        display_name: "Pro",
        token_limit: 19_000,
    },
    PlanConfig {
        id: "max5",
        display_name: "Max 5x",
        token_limit: 88_000,
    },
    PlanConfig {
        id: "max20",
        display_name: "Max 20x",
        token_limit: 220_000,
    },
];

/// Small key-value store holding user preferences.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;
}

impl PreferenceStore for Storage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.preference(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_preference(key, value).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlanRegistry {
    default_plan: &'static PlanConfig,
}

impl PlanRegistry {
    pub fn new(default_id: &str) -> Self {
        let default_plan = match Self::find(default_id) {
            Some(plan) => plan,
            None => {
                tracing::warn!(plan = default_id, "configured default plan is unknown, using {FALLBACK_PLAN_ID}");
                Self::fallback()
            }
        };
        Self { default_plan }
    }

    pub fn default_plan(&self) -> &'static PlanConfig {
        self.default_plan
    }

    /// The persisted plan, or the default when the preference is missing, unknown or unreadable.
    pub async fn resolve<S: PreferenceStore>(&self, store: &S) -> &'static PlanConfig {
        match store.get(PLAN_PREFERENCE_KEY).await {
            Ok(Some(id)) => match Self::find(&id) {
                Some(plan) => plan,
                None => {
                    tracing::debug!(plan = %id, "stale plan preference, falling back to default");
                    self.default_plan
                }
            },
            Ok(None) => self.default_plan,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read plan preference");
                self.default_plan
            }
        }
    }

    /// Persists an explicit user choice. Unknown ids are rejected and nothing is written.
    pub async fn select<S: PreferenceStore>(&self, store: &S, id: &str) -> Result<&'static PlanConfig> {
        let Some(plan) = Self::find(id) else {
            let known: Vec<&str> = PLANS.iter().map(|plan| plan.id).collect();
            bail!("unknown plan '{id}', expected one of: {}", known.join(", "));
        };
        store.set(PLAN_PREFERENCE_KEY, plan.id).await?;
        tracing::info!(plan = plan.id, "plan selection saved");
        Ok(plan)
    }

    /// The next tier after `current`, wrapping around to the smallest.
    pub fn next_after(&self, current: &PlanConfig) -> &'static PlanConfig {
        let idx = PLANS.iter().position(|plan| plan.id == current.id).unwrap_or(0);
        &PLANS[(idx + 1) % PLANS.len()]
    }

    fn find(id: &str) -> Option<&'static PlanConfig> {
        let id = id.trim();
        PLANS.iter().find(|plan| plan.id.eq_ignore_ascii_case(id))
    }

    fn fallback() -> &'static PlanConfig {
        &PLANS[0]
    }
}

impl Default for PlanRegistry {
    fn default() -> Self {
        Self::new(FALLBACK_PLAN_ID)
    }
}
