use crate::{
    config::{PricingConfig, TokenRates},
    usage::TokenUsage,
};

const PER_MILLION: f64 = 1_000_000.0;

#[derive(Debug, Clone)]
pub struct PriceTable {
    config: PricingConfig,
}

impl PriceTable {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    pub fn rates_for(&self, model: &str) -> TokenRates {
        let model = model.to_lowercase();
        self.config
            .models
            .iter()
            .find(|rule| {
                rule.patterns
                    .iter()
                    .any(|pattern| model.contains(&pattern.to_lowercase()))
            })
            .map(|rule| rule.rates)
            .unwrap_or(self.config.fallback)
    }

    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        let rates = self.rates_for(model);
        (usage.input_tokens as f64 / PER_MILLION) * rates.input_per_1m
            + (usage.output_tokens as f64 / PER_MILLION) * rates.output_per_1m
            + (usage.cache_creation_input_tokens as f64 / PER_MILLION) * rates.cache_creation_per_1m
            + (usage.cache_read_input_tokens as f64 / PER_MILLION) * rates.cache_read_per_1m
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::new(PricingConfig::default())
    }
}
