use std::sync::Arc;

use serde::Deserialize;

use super::anthropic::{AnthropicBackend, AnthropicConfig};
use super::InferenceService;
use crate::report::Tier;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceConfigs {
    Anthropic(AnthropicConfig),
}

impl InferenceConfigs {
    pub fn connect(&self) -> anyhow::Result<Arc<dyn InferenceService>> {
        match self {
            Self::Anthropic(cfg) => Ok(Arc::new(AnthropicBackend::new(cfg.clone())?)),
        }
    }

    /// The token ceiling for a report of the given tier.
    pub fn max_tokens(&self, tier: Tier) -> u32 {
        match self {
            Self::Anthropic(cfg) => match tier {
                Tier::Standard => cfg.max_tokens,
                Tier::DeepDive => cfg.deep_dive_max_tokens,
            },
        }
    }

    /// How long a single call may run before it is abandoned.
    pub fn timeout(&self) -> std::time::Duration {
        match self {
            Self::Anthropic(cfg) => std::time::Duration::from_secs(cfg.timeout_secs),
        }
    }
}
