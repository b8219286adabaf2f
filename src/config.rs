//! Configuration for the routing engine
//!
//! Thresholds, caps and deadlines are configuration rather than constants; every
//! source funnels through [`RouterConfig::validate`] before the engine is assembled.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, RouterError};

/// Weight tolerance used when checking that hybrid weights sum to one.
pub const WEIGHT_EPSILON: f32 = 1e-6;

/// Longest a confirmation may stay pending.
pub const MAX_CONFIRMATION_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Global engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Generalist handler used whenever no confident match exists
    pub default_handler: String,

    /// Handler forced by an image attachment
    pub image_handler: String,

    /// Handler forced by a voice attachment
    pub voice_handler: String,

    /// Proposals below this confidence fall back to the default handler
    pub confidence_floor: f32,

    /// Maximum number of handlers a single parallel request may name
    pub max_parallel_handlers: usize,

    /// Ceiling on outstanding handler invocations across all requests
    pub global_concurrency: usize,

    /// Deadline for one handler invocation, permit wait included
    pub handler_timeout_ms: u64,

    /// Deadline for one strategy consultation
    pub strategy_timeout_ms: u64,

    /// Lifetime of a pending confirmation
    pub confirmation_ttl_secs: u64,

    /// Context builder limits
    pub context: ContextLimits,

    /// Hybrid strategy weights
    pub hybrid: HybridWeights,

    /// Confidence assigned to a validated delegated choice
    pub delegated_confidence: f32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_handler: "general".to_string(),
            image_handler: "image_handler".to_string(),
            voice_handler: "voice_handler".to_string(),
            confidence_floor: 0.3,
            max_parallel_handlers: 4,
            global_concurrency: 16,
            handler_timeout_ms: 30_000,
            strategy_timeout_ms: 10_000,
            confirmation_ttl_secs: 300,
            context: ContextLimits::default(),
            hybrid: HybridWeights::default(),
            delegated_confidence: 0.8,
        }
    }
}

impl RouterConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }

    pub fn confirmation_ttl(&self) -> Duration {
        Duration::from_secs(self.confirmation_ttl_secs)
    }

    /// Rejects configurations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        for (name, id) in [
            ("default_handler", &self.default_handler),
            ("image_handler", &self.image_handler),
            ("voice_handler", &self.voice_handler),
        ] {
            if id.trim().is_empty() {
                return Err(RouterError::config(format!("{name} must not be empty")));
            }
        }
        if self.image_handler == self.default_handler || self.voice_handler == self.default_handler
        {
            return Err(RouterError::config(
                "override handlers must differ from the default handler",
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(RouterError::config(format!(
                "confidence_floor must be within [0, 1], got {}",
                self.confidence_floor
            )));
        }
        if !(0.0..=1.0).contains(&self.delegated_confidence) {
            return Err(RouterError::config(format!(
                "delegated_confidence must be within [0, 1], got {}",
                self.delegated_confidence
            )));
        }
        if self.max_parallel_handlers == 0 {
            return Err(RouterError::config("max_parallel_handlers must be at least 1"));
        }
        if self.global_concurrency == 0 {
            return Err(RouterError::config("global_concurrency must be at least 1"));
        }
        if self.handler_timeout_ms == 0 {
            return Err(RouterError::config("handler_timeout_ms must be positive"));
        }
        if self.strategy_timeout_ms == 0 {
            return Err(RouterError::config("strategy_timeout_ms must be positive"));
        }
        if !(1..=MAX_CONFIRMATION_TTL_SECS).contains(&self.confirmation_ttl_secs) {
            return Err(RouterError::config(format!(
                "confirmation_ttl_secs must be within [1, {MAX_CONFIRMATION_TTL_SECS}], got {}",
                self.confirmation_ttl_secs
            )));
        }
        self.hybrid.validate()?;
        Ok(())
    }
}

/// How much conversation the context builder keeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextLimits {
    /// Most recent turns kept in the condensed history
    pub history_turns: usize,
    /// Per-turn character cap
    pub turn_chars: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            history_turns: 10,
            turn_chars: 400,
        }
    }
}

/// Linear blend weights for the hybrid strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HybridWeights {
    pub keyword: f32,
    pub model: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            keyword: 0.4,
            model: 0.6,
        }
    }
}

impl HybridWeights {
    pub fn new(keyword: f32, model: f32) -> Result<Self> {
        let weights = Self { keyword, model };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<()> {
        if self.keyword < 0.0 || self.model < 0.0 {
            return Err(RouterError::config("hybrid weights must be non-negative"));
        }
        if ((self.keyword + self.model) - 1.0).abs() > WEIGHT_EPSILON {
            return Err(RouterError::config(format!(
                "hybrid weights must sum to 1.0, got {} + {}",
                self.keyword, self.model
            )));
        }
        Ok(())
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: RouterConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RouterConfig::default(),
        }
    }

    pub fn default_handler(mut self, id: impl Into<String>) -> Self {
        self.config.default_handler = id.into();
        self
    }

    pub fn image_handler(mut self, id: impl Into<String>) -> Self {
        self.config.image_handler = id.into();
        self
    }

    pub fn voice_handler(mut self, id: impl Into<String>) -> Self {
        self.config.voice_handler = id.into();
        self
    }

    pub fn confidence_floor(mut self, floor: f32) -> Self {
        self.config.confidence_floor = floor;
        self
    }

    pub fn max_parallel_handlers(mut self, cap: usize) -> Self {
        self.config.max_parallel_handlers = cap;
        self
    }

    pub fn global_concurrency(mut self, limit: usize) -> Self {
        self.config.global_concurrency = limit;
        self
    }

    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.config.handler_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn strategy_timeout(mut self, timeout: Duration) -> Self {
        self.config.strategy_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn confirmation_ttl(mut self, ttl: Duration) -> Self {
        self.config.confirmation_ttl_secs = ttl.as_secs();
        self
    }

    pub fn history_turns(mut self, turns: usize) -> Self {
        self.config.context.history_turns = turns;
        self
    }

    pub fn hybrid_weights(mut self, keyword: f32, model: f32) -> Self {
        self.config.hybrid = HybridWeights { keyword, model };
        self
    }

    /// Builds and validates.
    pub fn build(self) -> Result<RouterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Load configuration from `ROUTER_*` environment variables over the defaults.
///
/// Unparseable values are ignored; the result is validated.
pub fn from_env() -> Result<RouterConfig> {
    let mut config = RouterConfig::default();

    if let Ok(id) = std::env::var("ROUTER_DEFAULT_HANDLER") {
        config.default_handler = id;
    }
    if let Ok(id) = std::env::var("ROUTER_IMAGE_HANDLER") {
        config.image_handler = id;
    }
    if let Ok(id) = std::env::var("ROUTER_VOICE_HANDLER") {
        config.voice_handler = id;
    }
    if let Some(floor) = env_parse::<f32>("ROUTER_CONFIDENCE_FLOOR") {
        config.confidence_floor = floor;
    }
    if let Some(cap) = env_parse::<usize>("ROUTER_MAX_PARALLEL") {
        config.max_parallel_handlers = cap;
    }
    if let Some(limit) = env_parse::<usize>("ROUTER_GLOBAL_CONCURRENCY") {
        config.global_concurrency = limit;
    }
    if let Some(ms) = env_parse::<u64>("ROUTER_HANDLER_TIMEOUT_MS") {
        config.handler_timeout_ms = ms;
    }
    if let Some(ms) = env_parse::<u64>("ROUTER_STRATEGY_TIMEOUT_MS") {
        config.strategy_timeout_ms = ms;
    }
    if let Some(secs) = env_parse::<u64>("ROUTER_CONFIRMATION_TTL_SECS") {
        config.confirmation_ttl_secs = secs;
    }

    config.validate()?;
    Ok(config)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<RouterConfig> {
    let contents = std::fs::read_to_string(path)?;
    from_toml_str(&contents)
}

pub fn from_toml_str(contents: &str) -> Result<RouterConfig> {
    let config: RouterConfig =
        toml::from_str(contents).map_err(|e| RouterError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
