//! Runtime configuration for the critic and the refinement loop.
//!
//! Values are layered: built-in defaults, an optional JSON file, then `CRITIC_*`
//! environment overrides. [`CriticConfig::validate`] repairs inconsistent values
//! in place and reports every correction as a [`ConfigWarning`].

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::gateway::RetryPolicy;
use crate::judge::Role;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config json in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Env { key: String, value: String },
}

/// A value that was out of range and replaced by a safe default.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigWarning {
    pub field: &'static str,
    pub message: String,
}

impl ConfigWarning {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Quantiles of the pattern distribution used for initial anchors.
    pub quantiles: Vec<f64>,
    pub max_initial: usize,
    /// Hard cap after densification merges bucket anchors in.
    pub max_total: usize,
    pub max_exemplars: usize,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            quantiles: vec![0.1, 0.25, 0.5, 0.75, 0.9],
            max_initial: 7,
            max_total: 9,
            max_exemplars: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrengthWeights {
    pub weak: f64,
    pub medium: f64,
    pub strong: f64,
}

impl Default for StrengthWeights {
    fn default() -> Self {
        Self {
            weak: 1.0,
            medium: 2.0,
            strong: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleTau {
    pub methodology: f64,
    pub novelty: f64,
    pub storyteller: f64,
}

impl Default for RoleTau {
    fn default() -> Self {
        Self {
            methodology: 1.0,
            novelty: 1.0,
            storyteller: 1.0,
        }
    }
}

impl RoleTau {
    pub fn for_role(&self, role: Role) -> f64 {
        match role {
            Role::Methodology => self.methodology,
            Role::Novelty => self.novelty,
            Role::Storyteller => self.storyteller,
        }
    }
}

/// Fitted τ values produced by an offline calibration run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TauFile {
    #[serde(default)]
    pub tau_methodology: Option<f64>,
    #[serde(default)]
    pub tau_novelty: Option<f64>,
    #[serde(default)]
    pub tau_storyteller: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub tau: RoleTau,
    /// Optional JSON file with fitted per-role τ; overrides `tau` when present.
    pub tau_path: Option<PathBuf>,
    pub grid_step: f64,
    /// Loss delta defining the confidence band (χ²₁ at 95% / 2).
    pub ci_loss_delta: f64,
    pub strength_weights: StrengthWeights,
    /// Score reported when there is no usable evidence.
    pub neutral_score: f64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            tau: RoleTau::default(),
            tau_path: None,
            grid_step: 0.01,
            ci_loss_delta: 1.92,
            strength_weights: StrengthWeights::default(),
            neutral_score: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Strict mode fails the scoring call when repairs are exhausted.
    pub strict: bool,
    pub repair_attempts: u32,
    pub rationale_max_words: usize,
    /// Characters of the invalid output echoed back in a repair request.
    pub repair_echo_chars: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-5-mini".to_string(),
            temperature: 0.0,
            max_tokens: 1024,
            strict: true,
            repair_attempts: 2,
            rationale_max_words: 25,
            repair_echo_chars: 6000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    /// At least N roles at or above q75 and the mean at or above q50.
    #[serde(rename = "two_of_three_q75_and_avg_ge_q50")]
    QuantileVote,
    /// Mean at or above the fixed threshold.
    Fixed,
}

impl PassMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassMode::QuantileVote => "two_of_three_q75_and_avg_ge_q50",
            PassMode::Fixed => "fixed",
        }
    }
}

impl FromStr for PassMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "two_of_three_q75_and_avg_ge_q50" => Ok(PassMode::QuantileVote),
            "fixed" => Ok(PassMode::Fixed),
            other => Err(format!("unknown pass mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassFallback {
    Global,
    Fixed,
}

impl FromStr for PassFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "global" => Ok(PassFallback::Global),
            "fixed" => Ok(PassFallback::Fixed),
            other => Err(format!("unknown pass fallback: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PassConfig {
    pub mode: PassMode,
    pub min_pattern_population: usize,
    pub fallback: PassFallback,
    pub fixed_threshold: f64,
    pub min_roles_at_q75: usize,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            mode: PassMode::QuantileVote,
            min_pattern_population: 20,
            fallback: PassFallback::Global,
            fixed_threshold: 7.0,
            min_roles_at_q75: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DensifyConfig {
    pub enabled: bool,
    pub loss_threshold: f64,
    /// Minimum mean strength multiplier across a role's comparisons.
    pub min_mean_strength: f64,
    pub bucket_width: f64,
    pub bucket_count: usize,
}

impl Default for DensifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            loss_threshold: 0.03,
            min_mean_strength: 1.5,
            bucket_width: 1.0,
            bucket_count: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    pub max_iterations: usize,
    /// Allowed drop on the diagnosed dimension before a revision is reverted.
    pub rollback_tolerance: f64,
    /// Minimum gain across two accepted iterations before a sweep kicks in.
    pub stagnation_margin: f64,
    pub max_sweep_attempts: usize,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            rollback_tolerance: 0.1,
            stagnation_margin: 0.5,
            max_sweep_attempts: 3,
        }
    }
}

// =============================================================================
// Top level
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticConfig {
    pub anchors: AnchorConfig,
    pub inference: InferenceConfig,
    pub judge: JudgeConfig,
    pub pass: PassConfig,
    pub densify: DensifyConfig,
    pub refine: RefineConfig,
    pub retry: RetryPolicy,
}

impl CriticConfig {
    /// Load the layered configuration and validate it.
    ///
    /// Corrections are logged at `warn` and returned to the caller.
    pub fn load(path: Option<&Path>) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        if let Some(tau_path) = config.inference.tau_path.clone() {
            config.apply_tau_file(&tau_path)?;
        }
        let warnings = config.validate();
        for w in &warnings {
            warn!(field = w.field, message = %w.message, "config value corrected");
        }
        Ok((config, warnings))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_tau_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let fitted: TauFile = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(t) = fitted.tau_methodology {
            self.inference.tau.methodology = t;
        }
        if let Some(t) = fitted.tau_novelty {
            self.inference.tau.novelty = t;
        }
        if let Some(t) = fitted.tau_storyteller {
            self.inference.tau.storyteller = t;
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CRITIC_ANCHOR_QUANTILES") {
            self.anchors.quantiles = parse_list("CRITIC_ANCHOR_QUANTILES", &v)?;
        }
        set_parsed(&get, "CRITIC_ANCHOR_MAX_INITIAL", &mut self.anchors.max_initial)?;
        set_parsed(&get, "CRITIC_ANCHOR_MAX_TOTAL", &mut self.anchors.max_total)?;
        set_parsed(&get, "CRITIC_ANCHOR_MAX_EXEMPLARS", &mut self.anchors.max_exemplars)?;

        set_parsed(&get, "CRITIC_TAU_METHODOLOGY", &mut self.inference.tau.methodology)?;
        set_parsed(&get, "CRITIC_TAU_NOVELTY", &mut self.inference.tau.novelty)?;
        set_parsed(&get, "CRITIC_TAU_STORYTELLER", &mut self.inference.tau.storyteller)?;
        if let Some(v) = get("CRITIC_TAU_PATH") {
            self.inference.tau_path = Some(PathBuf::from(v));
        }
        set_parsed(&get, "CRITIC_GRID_STEP", &mut self.inference.grid_step)?;
        set_parsed(&get, "CRITIC_CI_LOSS_DELTA", &mut self.inference.ci_loss_delta)?;

        if let Some(v) = get("CRITIC_JUDGE_MODEL") {
            self.judge.model = v;
        }
        if let Some(v) = get("CRITIC_STRICT_JSON") {
            self.judge.strict = parse_bool(&v);
        }
        set_parsed(&get, "CRITIC_JSON_RETRIES", &mut self.judge.repair_attempts)?;

        set_parsed(&get, "CRITIC_PASS_MODE", &mut self.pass.mode)?;
        set_parsed(
            &get,
            "CRITIC_PASS_MIN_PATTERN_PAPERS",
            &mut self.pass.min_pattern_population,
        )?;
        set_parsed(&get, "CRITIC_PASS_FALLBACK", &mut self.pass.fallback)?;
        set_parsed(&get, "CRITIC_PASS_SCORE", &mut self.pass.fixed_threshold)?;

        if let Some(v) = get("CRITIC_DENSIFY_ENABLED") {
            self.densify.enabled = parse_bool(&v);
        }
        set_parsed(&get, "CRITIC_DENSIFY_LOSS_THRESHOLD", &mut self.densify.loss_threshold)?;
        set_parsed(
            &get,
            "CRITIC_DENSIFY_MIN_MEAN_STRENGTH",
            &mut self.densify.min_mean_strength,
        )?;

        set_parsed(&get, "CRITIC_MAX_REFINE_ITERATIONS", &mut self.refine.max_iterations)?;
        set_parsed(&get, "CRITIC_MAX_SWEEP_ATTEMPTS", &mut self.refine.max_sweep_attempts)?;
        set_parsed(&get, "CRITIC_RETRY_MAX", &mut self.retry.max_retries)?;
        Ok(())
    }

    /// Replace out-of-range values with defaults, returning one warning per fix.
    pub fn validate(&mut self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let defaults = CriticConfig::default();

        let before = self.anchors.quantiles.len();
        self.anchors
            .quantiles
            .retain(|q| q.is_finite() && (0.0..=1.0).contains(q));
        if self.anchors.quantiles.is_empty() {
            self.anchors.quantiles = defaults.anchors.quantiles.clone();
            warnings.push(ConfigWarning::new(
                "anchors.quantiles",
                "no usable quantiles; using defaults",
            ));
        } else if self.anchors.quantiles.len() != before {
            warnings.push(ConfigWarning::new(
                "anchors.quantiles",
                "dropped quantiles outside [0, 1]",
            ));
        }
        if self.anchors.max_initial == 0 {
            self.anchors.max_initial = defaults.anchors.max_initial;
            warnings.push(ConfigWarning::new("anchors.max_initial", "must be >= 1"));
        }
        if self.anchors.max_total < self.anchors.max_initial {
            self.anchors.max_total = self.anchors.max_initial;
            warnings.push(ConfigWarning::new(
                "anchors.max_total",
                "raised to max_initial",
            ));
        }

        for role in Role::ALL {
            let tau = self.inference.tau.for_role(role);
            if !(tau.is_finite() && tau > 0.0) {
                let slot = match role {
                    Role::Methodology => &mut self.inference.tau.methodology,
                    Role::Novelty => &mut self.inference.tau.novelty,
                    Role::Storyteller => &mut self.inference.tau.storyteller,
                };
                *slot = 1.0;
                warnings.push(ConfigWarning::new(
                    "inference.tau",
                    format!("non-positive tau {tau} for {}; using 1.0", role.as_str()),
                ));
            }
        }
        let step = self.inference.grid_step;
        if !(step.is_finite() && step > 0.0 && step <= 9.0) {
            self.inference.grid_step = defaults.inference.grid_step;
            warnings.push(ConfigWarning::new(
                "inference.grid_step",
                format!("invalid step {step}; using 0.01"),
            ));
        }
        let delta = self.inference.ci_loss_delta;
        if !(delta.is_finite() && delta >= 0.0) {
            self.inference.ci_loss_delta = defaults.inference.ci_loss_delta;
            warnings.push(ConfigWarning::new("inference.ci_loss_delta", "must be >= 0"));
        }
        let w = self.inference.strength_weights;
        if ![w.weak, w.medium, w.strong]
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
        {
            self.inference.strength_weights = StrengthWeights::default();
            warnings.push(ConfigWarning::new(
                "inference.strength_weights",
                "weights must be positive; using 1/2/3",
            ));
        }
        if !(1.0..=10.0).contains(&self.inference.neutral_score) {
            self.inference.neutral_score = defaults.inference.neutral_score;
            warnings.push(ConfigWarning::new(
                "inference.neutral_score",
                "must lie in [1, 10]",
            ));
        }

        if self.judge.rationale_max_words == 0 {
            self.judge.rationale_max_words = defaults.judge.rationale_max_words;
            warnings.push(ConfigWarning::new("judge.rationale_max_words", "must be >= 1"));
        }

        if self.pass.min_roles_at_q75 == 0 || self.pass.min_roles_at_q75 > Role::ALL.len() {
            self.pass.min_roles_at_q75 = defaults.pass.min_roles_at_q75;
            warnings.push(ConfigWarning::new(
                "pass.min_roles_at_q75",
                "must be between 1 and the number of roles",
            ));
        }
        if !(1.0..=10.0).contains(&self.pass.fixed_threshold) {
            self.pass.fixed_threshold = defaults.pass.fixed_threshold;
            warnings.push(ConfigWarning::new("pass.fixed_threshold", "must lie in [1, 10]"));
        }

        if !(self.densify.bucket_width.is_finite() && self.densify.bucket_width > 0.0) {
            self.densify.bucket_width = defaults.densify.bucket_width;
            warnings.push(ConfigWarning::new("densify.bucket_width", "must be > 0"));
        }
        if self.densify.bucket_count == 0 {
            self.densify.bucket_count = defaults.densify.bucket_count;
            warnings.push(ConfigWarning::new("densify.bucket_count", "must be >= 1"));
        }

        if self.refine.max_iterations == 0 {
            self.refine.max_iterations = defaults.refine.max_iterations;
            warnings.push(ConfigWarning::new("refine.max_iterations", "must be >= 1"));
        }
        if !(self.refine.rollback_tolerance.is_finite() && self.refine.rollback_tolerance >= 0.0) {
            self.refine.rollback_tolerance = defaults.refine.rollback_tolerance;
            warnings.push(ConfigWarning::new("refine.rollback_tolerance", "must be >= 0"));
        }

        warnings
    }
}

fn set_parsed<T, G>(get: &G, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::Env {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

fn parse_list(key: &str, raw: &str) -> Result<Vec<f64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<f64>().map_err(|_| ConfigError::Env {
                key: key.to_string(),
                value: raw.to_string(),
            })
        })
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
