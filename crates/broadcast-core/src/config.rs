//! Engine configuration.

use serde::{Deserialize, Serialize};

/// When a `submit` is acknowledged relative to its fan-out.
///
/// The default is `Immediate`. Deployments that need `submit_ok` to mean
/// "every neighbor has the value" must select `AfterFanout`
/// (`"ack_mode": "after-fanout"` or `--ack-mode after-fanout`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// Acknowledge right after the local append; fan out in the background.
    #[default]
    Immediate,
    /// Acknowledge only after every forward was acknowledged.
    /// A failed fan-out produces no reply; the sender's redelivery runs the
    /// fan-out again without storing the value twice.
    AfterFanout,
}

impl std::str::FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(AckMode::Immediate),
            "after-fanout" => Ok(AckMode::AfterFanout),
            other => Err(format!(
                "unknown ack mode '{other}', expected 'immediate' or 'after-fanout'"
            )),
        }
    }
}

/// Configuration for the dissemination engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// When submits are acknowledged (default: immediate)
    #[serde(default)]
    pub ack_mode: AckMode,

    /// Skip forwards whose broadcast id was already seen (default: true).
    /// With dedup off, every delivery is stored and re-forwarded.
    #[serde(default = "default_true")]
    pub dedup: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::default(),
            dedup: default_true(),
        }
    }
}

fn default_true() -> bool {
    true
}
