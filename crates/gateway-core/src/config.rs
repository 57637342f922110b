//! Generation Configuration
//!
//! Call-site knobs ([`GenConfig`]), the partial parameter overlays the
//! registry stores per tier and per agent ([`ParamOverlay`]), and the
//! fully-resolved parameters handed to an adapter ([`GenParams`]).
//!
//! Composition order: tier defaults, then per-agent overrides, then
//! the call-site config. The call site always wins.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Maximum number of stop sequences a request may carry
pub const MAX_STOP_SEQUENCES: usize = 8;

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_TOP_P: f32 = 0.9;
const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Call-site generation configuration. Every field is optional; the
/// registry supplies defaults for whatever the caller leaves unset.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenConfig {
    /// Explicit model override, bypassing tier lookup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Sampling temperature in [0, 2]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Nucleus sampling top-p in (0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Maximum output tokens, > 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stop sequences, at most [`MAX_STOP_SEQUENCES`]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,

    /// Per-call timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl GenConfig {
    /// Range-check whatever the caller supplied.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(GatewayError::InvalidRequest(format!(
                    "temperature {t} outside [0, 2]"
                )));
            }
        }
        if let Some(p) = self.top_p {
            if p <= 0.0 || p > 1.0 {
                return Err(GatewayError::InvalidRequest(format!(
                    "top_p {p} outside (0, 1]"
                )));
            }
        }
        if let Some(m) = self.max_tokens {
            if m == 0 {
                return Err(GatewayError::InvalidRequest(
                    "max_tokens must be greater than zero".into(),
                ));
            }
        }
        if self.stop_sequences.len() > MAX_STOP_SEQUENCES {
            return Err(GatewayError::InvalidRequest(format!(
                "at most {MAX_STOP_SEQUENCES} stop sequences are allowed"
            )));
        }
        if let Some(secs) = self.timeout_secs {
            if secs == 0 {
                return Err(GatewayError::InvalidRequest(
                    "timeout must be greater than zero".into(),
                ));
            }
        }
        Ok(())
    }
}

/// A partial parameter set, as stored by the registry per tier and per
/// agent. Unset fields defer to the next layer down.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParamOverlay {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Fully-resolved parameters for one adapter call.
#[derive(Clone, Debug, PartialEq)]
pub struct GenParams {
    /// Concrete model identifier for the selected provider
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
    /// Effective per-call timeout (minimum of caller and adapter defaults)
    pub timeout: Duration,
}

impl GenParams {
    /// Compose parameters for a call: built-in defaults, then each
    /// overlay in order (tier first, agent override second), then the
    /// call-site config on top.
    pub fn compose(
        model: impl Into<String>,
        overlays: &[&ParamOverlay],
        call: &GenConfig,
        provider_timeout: Duration,
    ) -> Self {
        let mut temperature = DEFAULT_TEMPERATURE;
        let mut top_p = DEFAULT_TOP_P;
        let mut max_tokens = DEFAULT_MAX_TOKENS;
        let mut stop_sequences: Vec<String> = Vec::new();
        let mut timeout_secs = DEFAULT_TIMEOUT_SECS;

        for overlay in overlays {
            if let Some(t) = overlay.temperature {
                temperature = t;
            }
            if let Some(p) = overlay.top_p {
                top_p = p;
            }
            if let Some(m) = overlay.max_tokens {
                max_tokens = m;
            }
            if let Some(stops) = &overlay.stop_sequences {
                stop_sequences = stops.clone();
            }
            if let Some(secs) = overlay.timeout_secs {
                timeout_secs = secs;
            }
        }

        if let Some(t) = call.temperature {
            temperature = t;
        }
        if let Some(p) = call.top_p {
            top_p = p;
        }
        if let Some(m) = call.max_tokens {
            max_tokens = m;
        }
        if !call.stop_sequences.is_empty() {
            stop_sequences = call.stop_sequences.clone();
        }
        if let Some(secs) = call.timeout_secs {
            timeout_secs = secs;
        }

        // The effective deadline never exceeds the adapter's own default.
        let timeout = Duration::from_secs(timeout_secs).min(provider_timeout.max(Duration::from_secs(1)));

        Self {
            model: model.into(),
            temperature,
            top_p,
            max_tokens,
            stop_sequences,
            timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_set() {
        let params = GenParams::compose(
            "m",
            &[],
            &GenConfig::default(),
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        );
        assert_eq!(params.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(params.top_p, DEFAULT_TOP_P);
        assert_eq!(params.max_tokens, DEFAULT_MAX_TOKENS);
        assert!(params.stop_sequences.is_empty());
    }

    #[test]
    fn call_site_wins_over_overlays() {
        let tier = ParamOverlay {
            temperature: Some(0.2),
            max_tokens: Some(512),
            ..Default::default()
        };
        let agent = ParamOverlay {
            temperature: Some(0.5),
            ..Default::default()
        };
        let call = GenConfig {
            temperature: Some(1.3),
            ..Default::default()
        };
        let params = GenParams::compose("m", &[&tier, &agent], &call, Duration::from_secs(60));
        assert_eq!(params.temperature, 1.3);
        assert_eq!(params.max_tokens, 512);
    }

    #[test]
    fn timeout_capped_by_provider_default() {
        let call = GenConfig {
            timeout_secs: Some(600),
            ..Default::default()
        };
        let params = GenParams::compose("m", &[], &call, Duration::from_secs(30));
        assert_eq!(params.timeout, Duration::from_secs(30));
    }

    #[test]
    fn validation_rejects_out_of_range() {
        let bad_temp = GenConfig {
            temperature: Some(2.5),
            ..Default::default()
        };
        assert!(bad_temp.validate().is_err());

        let bad_top_p = GenConfig {
            top_p: Some(0.0),
            ..Default::default()
        };
        assert!(bad_top_p.validate().is_err());

        let bad_stops = GenConfig {
            stop_sequences: (0..9).map(|i| i.to_string()).collect(),
            ..Default::default()
        };
        assert!(bad_stops.validate().is_err());
    }
}
