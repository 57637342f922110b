//! Model Registry
//!
//! Declarative mapping from (provider, tier) to model strings and from
//! agent names to tiers, loaded from a YAML document. The registry is
//! immutable after load; reload means building a fresh value and
//! swapping it in at a well-known location. A `GenerationRequest`
//! never mutates the registry.
//!
//! Resolution order for a call:
//! 1. explicit provider override from the environment (`PROVIDER`)
//! 2. explicit model override (call-site, then `<PROVIDER>_MODEL`)
//! 3. agent name → assigned tier → (provider, tier) → model
//! 4. unknown agent → tier `default`
//! 5. missing (provider, tier) → the provider's `default` tier, else
//!    a configuration error

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{GenConfig, GenParams, ParamOverlay};
use crate::error::{GatewayError, Result};

/// Capability class an agent resolves to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Default,
    Fast,
    Quality,
    Evaluation,
    Legacy,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Fast => "fast",
            Self::Quality => "quality",
            Self::Evaluation => "evaluation",
            Self::Legacy => "legacy",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_provider_timeout() -> u64 {
    60
}

/// One provider table from the registry document
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name of the environment variable holding the credential
    #[serde(default)]
    pub credential_env: Option<String>,

    /// Inline credential (discouraged outside local development)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Endpoint base URL override
    #[serde(default)]
    pub base_url: Option<String>,

    /// Default request timeout for this provider's adapter
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Per-tier model mapping
    #[serde(default)]
    pub models: BTreeMap<Tier, String>,
}

impl ProviderEntry {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DefaultsSection {
    pub provider: String,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

/// Per-agent override: an optional tier reassignment plus parameter
/// overlays applied between tier defaults and the call site.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AgentOverride {
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(flatten)]
    pub params: ParamOverlay,
}

/// Per-environment overlay of the defaults section
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EnvironmentOverlay {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub fallback_chain: Option<Vec<String>>,
}

/// The raw YAML document shape
#[derive(Clone, Debug, Deserialize)]
pub struct RegistryDoc {
    pub providers: BTreeMap<String, ProviderEntry>,
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub agent_assignments: BTreeMap<Tier, Vec<String>>,
    #[serde(default)]
    pub parameters: BTreeMap<Tier, ParamOverlay>,
    #[serde(default)]
    pub agent_overrides: BTreeMap<String, AgentOverride>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentOverlay>,
}

/// Immutable, process-wide model registry.
///
/// Relevant environment variables are snapshotted at load time so that
/// resolution is a pure function of the registry value.
#[derive(Clone, Debug)]
pub struct ModelRegistry {
    providers: BTreeMap<String, ProviderEntry>,
    default_provider: String,
    fallback_chain: Vec<String>,
    agent_tiers: BTreeMap<String, Tier>,
    parameters: BTreeMap<Tier, ParamOverlay>,
    agent_overrides: BTreeMap<String, AgentOverride>,
    env: BTreeMap<String, String>,
}

impl ModelRegistry {
    /// Load from a YAML file, snapshotting the process environment.
    pub fn load_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Configuration(format!(
                "cannot read registry file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse a YAML document, snapshotting the process environment.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let doc: RegistryDoc = serde_yaml::from_str(raw)
            .map_err(|e| GatewayError::Configuration(format!("invalid registry document: {e}")))?;
        let env: BTreeMap<String, String> = std::env::vars().collect();
        let env_name = env.get("GATEWAY_ENV").cloned();
        Self::from_doc(doc, env_name.as_deref(), env)
    }

    /// Build from a parsed document and an explicit environment
    /// snapshot. Tests use this to stay deterministic.
    pub fn from_doc(
        doc: RegistryDoc,
        env_name: Option<&str>,
        env: BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut default_provider = doc.defaults.provider.clone();
        let mut fallback_chain = doc.defaults.fallback_chain.clone();

        if let Some(name) = env_name {
            if let Some(overlay) = doc.environments.get(name) {
                if let Some(p) = &overlay.provider {
                    default_provider = p.clone();
                }
                if let Some(chain) = &overlay.fallback_chain {
                    fallback_chain = chain.clone();
                }
            }
        }

        if !doc.providers.contains_key(&default_provider) {
            return Err(GatewayError::Configuration(format!(
                "default provider '{default_provider}' has no provider table"
            )));
        }
        for id in &fallback_chain {
            if !doc.providers.contains_key(id) {
                return Err(GatewayError::Configuration(format!(
                    "fallback chain references unknown provider '{id}'"
                )));
            }
        }

        let mut agent_tiers = BTreeMap::new();
        for (tier, agents) in &doc.agent_assignments {
            for agent in agents {
                agent_tiers.insert(agent.clone(), *tier);
            }
        }

        Ok(Self {
            providers: doc.providers,
            default_provider,
            fallback_chain,
            agent_tiers,
            parameters: doc.parameters,
            agent_overrides: doc.agent_overrides,
            env,
        })
    }

    fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn provider_env_key(provider: &str, suffix: &str) -> String {
        format!("{}_{suffix}", provider.to_uppercase().replace('-', "_"))
    }

    /// The primary provider, honoring the `PROVIDER` env override.
    pub fn default_provider(&self) -> &str {
        self.env_var("PROVIDER").unwrap_or(&self.default_provider)
    }

    /// The deterministic fallback chain, deduplicated, honoring the
    /// `PROVIDER_FALLBACK` env override.
    pub fn fallback_chain(&self) -> Vec<String> {
        let chain: Vec<String> = match self.env_var("PROVIDER_FALLBACK") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => self.fallback_chain.clone(),
        };
        let mut seen = std::collections::BTreeSet::new();
        chain.into_iter().filter(|id| seen.insert(id.clone())).collect()
    }

    /// The ordered candidate list for one logical call: the primary
    /// followed by the fallback chain minus the primary.
    pub fn candidates(&self) -> Vec<String> {
        let primary = self.default_provider().to_string();
        let mut out = vec![primary.clone()];
        for id in self.fallback_chain() {
            if id != primary {
                out.push(id);
            }
        }
        out
    }

    /// Tier an agent resolves to; unknown agents land on `default`.
    pub fn tier_for_agent(&self, agent: &str) -> Tier {
        if let Some(overridden) = self.agent_overrides.get(agent).and_then(|o| o.tier) {
            return overridden;
        }
        self.agent_tiers.get(agent).copied().unwrap_or(Tier::Default)
    }

    /// Resolve the model string for (provider, agent, call config).
    pub fn resolve_model(&self, provider: &str, agent: &str, call: &GenConfig) -> Result<String> {
        if let Some(model) = &call.model {
            return Ok(model.clone());
        }
        if let Some(model) = self.env_var(&Self::provider_env_key(provider, "MODEL")) {
            return Ok(model.to_string());
        }

        let entry = self.providers.get(provider).ok_or_else(|| {
            GatewayError::Configuration(format!("unknown provider '{provider}'"))
        })?;

        let tier = self.tier_for_agent(agent);
        if let Some(model) = entry.models.get(&tier) {
            return Ok(model.clone());
        }
        if let Some(model) = entry.models.get(&Tier::Default) {
            return Ok(model.clone());
        }
        Err(GatewayError::Configuration(format!(
            "provider '{provider}' maps neither tier '{}' nor 'default' to a model",
            tier.as_str()
        )))
    }

    /// Compose the effective parameters for one adapter call:
    /// tier defaults, then agent overrides, then the call site.
    pub fn compose_params(&self, provider: &str, agent: &str, call: &GenConfig) -> Result<GenParams> {
        let model = self.resolve_model(provider, agent, call)?;
        let entry = self.providers.get(provider).ok_or_else(|| {
            GatewayError::Configuration(format!("unknown provider '{provider}'"))
        })?;

        let tier = self.tier_for_agent(agent);
        let mut overlays: Vec<&ParamOverlay> = Vec::new();
        if let Some(tier_params) = self.parameters.get(&tier) {
            overlays.push(tier_params);
        }
        if let Some(agent_override) = self.agent_overrides.get(agent) {
            overlays.push(&agent_override.params);
        }

        Ok(GenParams::compose(model, &overlays, call, entry.timeout()))
    }

    /// Provider table lookup
    pub fn provider_entry(&self, provider: &str) -> Option<&ProviderEntry> {
        self.providers.get(provider)
    }

    /// All enabled provider tables, in identifier order
    pub fn enabled_providers(&self) -> impl Iterator<Item = (&str, &ProviderEntry)> {
        self.providers
            .iter()
            .filter(|(_, e)| e.enabled)
            .map(|(id, e)| (id.as_str(), e))
    }

    /// Resolve a provider's credential: inline key, then the declared
    /// env var, then the conventional `<PROVIDER>_API_KEY`.
    pub fn credential(&self, provider: &str) -> Option<String> {
        let entry = self.providers.get(provider)?;
        if let Some(inline) = &entry.api_key {
            return Some(inline.clone());
        }
        if let Some(var) = &entry.credential_env {
            return self.env_var(var).map(str::to_string);
        }
        self.env_var(&Self::provider_env_key(provider, "API_KEY"))
            .map(str::to_string)
    }

    /// Resolve a provider's endpoint base URL, honoring
    /// `<PROVIDER>_BASE_URL`.
    pub fn base_url(&self, provider: &str) -> Option<String> {
        if let Some(url) = self.env_var(&Self::provider_env_key(provider, "BASE_URL")) {
            return Some(url.to_string());
        }
        self.providers.get(provider)?.base_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
providers:
  alpha:
    credential_env: ALPHA_API_KEY
    timeout_secs: 30
    models:
      default: alpha-base
      fast: alpha-mini
  beta:
    models:
      default: beta-base
  gamma:
    enabled: false
    models:
      quality: gamma-large
defaults:
  provider: alpha
  fallback_chain: [alpha, beta, gamma, beta]
agent_assignments:
  fast: [router, summarizer]
  quality: [planner]
parameters:
  default:
    temperature: 0.7
  fast:
    temperature: 0.3
    max_tokens: 512
agent_overrides:
  planner:
    temperature: 0.1
environments:
  staging:
    provider: beta
"#;

    fn registry() -> ModelRegistry {
        registry_with_env(BTreeMap::new())
    }

    fn registry_with_env(env: BTreeMap<String, String>) -> ModelRegistry {
        let doc: RegistryDoc = serde_yaml::from_str(DOC).unwrap();
        ModelRegistry::from_doc(doc, None, env).unwrap()
    }

    #[test]
    fn agent_tier_resolution() {
        let reg = registry();
        assert_eq!(reg.tier_for_agent("router"), Tier::Fast);
        assert_eq!(reg.tier_for_agent("planner"), Tier::Quality);
        assert_eq!(reg.tier_for_agent("nobody"), Tier::Default);
    }

    #[test]
    fn model_resolution_walks_tiers() {
        let reg = registry();
        let call = GenConfig::default();
        assert_eq!(reg.resolve_model("alpha", "router", &call).unwrap(), "alpha-mini");
        // beta has no fast tier; falls back to its default tier
        assert_eq!(reg.resolve_model("beta", "router", &call).unwrap(), "beta-base");
        // gamma maps neither quality-for-default-agent nor default
        assert!(matches!(
            reg.resolve_model("gamma", "nobody", &call),
            Err(GatewayError::Configuration(_))
        ));
    }

    #[test]
    fn call_site_model_bypasses_tiers() {
        let reg = registry();
        let call = GenConfig {
            model: Some("custom".into()),
            ..Default::default()
        };
        assert_eq!(reg.resolve_model("alpha", "router", &call).unwrap(), "custom");
    }

    #[test]
    fn env_overrides_apply() {
        let mut env = BTreeMap::new();
        env.insert("PROVIDER".to_string(), "beta".to_string());
        env.insert("ALPHA_MODEL".to_string(), "alpha-pinned".to_string());
        env.insert("PROVIDER_FALLBACK".to_string(), "gamma, alpha".to_string());
        let reg = registry_with_env(env);

        assert_eq!(reg.default_provider(), "beta");
        assert_eq!(reg.fallback_chain(), vec!["gamma".to_string(), "alpha".to_string()]);
        assert_eq!(
            reg.resolve_model("alpha", "nobody", &GenConfig::default()).unwrap(),
            "alpha-pinned"
        );
    }

    #[test]
    fn candidates_dedupe_and_exclude_primary() {
        let reg = registry();
        assert_eq!(
            reg.candidates(),
            vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
        );
    }

    #[test]
    fn parameter_composition_layers() {
        let reg = registry();
        // planner: quality tier has no params entry, so built-in
        // defaults apply, then the agent override.
        let params = reg
            .compose_params("alpha", "planner", &GenConfig::default())
            .unwrap();
        assert_eq!(params.temperature, 0.1);

        // router: fast tier params, no agent override
        let params = reg
            .compose_params("alpha", "router", &GenConfig::default())
            .unwrap();
        assert_eq!(params.temperature, 0.3);
        assert_eq!(params.max_tokens, 512);

        // call site wins
        let call = GenConfig {
            temperature: Some(1.5),
            ..Default::default()
        };
        let params = reg.compose_params("alpha", "router", &call).unwrap();
        assert_eq!(params.temperature, 1.5);
    }

    #[test]
    fn environment_overlay_changes_primary() {
        let doc: RegistryDoc = serde_yaml::from_str(DOC).unwrap();
        let reg = ModelRegistry::from_doc(doc, Some("staging"), BTreeMap::new()).unwrap();
        assert_eq!(reg.default_provider(), "beta");
    }

    #[test]
    fn unknown_default_provider_rejected() {
        let doc: RegistryDoc = serde_yaml::from_str(
            "providers: {}\ndefaults:\n  provider: ghost\n",
        )
        .unwrap();
        assert!(ModelRegistry::from_doc(doc, None, BTreeMap::new()).is_err());
    }

    #[test]
    fn reload_is_idempotent() {
        let a = registry();
        let b = registry();
        let call = GenConfig::default();
        for agent in ["router", "planner", "nobody"] {
            assert_eq!(
                a.resolve_model("alpha", agent, &call).unwrap(),
                b.resolve_model("alpha", agent, &call).unwrap()
            );
            assert_eq!(a.candidates(), b.candidates());
            assert_eq!(
                a.compose_params("alpha", agent, &call).unwrap(),
                b.compose_params("alpha", agent, &call).unwrap()
            );
        }
    }
}
