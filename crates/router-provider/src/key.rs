use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A named deployment entry for Azure-shaped vendors: a model must match
/// one of these before a key is eligible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureDeployment {
    pub model: String,
    pub deployment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// Per-vendor deployment maps. Empty vectors mean "no deployment gating
/// for this vendor" (the key is eligible for any model it otherwise
/// allows).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VendorDeployments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub azure: Vec<AzureDeployment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bedrock: Vec<AzureDeployment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vertex: Vec<AzureDeployment>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub replicate: HashMap<String, String>,
}

impl VendorDeployments {
    pub fn deployment_for(&self, provider: &str, model: &str) -> Option<&AzureDeployment> {
        let table = match provider {
            "azure" => &self.azure,
            "bedrock" => &self.bedrock,
            "vertex" => &self.vertex,
            _ => return None,
        };
        table.iter().find(|d| d.model == model)
    }

    /// Providers that require deployment gating.
    pub fn requires_deployment(provider: &str) -> bool {
        matches!(provider, "azure" | "bedrock" | "vertex")
    }
}

/// A credential + eligibility policy entry for a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub name: String,
    pub value: String,
    pub weight: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Empty means "all models allowed".
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub use_for_batch_api: bool,
    #[serde(default)]
    pub deployments: VendorDeployments,
}

fn default_true() -> bool {
    true
}

impl Key {
    /// Providers that may run with an empty credential value (ambient
    /// credentials resolved out-of-band, e.g. local CLI auth).
    pub fn value_required(provider: &str) -> bool {
        !matches!(provider, "claudecode" | "geminicli" | "codex")
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    pub fn has_valid_value(&self, provider: &str) -> bool {
        !self.value.is_empty() || !Self::value_required(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_model_allow_list_matches_everything() {
        let key = Key {
            id: "k1".into(),
            name: "k1".into(),
            value: "secret".into(),
            weight: 1.0,
            enabled: true,
            models: vec![],
            use_for_batch_api: false,
            deployments: VendorDeployments::default(),
        };
        assert!(key.supports_model("gpt-4o"));
    }

    #[test]
    fn deployment_gating_requires_matching_model() {
        let deployments = VendorDeployments {
            azure: vec![AzureDeployment {
                model: "gpt-4o".into(),
                deployment_id: "dep-1".into(),
                api_version: None,
            }],
            ..Default::default()
        };
        assert!(deployments.deployment_for("azure", "gpt-4o").is_some());
        assert!(deployments.deployment_for("azure", "gpt-4o-mini").is_none());
    }
}
