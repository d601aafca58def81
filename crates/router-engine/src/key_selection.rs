use async_trait::async_trait;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;

use router_common::{ErrorKind, RouterError};
use router_provider::{Key, VendorDeployments};

/// Pluggable key-selection policy: given a filtered
/// key set, request type, provider, model, returns one key.
#[async_trait]
pub trait KeySelector: Send + Sync {
    async fn select(&self, candidates: &[Key], provider: &str, model: &str) -> Result<Key, RouterError>;
}

/// Default weighted-random selector. Any weighted-random choice that
/// respects the configured ratios is acceptable; this does not
/// reproduce a "multiply by 100, integer RNG" bias.
pub struct WeightedRandomKeySelector;

#[async_trait]
impl KeySelector for WeightedRandomKeySelector {
    async fn select(&self, candidates: &[Key], _provider: &str, _model: &str) -> Result<Key, RouterError> {
        if candidates.is_empty() {
            return Err(RouterError::new(
                ErrorKind::ConfigurationError,
                "no candidate keys to select from",
            ));
        }
        if candidates.len() == 1 {
            return Ok(candidates[0].clone());
        }
        let weights: Vec<f64> = candidates
            .iter()
            .map(|k| if k.weight > 0.0 { k.weight } else { 0.0 })
            .collect();
        if weights.iter().all(|w| *w == 0.0) {
            // All-zero weights: fall back to uniform choice rather than
            // erroring, since `WeightedIndex` rejects all-zero tables.
            let idx = rand::random::<u32>() as usize % candidates.len();
            return Ok(candidates[idx].clone());
        }
        let dist = WeightedIndex::new(&weights).map_err(|err| {
            RouterError::new(ErrorKind::ConfigurationError, format!("invalid key weights: {err}"))
        })?;
        let mut rng = rand::rng();
        Ok(candidates[dist.sample(&mut rng)].clone())
    }
}

/// Filters candidates to those eligible for `provider`/`model` (the
/// scalar selector filter chain): enabled + value-present, then
/// model-supported, then deployment-supported for Azure/Bedrock/Vertex.
pub fn filter_eligible<'a>(keys: &'a [Key], provider: &str, model: &str) -> Vec<&'a Key> {
    keys.iter()
        .filter(|k| k.enabled)
        .filter(|k| k.has_valid_value(provider))
        .filter(|k| k.supports_model(model))
        .filter(|k| {
            if VendorDeployments::requires_deployment(provider) {
                k.deployments.deployment_for(provider, model).is_some()
            } else {
                true
            }
        })
        .collect()
}

/// Multi-key resolver for batch/file/container list-style ops: every
/// enabled key, optionally `useForBatchAPI`-filtered, model-filtered,
/// sorted by id for deterministic pagination cursors.
pub fn resolve_multi_key(keys: &[Key], model: Option<&str>, require_batch_api: bool) -> Vec<Key> {
    let mut out: Vec<Key> = keys
        .iter()
        .filter(|k| k.enabled)
        .filter(|k| !require_batch_api || k.use_for_batch_api)
        .filter(|k| model.is_none_or(|m| k.supports_model(m)))
        .cloned()
        .collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

/// Providers for which key selection is skipped entirely: a narrow
/// allow-list whose ambient credentials are resolved by the provider
/// adapter itself.
pub fn skip_key_selection(provider: &str) -> bool {
    matches!(provider, "claudecode" | "geminicli" | "codex")
}

/// The scalar selector: filter → pin-by-name → single
/// candidate short-circuit → delegate to `KeySelector`.
pub async fn select_scalar_key(
    keys: &[Key],
    provider: &str,
    model: &str,
    requested_key_name: Option<&str>,
    selector: &dyn KeySelector,
) -> Result<Key, RouterError> {
    let eligible = filter_eligible(keys, provider, model);

    if let Some(name) = requested_key_name {
        return eligible
            .iter()
            .find(|k| k.name == name)
            .map(|k| (*k).clone())
            .ok_or_else(|| {
                RouterError::new(
                    ErrorKind::ConfigurationError,
                    format!("no key found with name: {name}"),
                )
            });
    }

    if eligible.is_empty() {
        return Err(RouterError::new(
            ErrorKind::ConfigurationError,
            "no keys found that support model/deployment",
        ));
    }
    if eligible.len() == 1 {
        // Property: when exactly one key matches, the weighted random
        // selector is never consulted.
        return Ok(eligible[0].clone());
    }

    let owned: Vec<Key> = eligible.into_iter().cloned().collect();
    selector.select(&owned, provider, model).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, weight: f64, enabled: bool, models: Vec<&str>) -> Key {
        Key {
            id: id.into(),
            name: id.into(),
            value: "secret".into(),
            weight,
            enabled,
            models: models.into_iter().map(String::from).collect(),
            use_for_batch_api: false,
            deployments: VendorDeployments::default(),
        }
    }

    #[tokio::test]
    async fn single_candidate_short_circuits_selector() {
        struct PanicSelector;
        #[async_trait]
        impl KeySelector for PanicSelector {
            async fn select(&self, _: &[Key], _: &str, _: &str) -> Result<Key, RouterError> {
                panic!("selector should not be consulted for a single candidate");
            }
        }
        let keys = vec![key("k1", 1.0, true, vec![])];
        let got = select_scalar_key(&keys, "openai", "gpt-4o", None, &PanicSelector)
            .await
            .unwrap();
        assert_eq!(got.id, "k1");
    }

    #[tokio::test]
    async fn pinned_key_name_must_match_exactly() {
        let keys = vec![key("k1", 1.0, true, vec![]), key("k2", 1.0, true, vec![])];
        let got = select_scalar_key(
            &keys,
            "openai",
            "gpt-4o",
            Some("k2"),
            &WeightedRandomKeySelector,
        )
        .await
        .unwrap();
        assert_eq!(got.id, "k2");

        let err = select_scalar_key(
            &keys,
            "openai",
            "gpt-4o",
            Some("missing"),
            &WeightedRandomKeySelector,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationError);
    }

    #[tokio::test]
    async fn model_allow_list_excludes_non_matching_keys() {
        let keys = vec![key("k1", 1.0, true, vec!["other-model"])];
        let err = select_scalar_key(&keys, "openai", "gpt-4o", None, &WeightedRandomKeySelector)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationError);
    }

    #[tokio::test]
    async fn deployment_gating_excludes_keys_without_matching_deployment() {
        let mut k = key("k1", 1.0, true, vec![]);
        k.deployments = VendorDeployments::default();
        let keys = vec![k];
        let err = select_scalar_key(&keys, "azure", "gpt-4o", None, &WeightedRandomKeySelector)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationError);
    }

    #[test]
    fn multi_key_resolver_sorts_by_id() {
        let keys = vec![key("b", 1.0, true, vec![]), key("a", 1.0, true, vec![])];
        let resolved = resolve_multi_key(&keys, None, false);
        assert_eq!(resolved[0].id, "a");
        assert_eq!(resolved[1].id, "b");
    }
}
