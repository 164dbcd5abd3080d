//! Logical-Model Resolver (C2).

use crate::domain::{ApiStyle, LogicalModel, PhysicalModel, ProviderModel};
use crate::error::GatewayError;
use crate::kv::{keys, KvStore, KvStoreExt};
use crate::store::Store;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const DYNAMIC_CACHE_TTL: Duration = Duration::from_secs(30);

/// Severity of a `ConsistencyIssue`: `Error` excludes the logical model from
/// being considered consistent; `Warning` is informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    Error,
    Warning,
}

/// A single drift-detection finding for a dynamically-synthesized
/// `LogicalModel`, raised against the current `ProviderModel` index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyIssue {
    pub level: ConsistencyLevel,
    pub code: &'static str,
    pub message: String,
}

/// Validates that every upstream a synthesized `LogicalModel` references
/// still exists in `index`, that matched upstreams agree on `meta_hash`
/// (an upstream drift signal), and flags (without blocking) a model-family
/// disagreement across upstreams.
pub fn validate_logical_model_consistency(
    model: &LogicalModel,
    index: &HashMap<(String, String), ProviderModel>,
) -> Vec<ConsistencyIssue> {
    let mut issues = Vec::new();
    let mut present = Vec::new();
    for up in &model.upstreams {
        match index.get(&(up.provider_id.clone(), up.model_id.clone())) {
            Some(m) => present.push(m),
            None => issues.push(ConsistencyIssue {
                level: ConsistencyLevel::Error,
                code: "missing_provider_model",
                message: format!(
                    "upstream ({}, {}) not found in the provider model catalogue",
                    up.provider_id, up.model_id
                ),
            }),
        }
    }

    if present.is_empty() {
        return issues;
    }

    let hashes: HashSet<&str> = present.iter().map(|m| m.meta_hash.as_str()).filter(|h| !h.is_empty()).collect();
    if hashes.len() > 1 {
        let mut sorted: Vec<&str> = hashes.into_iter().collect();
        sorted.sort_unstable();
        issues.push(ConsistencyIssue {
            level: ConsistencyLevel::Error,
            code: "meta_hash_mismatch",
            message: format!(
                "logical model {} maps to upstreams with conflicting meta_hash values: {sorted:?}",
                model.id
            ),
        });
        // A hash conflict is the strongest signal; skip the weaker family check.
        return issues;
    }

    let families: HashSet<&str> = present.iter().filter_map(|m| m.family.as_deref()).collect();
    if families.len() > 1 {
        let mut sorted: Vec<&str> = families.into_iter().collect();
        sorted.sort_unstable();
        issues.push(ConsistencyIssue {
            level: ConsistencyLevel::Warning,
            code: "family_mismatch",
            message: format!("logical model {} maps to different model families: {sorted:?}", model.id),
        });
    }

    issues
}

pub fn is_logical_model_consistent(issues: &[ConsistencyIssue]) -> bool {
    issues.iter().all(|i| i.level != ConsistencyLevel::Error)
}

pub struct LogicalModelResolver {
    store: Arc<dyn Store>,
    kv: Arc<dyn KvStore>,
}

impl LogicalModelResolver {
    pub fn new(store: Arc<dyn Store>, kv: Arc<dyn KvStore>) -> Self {
        Self { store, kv }
    }

    pub async fn resolve(
        &self,
        lookup_id: &str,
        api_style: ApiStyle,
        allowed_provider_ids: &[String],
    ) -> Result<LogicalModel, GatewayError> {
        let mut model = match self.kv.get::<LogicalModel>(&keys::logical_model(lookup_id)).await {
            Ok(Some(m)) => m,
            _ => self.synthesize(lookup_id, allowed_provider_ids).await?,
        };

        if !model.enabled {
            return Err(GatewayError::ModelDisabled);
        }

        // Filter out `responses`-only physicals for openai/claude callers
        // unless doing so would leave nothing.
        if matches!(api_style, ApiStyle::Openai | ApiStyle::Claude) {
            let filtered: Vec<PhysicalModel> = model
                .upstreams
                .iter()
                .filter(|p| p.api_style != ApiStyle::Responses)
                .cloned()
                .collect();
            if filtered.is_empty() {
                if model.upstreams.is_empty() {
                    return Err(GatewayError::UnknownModel(lookup_id.to_string()));
                }
                return Err(GatewayError::RequiresResponsesEndpoint);
            }
            model.upstreams = filtered;
        }

        if model.upstreams.iter().all(|p| p.disabled) {
            return Err(GatewayError::ModelDisabled);
        }

        Ok(model)
    }

    /// Scans `ProviderModel` rows matching `lookup_id` (or an alias)
    /// restricted to `allowed_provider_ids`, unions capabilities, orders
    /// upstreams by `base_weight` desc, and caches the synthesis briefly.
    async fn synthesize(
        &self,
        lookup_id: &str,
        allowed_provider_ids: &[String],
    ) -> Result<LogicalModel, GatewayError> {
        let rows = self
            .store
            .find_provider_models_by_model_id(lookup_id)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let mut upstreams: Vec<PhysicalModel> = rows
            .iter()
            .filter(|m| allowed_provider_ids.iter().any(|id| id == &m.provider_id))
            .map(|m| PhysicalModel {
                provider_id: m.provider_id.clone(),
                model_id: m.model_id.clone(),
                endpoint: m.endpoint.clone(),
                api_style: m.api_style,
                base_weight: m.base_weight,
                region: None,
                max_qps: m.max_qps,
                meta_hash: m.meta_hash.clone(),
                disabled: m.disabled,
            })
            .collect();

        if upstreams.is_empty() {
            return Err(GatewayError::UnknownModel(lookup_id.to_string()));
        }

        upstreams.sort_by(|a, b| b.base_weight.partial_cmp(&a.base_weight).unwrap_or(std::cmp::Ordering::Equal));

        let mut capabilities = std::collections::HashSet::new();
        for m in rows.iter().filter(|m| allowed_provider_ids.iter().any(|id| id == &m.provider_id)) {
            capabilities.extend(m.capabilities.iter().copied());
        }

        let model = LogicalModel {
            id: lookup_id.to_string(),
            display_name: lookup_id.to_string(),
            capabilities: capabilities.into_iter().collect(),
            upstreams,
            enabled: true,
        };

        // Consistency checking (drift detection): before a synthesized
        // LogicalModel is trusted, verify every referenced upstream still
        // exists in the current ProviderModel index and that matched
        // upstreams agree on meta_hash; a family mismatch is logged but
        // does not block routing.
        let index: HashMap<(String, String), ProviderModel> = rows
            .iter()
            .filter(|m| allowed_provider_ids.iter().any(|id| id == &m.provider_id))
            .map(|m| ((m.provider_id.clone(), m.model_id.clone()), m.clone()))
            .collect();
        let issues = validate_logical_model_consistency(&model, &index);
        for issue in &issues {
            match issue.level {
                ConsistencyLevel::Error => tracing::warn!(code = issue.code, message = %issue.message, "logical model consistency error"),
                ConsistencyLevel::Warning => tracing::debug!(code = issue.code, message = %issue.message, "logical model consistency warning"),
            }
        }
        if !is_logical_model_consistent(&issues) {
            return Err(GatewayError::ModelDisabled);
        }

        let _ = self
            .kv
            .set(&keys::logical_model(lookup_id), &model, Some(DYNAMIC_CACHE_TTL))
            .await;

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Capability;
    use crate::kv::InMemoryKv;
    use crate::store::InMemoryStore;

    fn provider_model(provider_id: &str, model_id: &str, meta_hash: &str, family: Option<&str>) -> ProviderModel {
        ProviderModel {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            family: family.map(str::to_string),
            display_name: None,
            context_length: None,
            capabilities: vec![Capability::Chat],
            pricing: None,
            alias: None,
            disabled: false,
            meta_hash: meta_hash.to_string(),
            endpoint: "chat_completions".to_string(),
            api_style: ApiStyle::Openai,
            base_weight: 1.0,
            max_qps: None,
        }
    }

    fn physical(provider_id: &str, model_id: &str, meta_hash: &str) -> PhysicalModel {
        PhysicalModel {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            endpoint: "chat_completions".to_string(),
            api_style: ApiStyle::Openai,
            base_weight: 1.0,
            region: None,
            max_qps: None,
            meta_hash: meta_hash.to_string(),
            disabled: false,
        }
    }

    #[test]
    fn missing_upstream_is_an_error() {
        let model = LogicalModel {
            id: "gpt-test".to_string(),
            display_name: "Test".to_string(),
            capabilities: vec![],
            upstreams: vec![physical("p1", "m1", "h1")],
            enabled: true,
        };
        let index = HashMap::new();
        let issues = validate_logical_model_consistency(&model, &index);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, ConsistencyLevel::Error);
        assert_eq!(issues[0].code, "missing_provider_model");
        assert!(!is_logical_model_consistent(&issues));
    }

    #[test]
    fn conflicting_meta_hash_is_an_error() {
        let model = LogicalModel {
            id: "gpt-test".to_string(),
            display_name: "Test".to_string(),
            capabilities: vec![],
            upstreams: vec![physical("p1", "m1", "h1"), physical("p2", "m1", "h2")],
            enabled: true,
        };
        let mut index = HashMap::new();
        index.insert(("p1".to_string(), "m1".to_string()), provider_model("p1", "m1", "h1", Some("gpt")));
        index.insert(("p2".to_string(), "m1".to_string()), provider_model("p2", "m1", "h2", Some("gpt")));
        let issues = validate_logical_model_consistency(&model, &index);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, "meta_hash_mismatch");
        assert!(!is_logical_model_consistent(&issues));
    }

    #[test]
    fn family_mismatch_is_a_warning_and_does_not_block() {
        let model = LogicalModel {
            id: "gpt-test".to_string(),
            display_name: "Test".to_string(),
            capabilities: vec![],
            upstreams: vec![physical("p1", "m1", "h1"), physical("p2", "m1", "h1")],
            enabled: true,
        };
        let mut index = HashMap::new();
        index.insert(("p1".to_string(), "m1".to_string()), provider_model("p1", "m1", "h1", Some("gpt-4")));
        index.insert(("p2".to_string(), "m1".to_string()), provider_model("p2", "m1", "h1", Some("gpt-3.5")));
        let issues = validate_logical_model_consistency(&model, &index);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].level, ConsistencyLevel::Warning);
        assert_eq!(issues[0].code, "family_mismatch");
        assert!(is_logical_model_consistent(&issues));
    }

    #[test]
    fn fully_consistent_model_has_no_issues() {
        let model = LogicalModel {
            id: "gpt-test".to_string(),
            display_name: "Test".to_string(),
            capabilities: vec![],
            upstreams: vec![physical("p1", "m1", "h1")],
            enabled: true,
        };
        let mut index = HashMap::new();
        index.insert(("p1".to_string(), "m1".to_string()), provider_model("p1", "m1", "h1", Some("gpt")));
        let issues = validate_logical_model_consistency(&model, &index);
        assert!(issues.is_empty());
        assert!(is_logical_model_consistent(&issues));
    }

    #[tokio::test]
    async fn synthesize_rejects_conflicting_meta_hash_end_to_end() {
        let store = InMemoryStore::new();
        store.seed_provider_model(provider_model("p1", "drift-model", "hash-a", Some("gpt")));
        store.seed_provider_model(provider_model("p2", "drift-model", "hash-b", Some("gpt")));
        let resolver = LogicalModelResolver::new(store, InMemoryKv::new());

        let err = resolver
            .resolve("drift-model", ApiStyle::Openai, &["p1".to_string(), "p2".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ModelDisabled));
    }
}
