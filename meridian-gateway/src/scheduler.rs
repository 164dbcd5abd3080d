//! Scheduler (C6). Scores candidates, applies stickiness,
//! and produces the ordered failover list C8 iterates over: weighted
//! selection over a dynamic-weight/health/metrics-aware score.

use crate::domain::{Candidate, HealthState, Session as SessionRecord};
use rand::distributions::{Distribution, WeightedIndex};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerStrategy {
    pub alpha_latency: f64,
    pub beta_error: f64,
    pub gamma_cost: f64,
    pub delta_status_penalty: f64,
    pub min_score: f64,
    pub enable_stickiness: bool,
}

impl Default for SchedulerStrategy {
    fn default() -> Self {
        Self {
            alpha_latency: 1.0,
            beta_error: 1.0,
            gamma_cost: 0.0,
            delta_status_penalty: 1.0,
            min_score: 0.0,
            enable_stickiness: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: f64,
}

pub struct SchedulingResult {
    pub selected: Candidate,
    /// Permutation of the filtered candidate set, `selected` first
    /// (testable property 4).
    pub ordered: Vec<Candidate>,
}

fn score_one(candidate: &Candidate, strategy: &SchedulerStrategy) -> f64 {
    let base = candidate
        .dynamic_weight
        .unwrap_or(candidate.physical.base_weight);

    let norm_lat = candidate
        .metrics
        .as_ref()
        .map(|m| (m.latency_p95_ms / 4000.0).clamp(0.0, 1.0))
        .unwrap_or(0.5);

    let err = candidate
        .metrics
        .as_ref()
        .map(|m| m.counters.error_rate())
        .unwrap_or(0.0);

    let cost = 0.0; // reserved for future cost-based scoring

    let penalty = match candidate.health {
        HealthState::Down => 1.0,
        HealthState::Degraded => 0.5,
        HealthState::Healthy | HealthState::Unknown => 0.0,
    };

    base - strategy.alpha_latency * norm_lat
        - strategy.beta_error * err
        - strategy.gamma_cost * cost
        - strategy.delta_status_penalty * penalty
}

/// . `candidates` is the ACL/capability-filtered set for this request;
/// callers are responsible for invariant 5 (ACL ∩ allowlist ∩ upstreams)
/// before reaching the scheduler.
pub fn choose(
    candidates: Vec<Candidate>,
    strategy: &SchedulerStrategy,
    sticky: Option<&SessionRecord>,
) -> Option<SchedulingResult> {
    if candidates.is_empty() {
        return None;
    }

    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .map(|c| {
            let score = score_one(&c, strategy);
            ScoredCandidate { candidate: c, score }
        })
        .filter(|sc| sc.score >= strategy.min_score)
        .collect();

    if scored.is_empty() {
        return None;
    }

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    // Stickiness: advisory only (invariant 6) — if the sticky pair survived
    // filtering, it wins outright regardless of score.
    let sticky_index = if strategy.enable_stickiness {
        sticky.and_then(|s| {
            scored
                .iter()
                .position(|sc| sc.candidate.provider.id == s.provider_id && sc.candidate.physical.model_id == s.model_id)
        })
    } else {
        None
    };

    let selected_index = match sticky_index {
        Some(idx) => idx,
        None => {
            let weights: Vec<f64> = scored.iter().map(|sc| sc.score.max(0.0)).collect();
            let total: f64 = weights.iter().sum();
            if total <= 0.0 {
                0
            } else {
                WeightedIndex::new(&weights)
                    .map(|dist| dist.sample(&mut rand::thread_rng()))
                    .unwrap_or(0)
            }
        }
    };

    let selected = scored.remove(selected_index);
    let mut ordered = vec![selected.candidate.clone()];
    ordered.extend(scored.into_iter().map(|sc| sc.candidate));

    Some(SchedulingResult {
        selected: selected.candidate,
        ordered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ApiStyle, PhysicalModel, ProviderConfig, Transport, Visibility};

    fn candidate(provider_id: &str, base_weight: f64, health: HealthState) -> Candidate {
        Candidate {
            provider: ProviderConfig {
                id: provider_id.to_string(),
                name: provider_id.to_string(),
                base_url: "https://x".to_string(),
                transport: Transport::Http,
                sdk_vendor: None,
                models_path: "/models".to_string(),
                messages_path: "/v1/messages".to_string(),
                chat_completions_path: "/v1/chat/completions".to_string(),
                responses_path: "/v1/responses".to_string(),
                supported_styles: vec![ApiStyle::Openai],
                retryable_status_codes: vec![],
                custom_headers: Default::default(),
                region: None,
                cost_per_1k_input: 0.0,
                cost_per_1k_output: 0.0,
                max_qps: None,
                keys: vec![],
                static_models: None,
                visibility: Visibility::Public,
                owner: None,
                shared_users: vec![],
                enabled: true,
                billing_factor: 1.0,
            },
            physical: PhysicalModel {
                provider_id: provider_id.to_string(),
                model_id: "m1".to_string(),
                endpoint: "/v1/chat/completions".to_string(),
                api_style: ApiStyle::Openai,
                base_weight,
                region: None,
                max_qps: None,
                meta_hash: "h".to_string(),
                disabled: false,
            },
            health,
            dynamic_weight: None,
            metrics: None,
        }
    }

    #[test]
    fn drops_below_min_score() {
        let strategy = SchedulerStrategy { min_score: 0.5, ..Default::default() };
        let candidates = vec![candidate("down", 0.2, HealthState::Down)];
        let result = choose(candidates, &strategy, None);
        assert!(result.is_none());
    }

    #[test]
    fn selected_is_first_in_ordered_permutation() {
        let strategy = SchedulerStrategy::default();
        let candidates = vec![
            candidate("a", 1.0, HealthState::Healthy),
            candidate("b", 5.0, HealthState::Healthy),
        ];
        let result = choose(candidates, &strategy, None).unwrap();
        assert_eq!(result.ordered[0].provider.id, result.selected.provider.id);
        assert_eq!(result.ordered.len(), 2);
    }

    #[test]
    fn sticky_session_wins_regardless_of_score() {
        let strategy = SchedulerStrategy::default();
        let candidates = vec![
            candidate("low", 0.1, HealthState::Healthy),
            candidate("high", 10.0, HealthState::Healthy),
        ];
        let sticky = SessionRecord {
            conversation_id: "c1".to_string(),
            logical_model: "gpt-4".to_string(),
            provider_id: "low".to_string(),
            model_id: "m1".to_string(),
            created_at: chrono::Utc::now(),
            last_accessed: chrono::Utc::now(),
            message_count: 1,
        };
        let result = choose(candidates, &strategy, Some(&sticky)).unwrap();
        assert_eq!(result.selected.provider.id, "low");
    }
}
