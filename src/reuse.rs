//! Reuse Gate (C8): given a goal, looks up similar stored procedural
//! workflows and returns one to skip planning entirely when similarity
//! clears the configured threshold.
//!
//! Every failure path here (embedding failure, storage error, no surviving
//! steps after registry filtering) is a soft failure: the caller falls back
//! to planning via C6, it never surfaces as a hard error.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::embedding::Embedder;
use crate::model::{Plan, PlanStep};
use crate::storage::SqliteStorage;
use crate::subagents::SubAgentRegistry;

/// A successful reuse: the matched workflow's id and its plan, filtered to
/// steps whose agent is still present in the current registry.
#[derive(Debug, Clone)]
pub struct Reused {
    /// Identifier of the workflow that was matched, for `usage_count` bump
    /// and the `reused.json` artifact.
    pub workflow_id: String,
    /// The rehydrated plan, with unknown-agent steps already dropped.
    pub plan: Plan,
}

/// Attempts to find a reusable workflow for `goal`. Returns `None` whenever
/// reuse does not apply — embedding failure, no candidate, below-threshold
/// similarity, storage error, or an empty plan after filtering.
pub fn find_reuse(
    embedder: &dyn Embedder,
    storage: &Arc<Mutex<SqliteStorage>>,
    registry: &SubAgentRegistry,
    goal: &str,
    top_k: usize,
    threshold: f32,
) -> Option<Reused> {
    let goal_embedding = embedder.embed(goal)?;

    let matches = {
        let storage = match storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        storage.procedural_top_k_similar(&goal_embedding, top_k)
    };
    let matches = match matches {
        Ok(matches) => matches,
        Err(error) => {
            debug!(%error, "reuse gate: storage lookup failed, falling back to planning");
            return None;
        }
    };

    let best = matches.into_iter().next()?;
    if best.similarity < threshold {
        debug!(similarity = best.similarity, threshold, "reuse gate: below threshold");
        return None;
    }

    let filtered_plan: Plan = best
        .workflow
        .plan
        .into_iter()
        .filter(|step: &PlanStep| registry.contains(&step.agent_name))
        .collect();

    if filtered_plan.is_empty() {
        debug!(
            workflow_id = %best.workflow.workflow_id,
            "reuse gate: matched workflow has no steps left after registry filtering"
        );
        return None;
    }

    debug!(
        workflow_id = %best.workflow.workflow_id,
        similarity = best.similarity,
        "reuse gate: hit"
    );
    Some(Reused {
        workflow_id: best.workflow.workflow_id,
        plan: filtered_plan,
    })
}
