//! Agent scoring and selection.

use std::collections::BTreeMap;

use foreman_core::{AgentRecord, AgentRegistry, AgentStatus};

/// Score one candidate agent for a task type.
///
/// `10 * capability_match + static_priority + availability_bonus`, where the
/// bonus is +5 for Available, -3 for Busy, 0 otherwise.
pub fn score(
    definition: &foreman_core::AgentDefinition,
    record: &AgentRecord,
    task_type: &str,
) -> i64 {
    let mut total = 0i64;
    if definition.has_capability(task_type) {
        total += 10;
    }
    total += definition.static_priority as i64;
    total += match record.status {
        AgentStatus::Available => 5,
        AgentStatus::Busy => -3,
        _ => 0,
    };
    total
}

/// Select the best agent for a task type.
///
/// A static route wins outright when the routed agent has a registered
/// record. Otherwise every registered candidate is scored; ties break
/// lexicographically on agent name, ascending, so selection is deterministic
/// regardless of iteration order.
pub fn select_best_agent(
    registry: &AgentRegistry,
    records: &BTreeMap<String, AgentRecord>,
    routes: &BTreeMap<String, String>,
    task_type: &str,
) -> Option<String> {
    if let Some(routed) = routes.get(task_type) {
        if let Some(canonical) = registry.canonical_name(routed) {
            if records.contains_key(canonical) {
                return Some(canonical.to_string());
            }
        }
    }

    let mut best: Option<(i64, &str)> = None;
    for definition in registry.definitions() {
        let Some(record) = records.get(&definition.name) else {
            continue;
        };
        let candidate_score = score(definition, record, task_type);
        let better = match best {
            None => true,
            Some((best_score, best_name)) => {
                candidate_score > best_score
                    || (candidate_score == best_score && definition.name.as_str() < best_name)
            }
        };
        if better {
            best = Some((candidate_score, &definition.name));
        }
    }

    best.map(|(_, name)| name.to_string())
}
