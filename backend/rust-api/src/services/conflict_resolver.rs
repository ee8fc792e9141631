use super::persistence_gateway::PersistenceGateway;
use crate::error::SyncError;
use crate::metrics::SYNC_CONFLICTS_TOTAL;
use crate::models::{AnswerMap, AttemptState, ConflictStrategy, Resolution, SaveOutcome, SyncConflict};

/// A question whose local value diverged from the stored one.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub question_id: String,
    pub local_value: serde_json::Value,
    pub server_value: serde_json::Value,
}

/// Answers to write after applying a strategy, plus the report for callers.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub answers: AnswerMap,
    pub conflicts: Vec<SyncConflict>,
}

#[derive(Debug, Clone)]
pub struct ResolvedSave {
    pub version: i64,
    pub conflicts: Vec<SyncConflict>,
    /// Entries actually written (answers plus scratch).
    pub applied: usize,
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Per-question divergence between `local` and `server`.
    ///
    /// Only questions the server already has a value for can conflict, and
    /// only when the versions differ: a single save commits per version.
    pub fn detect(local_version: i64, local: &AnswerMap, server: &AttemptState) -> Vec<Conflict> {
        if local_version == server.version {
            return Vec::new();
        }

        let mut conflicts: Vec<Conflict> = local
            .iter()
            .filter_map(|(question_id, local_value)| {
                let server_value = server.answers.get(question_id)?;
                (server_value != local_value).then(|| Conflict {
                    question_id: question_id.clone(),
                    local_value: local_value.clone(),
                    server_value: server_value.clone(),
                })
            })
            .collect();
        conflicts.sort_by(|a, b| a.question_id.cmp(&b.question_id));
        conflicts
    }

    /// Applies `strategy` to the local write set.
    ///
    /// Saves only ever patch the question ids they name, so `merge` and
    /// `local` produce the same write and server values for untouched ids
    /// are kept either way. `server` drops local values for conflicting ids.
    pub fn resolve(strategy: ConflictStrategy, local: &AnswerMap, conflicts: &[Conflict]) -> Resolved {
        let resolution = match strategy {
            ConflictStrategy::Merge | ConflictStrategy::Local => Resolution::KeptLocal,
            ConflictStrategy::Server => Resolution::KeptServer,
        };

        let mut answers = local.clone();
        if resolution == Resolution::KeptServer {
            for conflict in conflicts {
                answers.remove(&conflict.question_id);
            }
        }

        Resolved {
            answers,
            conflicts: conflicts
                .iter()
                .map(|c| SyncConflict {
                    question_id: c.question_id.clone(),
                    local_value: c.local_value.clone(),
                    server_value: c.server_value.clone(),
                    resolution,
                })
                .collect(),
        }
    }

    /// Resolves against `latest` and retries the save exactly once against
    /// its version. A second conflict is returned as
    /// [`SyncError::UnresolvedConflict`] instead of looping.
    #[allow(clippy::too_many_arguments)]
    pub async fn resolve_and_retry(
        gateway: &PersistenceGateway,
        attempt_id: &str,
        local_version: i64,
        answers: &AnswerMap,
        auto_save_data: &AnswerMap,
        latest: &AttemptState,
        strategy: ConflictStrategy,
        max_attempts: usize,
    ) -> Result<ResolvedSave, SyncError> {
        let detected = Self::detect(local_version, answers, latest);
        let resolved = Self::resolve(strategy, answers, &detected);

        if !resolved.conflicts.is_empty() {
            SYNC_CONFLICTS_TOTAL
                .with_label_values(&[strategy.as_str()])
                .inc_by(resolved.conflicts.len() as u64);
            tracing::warn!(
                "Resolved {} conflicts on attempt {} ({} strategy, v{} vs v{})",
                resolved.conflicts.len(),
                attempt_id,
                strategy.as_str(),
                local_version,
                latest.version
            );
        }

        if resolved.answers.is_empty() && auto_save_data.is_empty() {
            return Ok(ResolvedSave {
                version: latest.version,
                conflicts: resolved.conflicts,
                applied: 0,
            });
        }

        let applied = resolved.answers.len() + auto_save_data.len();
        match gateway
            .save(
                attempt_id,
                resolved.answers,
                auto_save_data.clone(),
                latest.version,
                max_attempts,
            )
            .await?
        {
            SaveOutcome::Saved { new_version } => Ok(ResolvedSave {
                version: new_version,
                conflicts: resolved.conflicts,
                applied,
            }),
            SaveOutcome::Conflict { latest } => {
                tracing::warn!(
                    "Retry after resolution conflicted again on attempt {} (store at v{})",
                    attempt_id,
                    latest.version
                );
                Err(SyncError::UnresolvedConflict {
                    version: latest.version,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::answers;
    use serde_json::json;

    fn server_state(version: i64, pairs: &[(&str, serde_json::Value)]) -> AttemptState {
        let mut state = AttemptState::new("a1", "exam", "student");
        state.version = version;
        state.answers = answers(pairs);
        state
    }

    #[test]
    fn equal_versions_never_conflict() {
        let server = server_state(3, &[("q1", json!("A"))]);
        let local = answers(&[("q1", json!("B"))]);
        assert!(ConflictResolver::detect(3, &local, &server).is_empty());
    }

    #[test]
    fn detects_only_diverging_known_values() {
        let server = server_state(2, &[("q1", json!("A")), ("q2", json!("B"))]);
        let local = answers(&[("q1", json!("C")), ("q2", json!("B")), ("q3", json!("D"))]);

        let conflicts = ConflictResolver::detect(1, &local, &server);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].question_id, "q1");
        assert_eq!(conflicts[0].server_value, json!("A"));
        assert_eq!(conflicts[0].local_value, json!("C"));
    }

    #[test]
    fn merge_is_scoped_to_touched_questions() {
        let server = server_state(2, &[("q1", json!("A")), ("q2", json!("B"))]);
        let local = answers(&[("q1", json!("C"))]);

        let conflicts = ConflictResolver::detect(1, &local, &server);
        let resolved = ConflictResolver::resolve(ConflictStrategy::Merge, &local, &conflicts);

        // q2 is untouched, so the patch leaves the stored value alone
        assert_eq!(resolved.conflicts[0].resolution, Resolution::KeptLocal);
        assert_eq!(resolved.answers, answers(&[("q1", json!("C"))]));
    }

    #[test]
    fn server_strategy_drops_conflicting_local_values() {
        let server = server_state(2, &[("q1", json!("A"))]);
        let local = answers(&[("q1", json!("C")), ("q5", json!("E"))]);

        let conflicts = ConflictResolver::detect(1, &local, &server);
        let resolved = ConflictResolver::resolve(ConflictStrategy::Server, &local, &conflicts);

        assert_eq!(resolved.answers, answers(&[("q5", json!("E"))]));
        assert_eq!(resolved.conflicts[0].resolution, Resolution::KeptServer);
        assert_eq!(resolved.conflicts[0].server_value, json!("A"));
    }

    #[test]
    fn local_strategy_keeps_every_local_value() {
        let server = server_state(4, &[("q1", json!("A")), ("q2", json!("B"))]);
        let local = answers(&[("q1", json!("X")), ("q2", json!("Y"))]);

        let conflicts = ConflictResolver::detect(2, &local, &server);
        let resolved = ConflictResolver::resolve(ConflictStrategy::Local, &local, &conflicts);

        assert_eq!(resolved.answers, local);
        assert_eq!(resolved.conflicts.len(), 2);
        assert!(resolved
            .conflicts
            .iter()
            .all(|c| c.resolution == Resolution::KeptLocal));
    }
}
