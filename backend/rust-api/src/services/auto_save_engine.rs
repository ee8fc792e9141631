use std::collections::HashSet;
use validator::Validate;

use super::conflict_resolver::ConflictResolver;
use super::persistence_gateway::PersistenceGateway;
use crate::error::{SyncError, SyncFailure};
use crate::metrics::INVALID_CHANGES_TOTAL;
use crate::models::{
    AnswerMap, AutoSaveConfig, ChangeEvent, ChangeKind, Resolution, SaveOutcome, SyncConflict,
    SyncResult,
};

/// One ordered slice of change events folded into write maps.
#[derive(Debug, Default)]
pub struct Batch {
    pub answers: AnswerMap,
    pub auto_save_data: AnswerMap,
    /// Valid events in arrival order, kept for requeueing.
    pub events: Vec<ChangeEvent>,
    pub rejected: usize,
}

impl Batch {
    /// Validates and partitions `events`. Later events win per question id;
    /// invalid events are dropped with a warning.
    pub fn from_events(attempt_id: &str, events: &[ChangeEvent]) -> Self {
        let mut batch = Batch::default();
        for event in events {
            if let Err(e) = event.validate() {
                INVALID_CHANGES_TOTAL
                    .with_label_values(&[kind_label(event.kind)])
                    .inc();
                tracing::warn!(
                    "Dropping invalid change for attempt {} (question {:?}): {}",
                    attempt_id,
                    event.question_id,
                    e
                );
                batch.rejected += 1;
                continue;
            }

            match event.kind {
                ChangeKind::Answer => {
                    batch
                        .answers
                        .insert(event.question_id.clone(), event.value.clone());
                }
                ChangeKind::AutoSave => {
                    batch
                        .auto_save_data
                        .insert(event.question_id.clone(), event.value.clone());
                }
                ChangeKind::Navigation | ChangeKind::Activity => {}
            }
            batch.events.push(event.clone());
        }
        batch
    }

    pub fn has_writes(&self) -> bool {
        !self.answers.is_empty() || !self.auto_save_data.is_empty()
    }

    pub fn write_count(&self) -> usize {
        self.answers.len() + self.auto_save_data.len()
    }

    /// Question ids of events that are logged but never persisted.
    pub fn ephemeral_question_ids(&self) -> impl Iterator<Item = &str> {
        self.events
            .iter()
            .filter(|e| !e.kind.is_persisted())
            .map(|e| e.question_id.as_str())
    }
}

fn kind_label(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Answer => "answer",
        ChangeKind::AutoSave => "auto_save",
        ChangeKind::Navigation => "navigation",
        ChangeKind::Activity => "activity",
    }
}

/// Outcome of one engine run, with the bookkeeping callers need.
#[derive(Debug)]
pub struct BatchRun {
    pub result: SyncResult,
    /// Events not yet persisted after a resumable failure, in order.
    pub unsent: Vec<ChangeEvent>,
    pub saved_question_ids: Vec<String>,
    pub ephemeral_question_ids: Vec<String>,
    pub batches_saved: usize,
}

impl BatchRun {
    fn new(version: i64) -> Self {
        Self {
            result: SyncResult::succeeded(version),
            unsent: Vec::new(),
            saved_question_ids: Vec::new(),
            ephemeral_question_ids: Vec::new(),
            batches_saved: 0,
        }
    }

    fn fail(&mut self, error: &SyncError) {
        self.result.success = false;
        self.result.error = Some(SyncFailure::from(error));
    }

    /// Folds a later run into this one; the later version wins.
    pub fn absorb(&mut self, other: BatchRun) {
        self.result.version = other.result.version;
        self.result.applied_changes += other.result.applied_changes;
        self.result.rejected_changes += other.result.rejected_changes;
        self.result.conflicts.extend(other.result.conflicts);
        if !other.result.success {
            self.result.success = false;
            self.result.error = other.result.error;
        }
        self.unsent = other.unsent;
        self.saved_question_ids.extend(other.saved_question_ids);
        self.ephemeral_question_ids
            .extend(other.ephemeral_question_ids);
        self.batches_saved += other.batches_saved;
    }

    pub fn conflicts(&self) -> &[SyncConflict] {
        &self.result.conflicts
    }
}

/// Question ids of `batch` that reached the store, i.e. all of them except
/// those the server strategy dropped.
fn written_question_ids(batch: &Batch, conflicts: &[SyncConflict]) -> Vec<String> {
    let dropped: HashSet<&str> = conflicts
        .iter()
        .filter(|c| c.resolution == Resolution::KeptServer)
        .map(|c| c.question_id.as_str())
        .collect();
    batch
        .answers
        .keys()
        .chain(batch.auto_save_data.keys())
        .filter(|q| !dropped.contains(q.as_str()))
        .cloned()
        .collect()
}

/// Whether unsent events are worth putting back for a later flush.
pub fn is_resumable(error: &SyncError) -> bool {
    matches!(
        error,
        SyncError::Transient(_) | SyncError::CircuitOpen { .. } | SyncError::UnresolvedConflict { .. }
    )
}

/// Drives batched saves through the gateway.
///
/// Write pressure on the store scales with the number of batches, not the
/// number of events.
#[derive(Clone)]
pub struct AutoSaveEngine {
    gateway: PersistenceGateway,
}

impl AutoSaveEngine {
    pub fn new(gateway: PersistenceGateway) -> Self {
        Self { gateway }
    }

    /// Splits `changes` into ordered batches of `config.batch_size` and saves
    /// them one after another. The first batch expects `expected_version`
    /// (the version the writer last saw), or the attempt's current version
    /// when the writer has none; each later batch expects the version the
    /// previous one produced. A failed batch stops the run; earlier batches
    /// stay persisted and `result.version` reports where to resume.
    pub async fn run(
        &self,
        attempt_id: &str,
        changes: Vec<ChangeEvent>,
        expected_version: Option<i64>,
        config: AutoSaveConfig,
    ) -> BatchRun {
        let state = match self.gateway.get_state(attempt_id).await {
            Ok(state) => state,
            Err(e) => {
                let mut run = BatchRun::new(expected_version.unwrap_or_default());
                run.fail(&e);
                if is_resumable(&e) {
                    run.unsent = changes;
                }
                return run;
            }
        };
        if !state.is_in_progress() {
            let mut run = BatchRun::new(state.version);
            run.fail(&SyncError::AttemptClosed(attempt_id.to_string()));
            return run;
        }

        let mut version = expected_version.unwrap_or(state.version);
        let mut run = BatchRun::new(version);
        let batch_size = config.batch_size.max(1);
        let max_attempts = config.max_retries.max(1);
        let mut chunks = changes.chunks(batch_size).enumerate();

        while let Some((index, chunk)) = chunks.next() {
            let batch = Batch::from_events(attempt_id, chunk);
            run.result.rejected_changes += batch.rejected;
            run.ephemeral_question_ids
                .extend(batch.ephemeral_question_ids().map(str::to_string));
            if !batch.has_writes() {
                continue;
            }

            match self.save_batch(attempt_id, &batch, version, config, max_attempts).await {
                Ok((new_version, applied, conflicts)) => {
                    tracing::debug!(
                        "Batch {} for attempt {} saved: v{} -> v{}",
                        index,
                        attempt_id,
                        version,
                        new_version
                    );
                    if applied > 0 {
                        run.batches_saved += 1;
                        run.saved_question_ids
                            .extend(written_question_ids(&batch, &conflicts));
                    }
                    version = new_version;
                    run.result.version = new_version;
                    run.result.applied_changes += applied;
                    run.result.conflicts.extend(conflicts);
                }
                Err(e) => {
                    tracing::warn!(
                        "Auto-save for attempt {} stopped at batch {} (v{}): {}",
                        attempt_id,
                        index,
                        version,
                        e
                    );
                    run.fail(&e);
                    if let SyncError::UnresolvedConflict { .. } = e {
                        self.gateway.invalidate(attempt_id).await;
                    }
                    if is_resumable(&e) {
                        run.unsent = batch.events;
                        run.unsent
                            .extend(chunks.by_ref().flat_map(|(_, rest)| rest.iter().cloned()));
                    }
                    break;
                }
            }
        }

        run
    }

    async fn save_batch(
        &self,
        attempt_id: &str,
        batch: &Batch,
        version: i64,
        config: AutoSaveConfig,
        max_attempts: usize,
    ) -> Result<(i64, usize, Vec<SyncConflict>), SyncError> {
        let outcome = self
            .gateway
            .save(
                attempt_id,
                batch.answers.clone(),
                batch.auto_save_data.clone(),
                version,
                max_attempts,
            )
            .await?;

        match outcome {
            SaveOutcome::Saved { new_version } => Ok((new_version, batch.write_count(), Vec::new())),
            SaveOutcome::Conflict { latest } => {
                if !latest.is_in_progress() {
                    return Err(SyncError::AttemptClosed(attempt_id.to_string()));
                }
                let resolved = ConflictResolver::resolve_and_retry(
                    &self.gateway,
                    attempt_id,
                    version,
                    &batch.answers,
                    &batch.auto_save_data,
                    &latest,
                    config.conflict_strategy,
                    max_attempts,
                )
                .await?;
                Ok((resolved.version, resolved.applied, resolved.conflicts))
            }
        }
    }
}
