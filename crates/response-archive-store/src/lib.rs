#![allow(clippy::missing_errors_doc)]

//! In-memory archive of response runs, their event journals, safety records
//! and tool delegations.
//!
//! Runs live in a table keyed by [`RunId`]; each entry carries its own mutex
//! so that all writes to one run are serialized while different runs proceed
//! in parallel. Every value handed out is an owned clone taken under that
//! run's lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use response_archive_core::{
    advance_timestamp, apply_rollback_to_timeline, now_utc, ArchiveConfig, ArchiveError,
    DelegationInput, DelegationRecord, DelegationUpdate, EventInput, EventRecord,
    ModeratorNote, ModeratorNoteInput, ResponseRequest, ResponseResult, RollbackOptions, Run,
    RunId, SafetySnapshot, SafetyUpdate, StartRunInput, StatusUpdate, TimelineSnapshot,
    ARCHIVE_CONTRACT_VERSION,
};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

/// Source of "current time" for defaults and `updated_at` bumps.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStatus {
    pub contract_version: String,
    pub runs: usize,
    pub events: usize,
    pub delegations: usize,
    pub moderator_notes: usize,
}

type RunTable = BTreeMap<RunId, Arc<Mutex<RunEntry>>>;

struct RunEntry {
    run: Run,
    events: BTreeMap<u64, EventRecord>,
    // Set under the entry lock when the run leaves the table, so callers that
    // fetched the entry just before removal observe it as missing.
    removed: bool,
}

impl RunEntry {
    fn touch(&mut self, now: OffsetDateTime) {
        self.run.updated_at = advance_timestamp(self.run.updated_at, now);
    }

    fn timeline(&self, through: Option<u64>) -> TimelineSnapshot {
        let events = match through {
            Some(limit) => self
                .events
                .range(..=limit)
                .map(|(_, event)| event.clone())
                .collect(),
            None => self.events.values().cloned().collect(),
        };
        TimelineSnapshot {
            run: self.run.clone(),
            events,
        }
    }
}

pub struct RunArchive {
    config: ArchiveConfig,
    clock: Clock,
    runs: RwLock<RunTable>,
}

impl Default for RunArchive {
    fn default() -> Self {
        Self {
            config: ArchiveConfig::default(),
            clock: Arc::new(now_utc),
            runs: RwLock::new(BTreeMap::new()),
        }
    }
}

impl RunArchive {
    pub fn new(config: ArchiveConfig) -> Result<Self, ArchiveError> {
        Self::with_clock(config, now_utc)
    }

    pub fn with_clock(
        config: ArchiveConfig,
        clock: impl Fn() -> OffsetDateTime + Send + Sync + 'static,
    ) -> Result<Self, ArchiveError> {
        config.validate()?;
        Ok(Self {
            config,
            clock: Arc::new(clock),
            runs: RwLock::new(BTreeMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn start_run(&self, input: StartRunInput) -> Result<Run, ArchiveError> {
        if input.run_id.as_str().trim().is_empty() {
            return Err(ArchiveError::Validation(
                "run_id MUST be non-empty".to_string(),
            ));
        }
        let request = ResponseRequest::from_json(&input.request)?;
        ensure_unique_call_ids(&input.delegations)?;

        let now = self.now();
        let run = Run {
            run_id: input.run_id,
            request,
            status: self.config.initial_status.clone(),
            result: None,
            conversation_id: input.conversation_id,
            metadata: input.metadata,
            trace_id: input.trace_id,
            created_at: now,
            updated_at: now,
            safety: input.safety.unwrap_or_default(),
            delegations: input.delegations,
        };

        let mut table = self.table_write()?;
        if table.contains_key(&run.run_id) {
            return Err(ArchiveError::DuplicateRun {
                run_id: run.run_id,
            });
        }
        table.insert(
            run.run_id.clone(),
            Arc::new(Mutex::new(RunEntry {
                run: run.clone(),
                events: BTreeMap::new(),
                removed: false,
            })),
        );
        debug!(run_id = %run.run_id, model = %run.request.model, "run started");

        Ok(run)
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<Option<Run>, ArchiveError> {
        self.read_run(run_id, |entry| entry.run.clone())
    }

    pub fn update_status(&self, update: StatusUpdate) -> Result<Run, ArchiveError> {
        let now = self.now();
        self.with_run(&update.run_id, |entry| {
            let result = update
                .result
                .as_ref()
                .map(ResponseResult::from_json)
                .transpose()?;

            entry.run.status.clone_from(&update.status);
            if result.is_some() {
                entry.run.result = result;
            }
            entry.touch(now);
            debug!(run_id = %update.run_id, status = %update.status, "run status updated");
            Ok(entry.run.clone())
        })
    }

    /// Lists runs newest first; ties on `created_at` are broken by `run_id`.
    pub fn list_runs(&self) -> Result<Vec<Run>, ArchiveError> {
        let entries: Vec<_> = self.table_read()?.values().cloned().collect();
        let mut runs = Vec::with_capacity(entries.len());
        for entry in entries {
            let guard = lock_entry(&entry)?;
            if !guard.removed {
                runs.push(guard.run.clone());
            }
        }
        runs.sort_by(|lhs, rhs| {
            rhs.created_at
                .cmp(&lhs.created_at)
                .then_with(|| lhs.run_id.cmp(&rhs.run_id))
        });
        Ok(runs)
    }

    /// Removes a run with its journal, safety data and delegations. Returns
    /// `false` when the run was already absent.
    #[instrument(skip(self, run_id), fields(run_id = %run_id))]
    pub fn delete_run(&self, run_id: &RunId) -> Result<bool, ArchiveError> {
        let mut table = self.table_write()?;
        let Some(entry) = table.remove(run_id) else {
            return Ok(false);
        };
        lock_entry(&entry)?.removed = true;
        info!("run deleted");
        Ok(true)
    }

    /// Removes every run whose `updated_at` is strictly before `cutoff`.
    #[instrument(skip(self))]
    pub fn prune_older_than(&self, cutoff: OffsetDateTime) -> Result<usize, ArchiveError> {
        let mut table = self.table_write()?;
        let mut expired = Vec::new();
        for (run_id, entry) in table.iter() {
            if lock_entry(entry)?.run.updated_at < cutoff {
                expired.push(run_id.clone());
            }
        }

        for run_id in &expired {
            if let Some(entry) = table.remove(run_id) {
                lock_entry(&entry)?.removed = true;
            }
        }

        if !expired.is_empty() {
            info!(pruned = expired.len(), "pruned runs older than cutoff");
        }
        Ok(expired.len())
    }

    /// Applies the configured retention window, if any.
    pub fn enforce_retention(&self) -> Result<usize, ArchiveError> {
        match self.config.retention_cutoff(self.now()) {
            Some(cutoff) => self.prune_older_than(cutoff),
            None => Ok(0),
        }
    }

    pub fn status(&self) -> Result<ArchiveStatus, ArchiveError> {
        let entries: Vec<_> = self.table_read()?.values().cloned().collect();
        let mut status = ArchiveStatus {
            contract_version: ARCHIVE_CONTRACT_VERSION.to_string(),
            runs: 0,
            events: 0,
            delegations: 0,
            moderator_notes: 0,
        };
        for entry in entries {
            let guard = lock_entry(&entry)?;
            if guard.removed {
                continue;
            }
            status.runs += 1;
            status.events += guard.events.len();
            status.delegations += guard.run.delegations.len();
            status.moderator_notes += guard.run.safety.moderator_notes.len();
        }
        Ok(status)
    }

    pub fn record_event(
        &self,
        run_id: &RunId,
        input: EventInput,
    ) -> Result<EventRecord, ArchiveError> {
        input.validate()?;
        let now = self.now();
        self.with_run(run_id, |entry| {
            let sequence = match input.sequence {
                Some(sequence) if entry.events.contains_key(&sequence) => {
                    return Err(ArchiveError::DuplicateSequence {
                        run_id: run_id.clone(),
                        sequence,
                    });
                }
                Some(sequence) => sequence,
                None => match entry.events.last_key_value() {
                    Some((last, _)) => last.checked_add(1).ok_or_else(|| {
                        ArchiveError::Validation(format!(
                            "sequence space exhausted for run {run_id}"
                        ))
                    })?,
                    None => 1,
                },
            };

            let event = EventRecord {
                run_id: run_id.clone(),
                sequence,
                event_type: input.event_type,
                payload: input.payload,
                occurred_at: input.occurred_at.unwrap_or(now),
            };
            entry.events.insert(sequence, event.clone());
            entry.touch(now);
            debug!(run_id = %run_id, sequence, event_type = %event.event_type, "event recorded");
            Ok(event)
        })
    }

    pub fn get_timeline(&self, run_id: &RunId) -> Result<Option<TimelineSnapshot>, ArchiveError> {
        self.read_run(run_id, |entry| entry.timeline(None))
    }

    /// Point-in-time view holding only events with `sequence <= through`.
    pub fn snapshot_at(
        &self,
        run_id: &RunId,
        through: u64,
    ) -> Result<Option<TimelineSnapshot>, ArchiveError> {
        self.read_run(run_id, |entry| entry.timeline(Some(through)))
    }

    pub fn update_safety(
        &self,
        run_id: &RunId,
        update: &SafetyUpdate,
    ) -> Result<SafetySnapshot, ArchiveError> {
        let now = self.now();
        self.with_run(run_id, |entry| {
            entry.run.safety = entry.run.safety.merged(update);
            entry.touch(now);
            debug!(
                run_id = %run_id,
                refusal_count = entry.run.safety.refusal_count,
                "safety snapshot updated"
            );
            Ok(entry.run.safety.clone())
        })
    }

    pub fn add_moderator_note(
        &self,
        run_id: &RunId,
        input: ModeratorNoteInput,
    ) -> Result<ModeratorNote, ArchiveError> {
        let now = self.now();
        self.with_run(run_id, |entry| {
            let note = input.into_note(now)?;
            entry.run.safety.moderator_notes.push(note.clone());
            entry.touch(now);
            debug!(
                run_id = %run_id,
                reviewer = %note.reviewer,
                disposition = note.disposition.as_str(),
                "moderator note added"
            );
            Ok(note)
        })
    }

    /// Upserts by `call_id`: an existing record is replaced wholesale.
    pub fn record_delegation(
        &self,
        run_id: &RunId,
        input: &DelegationInput,
    ) -> Result<DelegationRecord, ArchiveError> {
        let now = self.now();
        self.with_run(run_id, |entry| {
            let record = input.to_record(now)?;
            let delegations = &mut entry.run.delegations;
            match delegations
                .iter()
                .position(|existing| existing.call_id == record.call_id)
            {
                Some(index) => delegations[index] = record.clone(),
                None => delegations.push(record.clone()),
            }
            entry.touch(now);
            debug!(
                run_id = %run_id,
                call_id = %record.call_id,
                status = record.status.as_str(),
                "delegation recorded"
            );
            Ok(record)
        })
    }

    pub fn update_delegation(
        &self,
        run_id: &RunId,
        call_id: &str,
        update: &DelegationUpdate,
    ) -> Result<DelegationRecord, ArchiveError> {
        let now = self.now();
        self.with_run(run_id, |entry| {
            let Some(existing) = entry
                .run
                .delegations
                .iter_mut()
                .find(|existing| existing.call_id == call_id)
            else {
                return Err(ArchiveError::DelegationNotFound {
                    run_id: run_id.clone(),
                    call_id: call_id.to_string(),
                });
            };

            *existing = existing.merged(update, now);
            let record = existing.clone();
            entry.touch(now);
            debug!(
                run_id = %run_id,
                call_id,
                status = record.status.as_str(),
                "delegation updated"
            );
            Ok(record)
        })
    }

    /// Computes the rollback view for the stored run without committing it.
    pub fn preview_rollback(
        &self,
        run_id: &RunId,
        options: &RollbackOptions,
    ) -> Result<TimelineSnapshot, ArchiveError> {
        let now = self.now();
        self.with_run(run_id, |entry| {
            let events: Vec<EventRecord> = entry.events.values().cloned().collect();
            apply_rollback_to_timeline(&entry.run, &events, options, now)
        })
    }

    /// Replaces the stored run and journal with the rollback view. Discarded
    /// events are gone from this archive once this returns.
    #[instrument(skip(self, run_id, options), fields(run_id = %run_id))]
    pub fn rollback(
        &self,
        run_id: &RunId,
        options: &RollbackOptions,
    ) -> Result<TimelineSnapshot, ArchiveError> {
        if !options.has_filter() {
            warn!("rollback requested without sequence or tool_call_id; keeping all events");
        }

        let now = self.now();
        self.with_run(run_id, |entry| {
            let events: Vec<EventRecord> = entry.events.values().cloned().collect();
            let projected = apply_rollback_to_timeline(&entry.run, &events, options, now)?;
            let discarded = events.len() - projected.events.len();

            entry.run = projected.run;
            entry.events = projected
                .events
                .into_iter()
                .map(|event| (event.sequence, event))
                .collect();
            entry.touch(now);

            info!(
                discarded,
                kept = entry.events.len(),
                operator = options.operator.as_deref().unwrap_or_default(),
                "rollback committed"
            );
            Ok(entry.timeline(None))
        })
    }

    fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    fn table_read(&self) -> Result<RwLockReadGuard<'_, RunTable>, ArchiveError> {
        self.runs
            .read()
            .map_err(|_| ArchiveError::Internal("run table lock poisoned".to_string()))
    }

    fn table_write(&self) -> Result<RwLockWriteGuard<'_, RunTable>, ArchiveError> {
        self.runs
            .write()
            .map_err(|_| ArchiveError::Internal("run table lock poisoned".to_string()))
    }

    fn lookup(&self, run_id: &RunId) -> Result<Option<Arc<Mutex<RunEntry>>>, ArchiveError> {
        Ok(self.table_read()?.get(run_id).cloned())
    }

    fn read_run<T>(
        &self,
        run_id: &RunId,
        read: impl FnOnce(&RunEntry) -> T,
    ) -> Result<Option<T>, ArchiveError> {
        let Some(entry) = self.lookup(run_id)? else {
            return Ok(None);
        };
        let guard = lock_entry(&entry)?;
        if guard.removed {
            return Ok(None);
        }
        Ok(Some(read(&guard)))
    }

    /// Runs `mutate` inside the run's critical section. `mutate` must fail
    /// before touching `entry` if it fails at all.
    fn with_run<T>(
        &self,
        run_id: &RunId,
        mutate: impl FnOnce(&mut RunEntry) -> Result<T, ArchiveError>,
    ) -> Result<T, ArchiveError> {
        let not_found = || ArchiveError::RunNotFound {
            run_id: run_id.clone(),
        };
        let entry = self.lookup(run_id)?.ok_or_else(not_found)?;
        let mut guard = lock_entry(&entry)?;
        if guard.removed {
            return Err(not_found());
        }
        mutate(&mut guard)
    }
}

fn lock_entry(
    entry: &Mutex<RunEntry>,
) -> Result<std::sync::MutexGuard<'_, RunEntry>, ArchiveError> {
    entry
        .lock()
        .map_err(|_| ArchiveError::Internal("run entry lock poisoned".to_string()))
}

fn ensure_unique_call_ids(delegations: &[DelegationRecord]) -> Result<(), ArchiveError> {
    let mut seen = std::collections::BTreeSet::new();
    for delegation in delegations {
        if !seen.insert(delegation.call_id.as_str()) {
            return Err(ArchiveError::Validation(format!(
                "duplicate delegation call_id {} in initial delegations",
                delegation.call_id
            )));
        }
    }
    Ok(())
}
