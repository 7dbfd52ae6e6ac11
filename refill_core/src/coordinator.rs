//! Scheduling coordinator.
//!
//! Runs the four user-facing operations (create, edit, refill toggle,
//! delete) against a [`PrescriptionStore`] and a [`NotificationDispatcher`]:
//!
//! 1. Validate and recompute depletion and reminder plan
//! 2. Persist prescription, depletion and plan as one record
//! 3. Cancel whatever was registered for the prescription before
//! 4. Register the live part of the new plan
//!
//! Work on one prescription is serialized by a per-prescription lock, so a
//! recompute-and-persist never interleaves with another for the same id.
//! The store's record lock extends this to other processes sharing the same
//! data. Different prescriptions proceed independently.
//!
//! Overdue entries follow the configured [`PastDuePolicy`] only when a plan
//! is freshly computed. Re-registering an existing plan (restore, reopen,
//! rename) leaves overdue entries untouched and registers only future ones.
//!
//! A failed store write aborts the operation before the dispatcher is
//! touched, leaving the previous schedule authoritative. Dispatcher failures
//! are logged and never fail the operation.

use crate::config::{DispatchConfig, PastDuePolicy};
use crate::dispatch::{DispatchError, NotificationDispatcher};
use crate::refill::{self, RefillEffect, RefillEvent};
use crate::store::PrescriptionStore;
use crate::{
    depletion, plan, Error, Prescription, PrescriptionDraft, PrescriptionEdit,
    PrescriptionRecord, Reminder, ReminderId, ReminderKind, ReminderPlan, Result,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Compute depletion and plan for a prescription
pub fn compute_record(prescription: Prescription) -> Result<PrescriptionRecord> {
    prescription.validate()?;
    let depletion = depletion::depletion_for(&prescription)?;
    let plan = plan::plan_for(&prescription, depletion)?;
    Ok(PrescriptionRecord {
        prescription,
        depletion,
        plan,
    })
}

/// The part of a plan that should go to the dispatcher at `now`
///
/// Entries in the future are always kept. Entries at or before `now` are
/// dropped under [`PastDuePolicy::Skip`]; under [`PastDuePolicy::FireNow`]
/// the latest of them is kept and moved to `now`.
pub fn live_reminders(plan: &ReminderPlan, now: DateTime<Utc>, policy: PastDuePolicy) -> Vec<Reminder> {
    let (past, future): (Vec<&Reminder>, Vec<&Reminder>) =
        plan.reminders.iter().partition(|r| r.fire_at <= now);

    let overdue = match policy {
        PastDuePolicy::Skip => None,
        PastDuePolicy::FireNow => past.last().map(|r| Reminder {
            fire_at: now,
            ..(*r).clone()
        }),
    };

    overdue
        .into_iter()
        .chain(future.into_iter().cloned())
        .collect()
}

/// Text shown to the user when a reminder fires
pub fn reminder_message(record: &PrescriptionRecord, kind: ReminderKind) -> String {
    let runs_out = record.depletion.format("%Y-%m-%d %H:%M UTC");
    match kind {
        ReminderKind::Primary => format!(
            "{} runs out on {}. Time to request a refill.",
            record.prescription.name, runs_out
        ),
        ReminderKind::Secondary => format!(
            "Reminder: {} still needs a refill before {}.",
            record.prescription.name, runs_out
        ),
    }
}

/// Owns the reminder registrations of every prescription it schedules
pub struct SchedulingCoordinator<S, D> {
    store: S,
    dispatcher: D,
    settings: DispatchConfig,
    /// Reminder ids currently registered with the dispatcher, per prescription
    registry: Mutex<HashMap<Uuid, Vec<ReminderId>>>,
    schedule_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl<S: PrescriptionStore, D: NotificationDispatcher> SchedulingCoordinator<S, D> {
    pub fn new(store: S, dispatcher: D, settings: DispatchConfig) -> Self {
        Self {
            store,
            dispatcher,
            settings,
            registry: Mutex::new(HashMap::new()),
            schedule_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Reminder ids this coordinator has registered for `id`
    pub fn registered(&self, id: Uuid) -> Vec<ReminderId> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, id: Uuid) -> Result<PrescriptionRecord> {
        self.store.load(id)
    }

    pub fn list(&self) -> Result<Vec<PrescriptionRecord>> {
        self.store.list()
    }

    /// Add a new prescription and schedule its reminders
    pub fn create(&self, draft: PrescriptionDraft, now: DateTime<Utc>) -> Result<PrescriptionRecord> {
        let prescription = Prescription::from_draft(draft, now)?;
        let record = compute_record(prescription)?;

        let lock = self.schedule_lock(record.id());
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _record_lock = self.store.lock_record(record.id())?;

        self.store.save(&record)?;
        tracing::info!(
            "Created prescription {} ({}), runs out {}, {} reminders",
            record.id(),
            record.prescription.name,
            record.depletion,
            record.plan.len()
        );

        self.apply_effect(RefillEffect::Regenerate, &record, &[], now);
        Ok(record)
    }

    /// Edit a prescription.
    ///
    /// Any change to the scheduling inputs starts a fresh cycle in the
    /// `Active` state, discarding an earlier refill acknowledgment.
    pub fn edit(&self, id: Uuid, edit: &PrescriptionEdit, now: DateTime<Utc>) -> Result<PrescriptionRecord> {
        let lock = self.schedule_lock(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _record_lock = self.store.lock_record(id)?;

        let current = self.store.load(id)?;
        if edit.is_empty() {
            return Ok(current);
        }

        let mut next = edit.apply_to(&current.prescription, now)?;

        if !edit.changes_schedule() {
            let renamed = next.name != current.prescription.name;
            let record = PrescriptionRecord {
                prescription: next,
                depletion: current.depletion,
                plan: current.plan.clone(),
            };
            self.store.save(&record)?;
            tracing::info!("Updated details of prescription {}", id);

            // Pending messages carry the name.
            if renamed && record.prescription.refill_state.reminders_live() {
                self.apply_effect(RefillEffect::RegisterPlan, &record, &current.reminder_ids(), now);
            }
            return Ok(record);
        }

        let transition = refill::transition(next.refill_state, RefillEvent::ScheduleChanged);
        next.refill_state = transition.to;
        next.cycle = current.prescription.cycle.saturating_add(1);

        let record = compute_record(next)?;
        self.store.save(&record)?;
        tracing::info!(
            "Rescheduled prescription {} (cycle {}), runs out {}, {} reminders",
            id,
            record.prescription.cycle,
            record.depletion,
            record.plan.len()
        );

        self.apply_effect(transition.effect, &record, &current.reminder_ids(), now);
        Ok(record)
    }

    /// Flip the refill status of the current cycle
    pub fn toggle_refill(&self, id: Uuid, now: DateTime<Utc>) -> Result<PrescriptionRecord> {
        self.apply_refill_event(id, RefillEvent::Toggle, now)
    }

    /// Set the refill status explicitly; repeating the current status is a no-op
    pub fn set_refill_status(&self, id: Uuid, refilled: bool, now: DateTime<Utc>) -> Result<PrescriptionRecord> {
        let event = if refilled {
            RefillEvent::Acknowledge
        } else {
            RefillEvent::Reopen
        };
        self.apply_refill_event(id, event, now)
    }

    fn apply_refill_event(&self, id: Uuid, event: RefillEvent, now: DateTime<Utc>) -> Result<PrescriptionRecord> {
        let lock = self.schedule_lock(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _record_lock = self.store.lock_record(id)?;

        let mut record = self.store.load(id)?;
        let transition = refill::transition(record.prescription.refill_state, event);
        if !transition.changed() {
            return Ok(record);
        }

        record.prescription.refill_state = transition.to;
        record.prescription.updated_at = now;
        self.store.save(&record)?;
        tracing::info!(
            "Prescription {} is now {}",
            id,
            record.prescription.refill_state
        );

        let previous = record.reminder_ids();
        self.apply_effect(transition.effect, &record, &previous, now);
        Ok(record)
    }

    /// Cancel every pending reminder of a prescription and remove it
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let lock = self.schedule_lock(id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _record_lock = self.store.lock_record(id)?;

        let stored_ids = match self.store.load(id) {
            Ok(record) => record.reminder_ids(),
            Err(Error::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let removed = match self.store.delete(id) {
            Ok(()) => true,
            Err(Error::NotFound(_)) => false,
            Err(e) => return Err(e),
        };

        self.cancel_registered(id, &stored_ids, &[]);
        self.schedule_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        if !removed {
            return Err(Error::NotFound(id));
        }
        tracing::info!("Deleted prescription {}", id);
        Ok(())
    }

    /// Register the plans of every stored prescription awaiting refill.
    ///
    /// Used at start-up, when the in-memory registry is empty.
    pub fn restore(&self, now: DateTime<Utc>) -> Result<usize> {
        let records = self.store.list()?;
        let mut restored = 0;

        for listed in &records {
            let id = listed.id();
            let lock = self.schedule_lock(id);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let _record_lock = self.store.lock_record(id)?;

            // Re-read under the lock; the listing may be stale.
            let record = match self.store.load(id) {
                Ok(record) => record,
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if record.prescription.refill_state.reminders_live() {
                self.apply_effect(RefillEffect::RegisterPlan, &record, &record.reminder_ids(), now);
                restored += 1;
            }
        }

        tracing::info!(
            "Restored reminders for {} of {} prescriptions",
            restored,
            records.len()
        );
        Ok(restored)
    }

    fn schedule_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.schedule_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_default()
            .clone()
    }

    /// Carry out a refill transition's side effect against the dispatcher
    fn apply_effect(
        &self,
        effect: RefillEffect,
        record: &PrescriptionRecord,
        previous: &[ReminderId],
        now: DateTime<Utc>,
    ) {
        match effect {
            RefillEffect::None => {}
            RefillEffect::CancelPending => self.cancel_registered(record.id(), previous, &[]),
            RefillEffect::RegisterPlan => {
                // Overdue entries stay as they are: pending ones still fire, delivered ones stay retired.
                let overdue: Vec<ReminderId> = record
                    .plan
                    .reminders
                    .iter()
                    .filter(|r| r.fire_at <= now)
                    .map(|r| ReminderId::new(record.prescription.cycle, r.seq))
                    .collect();
                self.cancel_registered(record.id(), previous, &overdue);
                self.register_plan(record, now, PastDuePolicy::Skip);
            }
            RefillEffect::Regenerate => {
                self.cancel_registered(record.id(), previous, &[]);
                self.register_plan(record, now, self.settings.past_due);
            }
        }
    }

    /// Cancel `previous` plus anything in the registry except `keep`, then forget them
    fn cancel_registered(&self, id: Uuid, previous: &[ReminderId], keep: &[ReminderId]) {
        let mut targets = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .unwrap_or_default();
        targets.extend_from_slice(previous);
        targets.retain(|reminder_id| !keep.contains(reminder_id));
        targets.sort();
        targets.dedup();

        let unconfirmed = targets
            .iter()
            .filter(|reminder_id| !self.cancel_confirmed(id, **reminder_id))
            .count();

        if unconfirmed > 0 {
            tracing::warn!(
                "{} reminder(s) of prescription {} could not be confirmed cancelled; \
                 a stale reminder may still fire",
                unconfirmed,
                id
            );
        }
    }

    /// Cancel one reminder, retrying within the configured budget
    fn cancel_confirmed(&self, id: Uuid, reminder_id: ReminderId) -> bool {
        let attempts = self.settings.cancel_retries.saturating_add(1);
        for attempt in 1..=attempts {
            match self.dispatcher.cancel(id, reminder_id) {
                Ok(()) | Err(DispatchError::NotFound(_, _)) => return true,
                Err(e) => {
                    tracing::debug!(
                        "Cancel of reminder {} for {} failed (attempt {}/{}): {}",
                        reminder_id,
                        id,
                        attempt,
                        attempts,
                        e
                    );
                    if attempt < attempts {
                        std::thread::sleep(self.settings.retry_backoff());
                    }
                }
            }
        }
        false
    }

    fn register_plan(&self, record: &PrescriptionRecord, now: DateTime<Utc>, past_due: PastDuePolicy) {
        let id = record.id();
        let mut registered = Vec::new();

        for reminder in live_reminders(&record.plan, now, past_due) {
            let reminder_id = ReminderId::new(record.prescription.cycle, reminder.seq);
            let message = reminder_message(record, reminder.kind);

            match self
                .dispatcher
                .schedule(id, reminder_id, reminder.fire_at, &message)
            {
                Ok(()) => registered.push(reminder_id),
                Err(e) => tracing::warn!(
                    "Failed to register reminder {} for prescription {}: {}",
                    reminder_id,
                    id,
                    e
                ),
            }
        }

        tracing::debug!(
            "Registered {} of {} reminders for {}",
            registered.len(),
            record.plan.len(),
            id
        );
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, registered);
    }
}
