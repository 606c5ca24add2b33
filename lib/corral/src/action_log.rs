// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The record of what was asked of each instance and what happened.
//!
//! The log serves two purposes. Its request table maps each client request ID
//! to the outcome of the request, so a client that resubmits a request (say,
//! after a lost response) is answered from the table instead of causing a
//! second execution. Its audit trail keeps, per instance, an action for every
//! lifecycle request and the ordered events (sub-steps) that action ran.
//! Finished actions are immutable.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use corral_types::{ActionKind, ActionUuid, InstanceUuid, RequestId};
use serde::Serialize;
use thiserror::Error;

use crate::coordinator::Outcome;
use crate::error::OrchestrationError;

/// The final result of a request, as replayed to clients that resubmit it.
pub type RecordedOutcome = Result<Outcome, OrchestrationError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ActionLogError {
    #[error(
        "Request {request_id} was already used for {action} on {instance:?}"
    )]
    RequestReused {
        request_id: RequestId,
        action: ActionKind,
        instance: Option<InstanceUuid>,
    },

    #[error("Action {0} not found")]
    ActionNotFound(ActionUuid),

    #[error("Action {0} has already finished")]
    ActionFinished(ActionUuid),

    #[error("Event {0:?} was never started")]
    EventNotStarted(String),
}

/// What [`ActionLog::begin_request`] found for a request ID.
#[derive(Clone, Debug)]
pub enum RequestStatus {
    /// The request is new and now recorded as in flight.
    Fresh,

    /// The request already finished with this outcome.
    Replay(RecordedOutcome),

    /// The request is still being executed.
    InFlight,
}

#[derive(Clone, Debug)]
enum RequestState {
    InFlight,
    Done(RecordedOutcome),
}

#[derive(Clone, Debug)]
struct RequestEntry {
    action: ActionKind,
    instance: Option<InstanceUuid>,
    state: RequestState,

    /// For requests that name no instance (creates), the instances the
    /// request brought into being. The entry is kept until all of them have
    /// been purged.
    produced: Vec<InstanceUuid>,
    finished_at: Option<DateTime<Utc>>,
}

impl RequestEntry {
    fn finish(&mut self, outcome: RecordedOutcome) {
        if self.instance.is_none() {
            if let Ok(Outcome::Instances(views)) = &outcome {
                self.produced.extend(views.iter().map(|v| v.id));
            }
        }
        self.state = RequestState::Done(outcome);
        self.finished_at = Some(Utc::now());
    }

    /// Answers whether purging `ids` leaves this entry with nothing to
    /// replay for.
    fn forget(&mut self, ids: &[InstanceUuid]) -> bool {
        if matches!(self.state, RequestState::InFlight) {
            return false;
        }
        match self.instance {
            Some(instance) => ids.contains(&instance),
            None if self.produced.is_empty() => false,
            None => {
                self.produced.retain(|i| !ids.contains(i));
                self.produced.is_empty()
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Success,
    Error,

    /// The request was refused before anything was attempted.
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EventRecord {
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub result: Option<ActionResult>,
    pub detail: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActionRecord {
    pub id: ActionUuid,
    pub instance: InstanceUuid,
    pub request_id: RequestId,
    pub action: ActionKind,
    pub start_time: DateTime<Utc>,
    pub finish_time: Option<DateTime<Utc>>,
    pub result: Option<ActionResult>,
    pub message: Option<String>,
    pub events: Vec<EventRecord>,
}

impl ActionRecord {
    pub fn is_finished(&self) -> bool {
        self.finish_time.is_some()
    }
}

#[derive(Default)]
struct Inner {
    requests: BTreeMap<RequestId, RequestEntry>,
    actions: BTreeMap<ActionUuid, ActionRecord>,
    by_instance: BTreeMap<InstanceUuid, Vec<ActionUuid>>,
}

impl Inner {
    fn open_action(
        &mut self,
        id: ActionUuid,
    ) -> Result<&mut ActionRecord, ActionLogError> {
        let action = self
            .actions
            .get_mut(&id)
            .ok_or(ActionLogError::ActionNotFound(id))?;
        if action.is_finished() {
            return Err(ActionLogError::ActionFinished(id));
        }
        Ok(action)
    }
}

#[derive(Default)]
pub struct ActionLog {
    inner: Mutex<Inner>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `request_id`, registering it as in flight if it is new.
    ///
    /// A request ID is bound to the action and instance it was first used
    /// with; reusing it for anything else is an error.
    pub fn begin_request(
        &self,
        request_id: &RequestId,
        action: ActionKind,
        instance: Option<InstanceUuid>,
    ) -> Result<RequestStatus, ActionLogError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.requests.get(request_id).cloned() {
            Some(entry)
                if entry.action != action || entry.instance != instance =>
            {
                Err(ActionLogError::RequestReused {
                    request_id: request_id.clone(),
                    action: entry.action,
                    instance: entry.instance,
                })
            }
            Some(RequestEntry { state: RequestState::InFlight, .. }) => {
                Ok(RequestStatus::InFlight)
            }
            Some(RequestEntry { state: RequestState::Done(outcome), .. }) => {
                Ok(RequestStatus::Replay(outcome))
            }
            None => {
                inner.requests.insert(
                    request_id.clone(),
                    RequestEntry {
                        action,
                        instance,
                        state: RequestState::InFlight,
                        produced: Vec::new(),
                        finished_at: None,
                    },
                );
                Ok(RequestStatus::Fresh)
            }
        }
    }

    /// Records the outcome of a request. The first recorded outcome wins.
    pub fn finish_request(
        &self,
        request_id: &RequestId,
        outcome: RecordedOutcome,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.requests.get_mut(request_id) {
            if matches!(entry.state, RequestState::InFlight) {
                entry.finish(outcome);
            }
        }
    }

    /// Drops the audit trail and finished requests of purged instances. A
    /// create request goes once every instance it produced is purged.
    pub fn forget_instances(&self, ids: &[InstanceUuid]) {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.retain(|_, entry| !entry.forget(ids));
        for id in ids {
            if let Some(actions) = inner.by_instance.remove(id) {
                for action in actions {
                    inner.actions.remove(&action);
                }
            }
        }
    }

    pub fn start_action(
        &self,
        instance: InstanceUuid,
        request_id: &RequestId,
        action: ActionKind,
    ) -> ActionUuid {
        let id = ActionUuid::new_v4();
        let mut inner = self.inner.lock().unwrap();
        inner.actions.insert(
            id,
            ActionRecord {
                id,
                instance,
                request_id: request_id.clone(),
                action,
                start_time: Utc::now(),
                finish_time: None,
                result: None,
                message: None,
                events: Vec::new(),
            },
        );
        inner.by_instance.entry(instance).or_default().push(id);
        id
    }

    pub fn start_event(
        &self,
        action: ActionUuid,
        name: &str,
    ) -> Result<(), ActionLogError> {
        let mut inner = self.inner.lock().unwrap();
        inner.open_action(action)?.events.push(EventRecord {
            name: name.to_string(),
            start_time: Utc::now(),
            finish_time: None,
            result: None,
            detail: None,
        });
        Ok(())
    }

    /// Finishes the most recent unfinished event called `name`.
    pub fn finish_event(
        &self,
        action: ActionUuid,
        name: &str,
        result: Result<(), String>,
    ) -> Result<(), ActionLogError> {
        let mut inner = self.inner.lock().unwrap();
        let event = inner
            .open_action(action)?
            .events
            .iter_mut()
            .rev()
            .find(|e| e.name == name && e.finish_time.is_none())
            .ok_or_else(|| ActionLogError::EventNotStarted(name.to_string()))?;
        event.finish_time = Some(Utc::now());
        match result {
            Ok(()) => event.result = Some(ActionResult::Success),
            Err(detail) => {
                event.result = Some(ActionResult::Error);
                event.detail = Some(detail);
            }
        }
        Ok(())
    }

    /// Finishes an action. Any event still open is closed as failed.
    pub fn finish_action(
        &self,
        action: ActionUuid,
        result: Result<(), String>,
    ) -> Result<(), ActionLogError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.open_action(action)?;
        let now = Utc::now();
        let open = record.events.iter_mut().filter(|e| e.finish_time.is_none());
        for event in open {
            event.finish_time = Some(now);
            event.result = Some(ActionResult::Error);
            event.detail = Some("action finished before event".to_string());
        }
        record.finish_time = Some(now);
        match result {
            Ok(()) => record.result = Some(ActionResult::Success),
            Err(message) => {
                record.result = Some(ActionResult::Error);
                record.message = Some(message);
            }
        }
        Ok(())
    }

    /// Closes whatever a task interrupted by a restart left open on
    /// `instance`: its unfinished actions, and the in-flight requests that
    /// target it (plus `origin`, which may be a batch request naming no
    /// instance). Returns the number of actions closed.
    pub fn close_interrupted(
        &self,
        instance: InstanceUuid,
        origin: &RequestId,
        outcome: RecordedOutcome,
    ) -> usize {
        let open: Vec<ActionUuid> = self
            .actions(instance)
            .into_iter()
            .filter(|a| !a.is_finished())
            .map(|a| a.id)
            .collect();
        let summary = match &outcome {
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        };
        for id in &open {
            let _ = self.finish_action(*id, summary.clone());
        }

        let mut inner = self.inner.lock().unwrap();
        for (request_id, entry) in inner.requests.iter_mut() {
            let ours =
                entry.instance == Some(instance) || request_id == origin;
            if ours && matches!(entry.state, RequestState::InFlight) {
                if entry.instance.is_none() {
                    entry.produced.push(instance);
                }
                entry.finish(outcome.clone());
            }
        }
        open.len()
    }

    /// Drops finished requests that produced no instance, such as failed
    /// creates, if they finished before `cutoff`. Returns how many went.
    pub fn expire_requests(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.requests.len();
        inner.requests.retain(|_, entry| {
            let unattached =
                entry.instance.is_none() && entry.produced.is_empty();
            !(unattached && entry.finished_at.is_some_and(|at| at < cutoff))
        });
        before - inner.requests.len()
    }

    /// Records a request that was refused before it started.
    pub fn record_rejection(
        &self,
        instance: InstanceUuid,
        request_id: &RequestId,
        action: ActionKind,
        reason: &str,
    ) -> ActionUuid {
        let id = self.start_action(instance, request_id, action);
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.actions.get_mut(&id) {
            record.finish_time = Some(record.start_time);
            record.result = Some(ActionResult::Rejected);
            record.message = Some(reason.to_string());
        }
        id
    }

    /// Lists the actions run against `instance`, oldest first.
    pub fn actions(&self, instance: InstanceUuid) -> Vec<ActionRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_instance
            .get(&instance)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.actions.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the action that `request_id` started on `instance`.
    pub fn action(
        &self,
        instance: InstanceUuid,
        request_id: &RequestId,
    ) -> Option<ActionRecord> {
        self.actions(instance)
            .into_iter()
            .rev()
            .find(|a| &a.request_id == request_id)
    }
}
