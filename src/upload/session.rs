//! Upload session state
//!
//! An [`UploadSession`] is owned by the coordinator for the duration of one
//! attempt. Its lifecycle is the tagged [`UploadState`]; every change goes
//! through [`UploadState::transition`].
//!
//! ```text
//! Uninitiated --Initiated/Resumed--> Active --BeginComplete--> Completing --Completed--> Completed
//!                                     ^  |                         |
//!                                     |  +----CompleteFailed-------+
//!                                     |  BeginAbort
//!                                     |  v
//!                                     +- Aborting --Aborted--> Aborted
//!                                       (AbortFailed)
//! ```

use super::planner::UploadPlan;
use super::{PartResult, UploadError, UploadOptions};
use crate::s3::S3CompletedPart;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Caller-held handle to a remote multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

impl SessionRef {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        upload_id: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            upload_id: upload_id.into(),
        }
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.bucket, self.key, self.upload_id)
    }
}

/// Lifecycle of a multipart upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Uninitiated,
    Active,
    Completing,
    Completed,
    Aborting,
    Aborted,
}

/// Something that happened to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEvent {
    Initiated,
    Resumed,
    BeginComplete,
    CompleteSucceeded,
    CompleteFailed,
    BeginAbort,
    AbortSucceeded,
    AbortFailed,
}

impl UploadState {
    /// The state after `event`, or `InvalidTransition`
    pub fn transition(self, event: UploadEvent) -> Result<UploadState, UploadError> {
        use UploadEvent::*;
        use UploadState::*;

        match (self, event) {
            (Uninitiated, Initiated) | (Uninitiated, Resumed) => Ok(Active),
            (Active, BeginComplete) => Ok(Completing),
            (Completing, CompleteSucceeded) => Ok(Completed),
            (Completing, CompleteFailed) => Ok(Active),
            (Active, BeginAbort) => Ok(Aborting),
            (Aborting, AbortSucceeded) => Ok(Aborted),
            (Aborting, AbortFailed) => Ok(Active),
            (state, event) => Err(UploadError::InvalidTransition(format!(
                "{event:?} is not allowed in state {state:?}"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Aborted)
    }
}

/// Parts accepted for a session, keyed by part number.
///
/// Recording a part number again replaces the earlier result.
#[derive(Debug, Clone, Default)]
pub struct PartLedger {
    parts: Arc<DashMap<u32, PartResult>>,
}

impl PartLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: PartResult) -> Option<PartResult> {
        self.parts.insert(result.part_number, result)
    }

    pub fn get(&self, part_number: u32) -> Option<PartResult> {
        self.parts.get(&part_number).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, part_number: u32) -> bool {
        self.parts.contains_key(&part_number)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// All results, ascending by part number
    pub fn sorted(&self) -> Vec<PartResult> {
        let mut parts: Vec<PartResult> = self
            .parts
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    /// Planned part numbers with no recorded result
    pub fn missing(&self, plan: &UploadPlan) -> Vec<u32> {
        plan.parts()
            .iter()
            .map(|p| p.part_number)
            .filter(|n| !self.contains(*n))
            .collect()
    }
}

/// One multipart upload as seen by the coordinator
#[derive(Debug)]
pub struct UploadSession {
    session_ref: SessionRef,
    plan: UploadPlan,
    options: UploadOptions,
    server_side_encryption: Option<String>,
    state: UploadState,
    ledger: PartLedger,
}

impl UploadSession {
    pub fn new(session_ref: SessionRef, plan: UploadPlan, options: UploadOptions) -> Self {
        Self {
            session_ref,
            plan,
            options,
            server_side_encryption: None,
            state: UploadState::Uninitiated,
            ledger: PartLedger::new(),
        }
    }

    pub fn session_ref(&self) -> &SessionRef {
        &self.session_ref
    }

    pub fn upload_id(&self) -> &str {
        &self.session_ref.upload_id
    }

    pub fn plan(&self) -> &UploadPlan {
        &self.plan
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn ledger(&self) -> &PartLedger {
        &self.ledger
    }

    pub fn server_side_encryption(&self) -> Option<&str> {
        self.server_side_encryption.as_deref()
    }

    pub fn set_server_side_encryption(&mut self, value: Option<String>) {
        if value.is_some() {
            self.server_side_encryption = value;
        }
    }

    /// Apply an event, keeping the current state on error
    pub fn apply(&mut self, event: UploadEvent) -> Result<UploadState, UploadError> {
        let next = self.state.transition(event)?;
        tracing::debug!(
            upload_id = %self.session_ref.upload_id,
            from = ?self.state,
            to = ?next,
            "Upload state changed"
        );
        self.state = next;
        Ok(next)
    }

    /// Parts for CompleteMultipartUpload, ascending by part number.
    ///
    /// Fails with `IncompleteParts` unless every planned part is recorded.
    pub fn completion_parts(&self) -> Result<Vec<S3CompletedPart>, UploadError> {
        let missing = self.ledger.missing(&self.plan);
        if !missing.is_empty() {
            return Err(UploadError::IncompleteParts(missing));
        }
        Ok(self
            .ledger
            .sorted()
            .into_iter()
            .filter(|p| self.plan.part(p.part_number).is_some())
            .map(|p| S3CompletedPart {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::planner::{PartPlanner, PlannerLimits};

    fn small_plan() -> UploadPlan {
        PartPlanner::new(PlannerLimits {
            min_part_size: 1,
            max_part_size: 1024,
            max_parts: 100,
        })
        .plan(10, 4, 100)
        .unwrap()
    }

    fn part(n: u32, etag: &str, size: u64) -> PartResult {
        PartResult {
            part_number: n,
            etag: etag.into(),
            size,
            server_side_encryption: None,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = UploadState::Uninitiated;
        for event in [
            UploadEvent::Initiated,
            UploadEvent::BeginComplete,
            UploadEvent::CompleteSucceeded,
        ] {
            state = state.transition(event).unwrap();
        }
        assert_eq!(state, UploadState::Completed);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_complete_failure_returns_to_active() {
        let state = UploadState::Completing
            .transition(UploadEvent::CompleteFailed)
            .unwrap();
        assert_eq!(state, UploadState::Active);
        let state = state.transition(UploadEvent::BeginAbort).unwrap();
        assert_eq!(state, UploadState::Aborting);
        let state = state.transition(UploadEvent::AbortSucceeded).unwrap();
        assert_eq!(state, UploadState::Aborted);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(matches!(
            UploadState::Completed.transition(UploadEvent::BeginAbort),
            Err(UploadError::InvalidTransition(_))
        ));
        assert!(UploadState::Aborted
            .transition(UploadEvent::BeginComplete)
            .is_err());
        assert!(UploadState::Uninitiated
            .transition(UploadEvent::BeginComplete)
            .is_err());
        assert!(UploadState::Active.transition(UploadEvent::Initiated).is_err());
    }

    #[test]
    fn test_session_keeps_state_on_invalid_event() {
        let mut session = UploadSession::new(
            SessionRef::new("b", "k", "u"),
            small_plan(),
            UploadOptions::default(),
        );
        assert!(session.apply(UploadEvent::BeginComplete).is_err());
        assert_eq!(session.state(), UploadState::Uninitiated);
    }

    #[test]
    fn test_ledger_last_writer_wins() {
        let ledger = PartLedger::new();
        ledger.record(part(2, "old", 4));
        let replaced = ledger.record(part(2, "new", 4));
        assert_eq!(replaced.map(|p| p.etag), Some("old".to_string()));
        assert_eq!(ledger.get(2).unwrap().etag, "new");
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_completion_parts_sorted() {
        let mut session = UploadSession::new(
            SessionRef::new("b", "k", "u"),
            small_plan(),
            UploadOptions::default(),
        );
        session.apply(UploadEvent::Initiated).unwrap();
        session.ledger().record(part(3, "c", 2));
        session.ledger().record(part(1, "a", 4));

        assert!(matches!(
            session.completion_parts(),
            Err(UploadError::IncompleteParts(ref missing)) if missing == &vec![2]
        ));

        session.ledger().record(part(2, "b", 4));
        let numbers: Vec<u32> = session
            .completion_parts()
            .unwrap()
            .iter()
            .map(|p| p.part_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
}
