//! Result approval state machine.
//!
//! ```text
//! WITH_INSTRUCTOR -> SUBMITTED_TO_COMMITTEE -> COMMITTEE_APPROVED -> PUBLISHED
//!                         |        ^
//!                         v        |
//!                    RETURNED_TO_TEACHER
//! ```
//!
//! Every mutation loads the workflow by id, checks it, and commits through
//! [`Store::save_workflow`] with the version it loaded. A concurrent writer
//! that got there first makes the commit fail with
//! [`WorkflowError::ConcurrentModification`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditTrail};
use crate::cgpa::{self, CgpaSummary};
use crate::config::ServiceConfig;
use crate::grading::{ComponentMarks, CourseType, GradeAggregator};
use crate::otp::{IssuedOtp, OtpError, OtpPurpose, StepUpAuthGate};
use crate::ports::{
    Audience, Clock, IdentityError, IdentityProvider, NotificationSink, OtpTransport, WorkflowEvent,
};
use crate::store::{Changes, GradeRecord, GradeSnapshot, OtpStore, Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    WithInstructor,
    SubmittedToCommittee,
    CommitteeApproved,
    Published,
    ReturnedToTeacher,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::WithInstructor => "WITH_INSTRUCTOR",
            WorkflowStatus::SubmittedToCommittee => "SUBMITTED_TO_COMMITTEE",
            WorkflowStatus::CommitteeApproved => "COMMITTEE_APPROVED",
            WorkflowStatus::Published => "PUBLISHED",
            WorkflowStatus::ReturnedToTeacher => "RETURNED_TO_TEACHER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "WITH_INSTRUCTOR" => Some(WorkflowStatus::WithInstructor),
            "SUBMITTED_TO_COMMITTEE" => Some(WorkflowStatus::SubmittedToCommittee),
            "COMMITTEE_APPROVED" => Some(WorkflowStatus::CommitteeApproved),
            "PUBLISHED" => Some(WorkflowStatus::Published),
            "RETURNED_TO_TEACHER" => Some(WorkflowStatus::ReturnedToTeacher),
            _ => None,
        }
    }

    pub(crate) fn parse_stored(raw: &str) -> Result<Self, StoreError> {
        Self::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("unknown workflow status {raw}")))
    }

    /// The transition table. `None` means the edge does not exist.
    pub fn next(self, action: Action) -> Option<WorkflowStatus> {
        use Action::*;
        use WorkflowStatus::*;
        match (self, action) {
            (WithInstructor | ReturnedToTeacher, Submit) => Some(SubmittedToCommittee),
            (SubmittedToCommittee, Approve) => Some(CommitteeApproved),
            (SubmittedToCommittee, Return) => Some(ReturnedToTeacher),
            (CommitteeApproved, Publish) => Some(Published),
            (_, Submit | Approve | Return | Publish) => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Published)
    }

    /// Marks may only be edited while the instructor holds the result.
    pub fn accepts_marks(self) -> bool {
        matches!(
            self,
            WorkflowStatus::WithInstructor | WorkflowStatus::ReturnedToTeacher
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Submit,
    Approve,
    Return,
    Publish,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Submit => "submit",
            Action::Approve => "approve",
            Action::Return => "return",
            Action::Publish => "publish",
        }
    }

    pub fn otp_purpose(self) -> Option<OtpPurpose> {
        match self {
            Action::Submit => None,
            Action::Approve => Some(OtpPurpose::ResultApproval),
            Action::Return => Some(OtpPurpose::ResultReturn),
            Action::Publish => Some(OtpPurpose::ResultPublication),
        }
    }
}

/// (batch, course, semester): the identity of one course result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowKey {
    pub batch_id: String,
    pub course_id: String,
    pub semester: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultWorkflow {
    pub id: String,
    pub batch_id: String,
    pub course_id: String,
    pub semester: String,
    pub status: WorkflowStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResultWorkflow {
    pub fn key(&self) -> WorkflowKey {
        WorkflowKey {
            batch_id: self.batch_id.clone(),
            course_id: self.course_id.clone(),
            semester: self.semester.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("cannot {action} a workflow in state {from}")]
    InvalidTransition { from: &'static str, action: &'static str },
    #[error("actor {actor_id} may not {action} results for course {course_id}")]
    Unauthorized {
        actor_id: String,
        course_id: String,
        action: &'static str,
    },
    #[error("one-time passcode is invalid or expired")]
    OtpInvalidOrExpired,
    #[error("a non-empty comment is required to return a result")]
    CommentRequired,
    #[error("workflow {0} was modified concurrently")]
    ConcurrentModification(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("an active workflow already exists for this batch, course and semester")]
    DuplicateActiveWorkflow,
    #[error("marks are locked while the workflow is {0}")]
    MarksLocked(&'static str),
    #[error("student {student_id} is not enrolled in this result")]
    NotEnrolled { student_id: String },
    #[error("course expects {expected} marks, got {got}")]
    MarksMismatch {
        expected: &'static str,
        got: &'static str,
    },
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Store(StoreError),
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::InvalidTransition { .. } => "invalid_transition",
            WorkflowError::Unauthorized { .. } => "unauthorized",
            WorkflowError::OtpInvalidOrExpired => "otp_invalid_or_expired",
            WorkflowError::CommentRequired => "comment_required",
            WorkflowError::ConcurrentModification(_) => "concurrent_modification",
            WorkflowError::NotFound(_) => "not_found",
            WorkflowError::DuplicateActiveWorkflow => "duplicate_active_workflow",
            WorkflowError::MarksLocked(_) => "marks_locked",
            WorkflowError::NotEnrolled { .. } => "not_enrolled",
            WorkflowError::MarksMismatch { .. } => "marks_mismatch",
            WorkflowError::Identity(_) => "identity_failed",
            WorkflowError::Store(_) => "store_failed",
        }
    }
}

impl From<StoreError> for WorkflowError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict { workflow_id, .. } => {
                WorkflowError::ConcurrentModification(workflow_id)
            }
            StoreError::DuplicateActive => WorkflowError::DuplicateActiveWorkflow,
            other => WorkflowError::Store(other),
        }
    }
}

impl From<OtpError> for WorkflowError {
    fn from(e: OtpError) -> Self {
        match e {
            OtpError::InvalidOrExpired => WorkflowError::OtpInvalidOrExpired,
            OtpError::Store(s) => s.into(),
        }
    }
}

/// Everything the engine talks to.
pub struct EngineDeps {
    pub store: Arc<dyn Store>,
    pub otp_store: Arc<dyn OtpStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub transport: Arc<dyn OtpTransport>,
    pub notifier: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

pub struct WorkflowEngine {
    store: Arc<dyn Store>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    gate: StepUpAuthGate,
    grader: GradeAggregator,
    audit: AuditTrail,
}

impl WorkflowEngine {
    pub fn new(deps: EngineDeps, config: &ServiceConfig) -> Self {
        let gate = StepUpAuthGate::new(
            deps.otp_store,
            deps.transport,
            deps.clock.clone(),
            config.otp,
        );
        Self {
            audit: AuditTrail::new(deps.store.clone()),
            store: deps.store,
            identity: deps.identity,
            notifier: deps.notifier,
            clock: deps.clock,
            gate,
            grader: config.aggregator(),
        }
    }

    pub fn gate(&self) -> &StepUpAuthGate {
        &self.gate
    }

    pub fn grader(&self) -> &GradeAggregator {
        &self.grader
    }

    fn load(&self, workflow_id: &str) -> Result<ResultWorkflow, WorkflowError> {
        self.store
            .load_workflow(workflow_id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow {workflow_id}")))
    }

    fn course_type(&self, course_id: &str) -> Result<CourseType, WorkflowError> {
        self.store
            .course(course_id)?
            .map(|c| c.course_type)
            .ok_or_else(|| WorkflowError::NotFound(format!("course {course_id}")))
    }

    fn require_instructor(
        &self,
        actor_id: &str,
        course_id: &str,
        action: &'static str,
    ) -> Result<(), WorkflowError> {
        if self.identity.capabilities_of(actor_id)?.is_instructor_of(course_id) {
            Ok(())
        } else {
            Err(WorkflowError::Unauthorized {
                actor_id: actor_id.to_string(),
                course_id: course_id.to_string(),
                action,
            })
        }
    }

    fn require_committee(
        &self,
        actor_id: &str,
        course_id: &str,
        action: &'static str,
    ) -> Result<(), WorkflowError> {
        if self
            .identity
            .capabilities_of(actor_id)?
            .is_committee_member_of(course_id)
        {
            Ok(())
        } else {
            Err(WorkflowError::Unauthorized {
                actor_id: actor_id.to_string(),
                course_id: course_id.to_string(),
                action,
            })
        }
    }

    /// Opens a new review cycle for `key`, seeding an empty grade record for
    /// every active enrollment.
    pub fn create_workflow(
        &self,
        key: &WorkflowKey,
        actor_id: &str,
    ) -> Result<ResultWorkflow, WorkflowError> {
        self.require_instructor(actor_id, &key.course_id, "create")?;
        let course_type = self.course_type(&key.course_id)?;

        let now = self.clock.now();
        let workflow = ResultWorkflow {
            id: Uuid::new_v4().to_string(),
            batch_id: key.batch_id.clone(),
            course_id: key.course_id.clone(),
            semester: key.semester.clone(),
            status: WorkflowStatus::WithInstructor,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let empty = ComponentMarks::empty(course_type);
        let seed: Vec<GradeRecord> = self
            .store
            .active_enrollments(key)?
            .into_iter()
            .map(|student_id| GradeRecord::graded(&workflow.id, &student_id, empty, &self.grader, now))
            .collect();
        self.store.create_workflow(&workflow, &seed)?;
        info!(
            workflow_id = %workflow.id,
            course_id = %key.course_id,
            seeded = seed.len(),
            "workflow created"
        );
        Ok(workflow)
    }

    pub fn workflow(&self, workflow_id: &str) -> Result<ResultWorkflow, WorkflowError> {
        self.load(workflow_id)
    }

    pub fn grades(&self, workflow_id: &str) -> Result<Vec<GradeRecord>, WorkflowError> {
        self.load(workflow_id)?;
        Ok(self.store.load_grade_records(workflow_id)?)
    }

    pub fn snapshots(&self, workflow_id: &str) -> Result<Vec<GradeSnapshot>, WorkflowError> {
        self.load(workflow_id)?;
        Ok(self.store.snapshots(workflow_id)?)
    }

    pub fn history(&self, workflow_id: &str) -> Result<Vec<AuditEntry>, WorkflowError> {
        self.load(workflow_id)?;
        Ok(self.audit.history(workflow_id)?)
    }

    pub fn active_enrollment_count(&self, workflow: &ResultWorkflow) -> Result<usize, WorkflowError> {
        Ok(self.store.active_enrollments(&workflow.key())?.len())
    }

    pub fn calculate_cgpa(&self, student_id: &str) -> Result<CgpaSummary, WorkflowError> {
        Ok(cgpa::calculate_cgpa(self.store.as_ref(), student_id)?)
    }

    /// Records one student's marks. Bumps the workflow version like a
    /// transition but writes no audit entry.
    pub fn enter_marks(
        &self,
        workflow_id: &str,
        actor_id: &str,
        student_id: &str,
        marks: ComponentMarks,
    ) -> Result<GradeRecord, WorkflowError> {
        let current = self.load(workflow_id)?;
        if !current.status.accepts_marks() {
            return Err(WorkflowError::MarksLocked(current.status.as_str()));
        }
        self.require_instructor(actor_id, &current.course_id, "enter marks for")?;
        let course_type = self.course_type(&current.course_id)?;
        if marks.course_type() != course_type {
            return Err(WorkflowError::MarksMismatch {
                expected: course_type.as_str(),
                got: marks.course_type().as_str(),
            });
        }
        // Seeded at creation, or actively enrolled for the key since then.
        let seeded = self
            .store
            .load_grade_records(workflow_id)?
            .iter()
            .any(|r| r.student_id == student_id);
        if !seeded
            && !self
                .store
                .active_enrollments(&current.key())?
                .iter()
                .any(|s| s == student_id)
        {
            return Err(WorkflowError::NotEnrolled {
                student_id: student_id.to_string(),
            });
        }

        let now = self.clock.now();
        let record = GradeRecord::graded(workflow_id, student_id, marks, &self.grader, now);
        let updated = ResultWorkflow {
            version: current.version + 1,
            updated_at: now,
            ..current.clone()
        };
        self.store.save_workflow(
            &updated,
            current.version,
            Changes {
                audit: None,
                grades: std::slice::from_ref(&record),
                snapshot: false,
            },
        )?;
        Ok(record)
    }

    /// Issues a step-up code for `action`. Only committee members of the
    /// course can request one.
    pub fn issue_otp(
        &self,
        workflow_id: &str,
        actor_id: &str,
        action: Action,
    ) -> Result<IssuedOtp, WorkflowError> {
        let workflow = self.load(workflow_id)?;
        let Some(purpose) = action.otp_purpose() else {
            return Err(WorkflowError::InvalidTransition {
                from: workflow.status.as_str(),
                action: action.as_str(),
            });
        };
        self.require_committee(actor_id, &workflow.course_id, action.as_str())?;
        Ok(self.gate.issue(actor_id, workflow_id, purpose)?)
    }

    pub fn submit(&self, workflow_id: &str, actor_id: &str) -> Result<WorkflowStatus, WorkflowError> {
        self.transition(workflow_id, actor_id, Action::Submit, None, None)
    }

    pub fn approve(
        &self,
        workflow_id: &str,
        actor_id: &str,
        otp: Option<&str>,
    ) -> Result<WorkflowStatus, WorkflowError> {
        self.transition(workflow_id, actor_id, Action::Approve, otp, None)
    }

    pub fn return_to_instructor(
        &self,
        workflow_id: &str,
        actor_id: &str,
        otp: Option<&str>,
        comment: &str,
    ) -> Result<WorkflowStatus, WorkflowError> {
        self.transition(workflow_id, actor_id, Action::Return, otp, Some(comment))
    }

    pub fn publish(
        &self,
        workflow_id: &str,
        actor_id: &str,
        otp: Option<&str>,
    ) -> Result<WorkflowStatus, WorkflowError> {
        self.transition(workflow_id, actor_id, Action::Publish, otp, None)
    }

    fn transition(
        &self,
        workflow_id: &str,
        actor_id: &str,
        action: Action,
        otp: Option<&str>,
        comment: Option<&str>,
    ) -> Result<WorkflowStatus, WorkflowError> {
        let span = info_span!(
            "workflow_transition",
            workflow_id,
            actor_id,
            action = action.as_str()
        );
        let _enter = span.enter();

        let current = self.load(workflow_id)?;
        let Some(next) = current.status.next(action) else {
            return Err(WorkflowError::InvalidTransition {
                from: current.status.as_str(),
                action: action.as_str(),
            });
        };

        match action {
            Action::Submit => self.require_instructor(actor_id, &current.course_id, action.as_str())?,
            Action::Approve | Action::Return | Action::Publish => {
                self.require_committee(actor_id, &current.course_id, action.as_str())?
            }
        }

        let comment = comment.map(str::trim).filter(|c| !c.is_empty());
        if action == Action::Return && comment.is_none() {
            return Err(WorkflowError::CommentRequired);
        }

        // All checks that can be made without the code are done; the code is
        // spent from here on even if the commit loses a race.
        if let Some(purpose) = action.otp_purpose() {
            self.gate.verify(actor_id, workflow_id, purpose, otp)?;
        }

        let now = self.clock.now();
        let grades: Vec<GradeRecord> = if action == Action::Submit {
            self.store
                .load_grade_records(workflow_id)?
                .into_iter()
                .map(|r| GradeRecord::graded(workflow_id, &r.student_id, r.marks, &self.grader, now))
                .collect()
        } else {
            Vec::new()
        };

        let updated = ResultWorkflow {
            status: next,
            version: current.version + 1,
            updated_at: now,
            ..current.clone()
        };
        let entry = AuditEntry {
            workflow_id: workflow_id.to_string(),
            from_state: current.status,
            to_state: next,
            actor_id: actor_id.to_string(),
            timestamp: now,
            comment: comment.map(str::to_string),
        };
        self.store.save_workflow(
            &updated,
            current.version,
            Changes {
                audit: Some(&entry),
                grades: &grades,
                snapshot: action == Action::Submit,
            },
        )?;
        info!(
            from = current.status.as_str(),
            to = next.as_str(),
            version = updated.version,
            "transition committed"
        );

        self.notify(&updated, &entry);
        Ok(next)
    }

    fn notify(&self, workflow: &ResultWorkflow, entry: &AuditEntry) {
        let event = WorkflowEvent {
            workflow_id: workflow.id.clone(),
            batch_id: workflow.batch_id.clone(),
            course_id: workflow.course_id.clone(),
            semester: workflow.semester.clone(),
            from: entry.from_state,
            to: entry.to_state,
            actor_id: entry.actor_id.clone(),
            comment: entry.comment.clone(),
            audience: Audience::for_status(entry.to_state).to_vec(),
        };
        if let Err(e) = self.notifier.dispatch(&event) {
            warn!(workflow_id = %workflow.id, error = %e, "notification dispatch failed");
        }
    }
}
