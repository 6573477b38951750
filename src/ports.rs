//! Collaborator contracts the workflow core calls out to.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

use crate::otp::OtpPurpose;
use crate::workflow::WorkflowStatus;

#[derive(Debug, Error)]
#[error("identity lookup failed: {0}")]
pub struct IdentityError(pub String);

#[derive(Debug, Error)]
#[error("notification dispatch failed: {0}")]
pub struct NotifyError(pub String);

#[derive(Debug, Error)]
#[error("otp delivery failed: {0}")]
pub struct TransportError(pub String);

/// Course-scoped roles held by one actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub instructor_of: HashSet<String>,
    pub committee_of: HashSet<String>,
}

impl Capabilities {
    pub fn is_instructor_of(&self, course_id: &str) -> bool {
        self.instructor_of.contains(course_id)
    }

    pub fn is_committee_member_of(&self, course_id: &str) -> bool {
        self.committee_of.contains(course_id)
    }
}

pub trait IdentityProvider: Send + Sync {
    fn capabilities_of(&self, actor_id: &str) -> Result<Capabilities, IdentityError>;
}

pub trait OtpTransport: Send + Sync {
    fn deliver(&self, actor_id: &str, purpose: OtpPurpose, code: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Instructor,
    Committee,
    Students,
}

impl Audience {
    pub fn for_status(status: WorkflowStatus) -> &'static [Audience] {
        match status {
            WorkflowStatus::SubmittedToCommittee | WorkflowStatus::CommitteeApproved => {
                &[Audience::Committee]
            }
            WorkflowStatus::ReturnedToTeacher => &[Audience::Instructor],
            WorkflowStatus::Published => &[Audience::Instructor, Audience::Students],
            WorkflowStatus::WithInstructor => &[],
        }
    }
}

/// Emitted after a transition has been committed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub workflow_id: String,
    pub batch_id: String,
    pub course_id: String,
    pub semester: String,
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
    pub actor_id: String,
    pub comment: Option<String>,
    pub audience: Vec<Audience>,
}

pub trait NotificationSink: Send + Sync {
    fn dispatch(&self, event: &WorkflowEvent) -> Result<(), NotifyError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Writes workflow events to the log. Used when no delivery channel is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn dispatch(&self, event: &WorkflowEvent) -> Result<(), NotifyError> {
        info!(
            workflow_id = %event.workflow_id,
            course_id = %event.course_id,
            from = event.from.as_str(),
            to = event.to.as_str(),
            audience = ?event.audience,
            "workflow notification"
        );
        Ok(())
    }
}

/// Logs that a code was issued. The code itself is never logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOtpTransport;

impl OtpTransport for LogOtpTransport {
    fn deliver(&self, actor_id: &str, purpose: OtpPurpose, _code: &str) -> Result<(), TransportError> {
        info!(actor_id, purpose = purpose.as_str(), "otp issued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now() - start, Duration::seconds(90));
    }

    #[test]
    fn publish_reaches_students() {
        let aud = Audience::for_status(WorkflowStatus::Published);
        assert!(aud.contains(&Audience::Students));
        assert!(Audience::for_status(WorkflowStatus::WithInstructor).is_empty());
    }
}
