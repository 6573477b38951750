#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use resultd::otp::OtpPurpose;
use resultd::ports::{NotifyError, TransportError};
use resultd::{
    Action, ComponentMarks, Course, CourseType, EngineDeps, EnrollmentStatus, ManualClock,
    NotificationSink, OtpTransport, ResultWorkflow, Role, ServiceConfig, SqliteStore, Store,
    TheoryMarks, WorkflowEngine, WorkflowEvent, WorkflowKey,
};
use std::sync::{Arc, Mutex};

pub const COURSE: &str = "CSE101";
pub const INSTRUCTOR: &str = "t-rahman";
pub const MEMBER_A: &str = "cm-karim";
pub const MEMBER_B: &str = "cm-sultana";

#[derive(Default)]
pub struct Outbox {
    pub delivered: Mutex<Vec<(String, OtpPurpose)>>,
}

impl OtpTransport for Outbox {
    fn deliver(&self, actor_id: &str, purpose: OtpPurpose, _code: &str) -> Result<(), TransportError> {
        self.delivered
            .lock()
            .expect("outbox")
            .push((actor_id.to_string(), purpose));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub fail: bool,
    pub events: Mutex<Vec<WorkflowEvent>>,
}

impl NotificationSink for RecordingSink {
    fn dispatch(&self, event: &WorkflowEvent) -> Result<(), NotifyError> {
        self.events.lock().expect("sink").push(event.clone());
        if self.fail {
            return Err(NotifyError("mail relay unreachable".to_string()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub engine: WorkflowEngine,
    pub outbox: Arc<Outbox>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
}

pub fn key(semester: &str) -> WorkflowKey {
    WorkflowKey {
        batch_id: "B21".to_string(),
        course_id: COURSE.to_string(),
        semester: semester.to_string(),
    }
}

pub fn seeded_store() -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::open_in_memory().expect("store"));
    store
        .upsert_course(&Course {
            id: COURSE.to_string(),
            code: "CSE 101".to_string(),
            title: "Structured Programming".to_string(),
            credit: 3.0,
            course_type: CourseType::Theory,
        })
        .expect("course");
    store.grant_role(INSTRUCTOR, COURSE, Role::Instructor).expect("instructor");
    store.grant_role(MEMBER_A, COURSE, Role::Committee).expect("committee a");
    store.grant_role(MEMBER_B, COURSE, Role::Committee).expect("committee b");
    for s in ["s-001", "s-002"] {
        store
            .set_enrollment(&key("2024-spring"), s, EnrollmentStatus::Active)
            .expect("enroll");
    }
    store
}

/// Builds an engine over `store`, optionally routing workflow reads and
/// writes through `wrap`.
pub fn harness_with(
    store: Arc<SqliteStore>,
    failing_sink: bool,
    wrap: impl FnOnce(Arc<SqliteStore>) -> Arc<dyn Store>,
) -> Harness {
    let outbox = Arc::new(Outbox::default());
    let sink = Arc::new(RecordingSink {
        fail: failing_sink,
        ..Default::default()
    });
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).single().expect("date"),
    ));
    let deps = EngineDeps {
        store: wrap(store.clone()),
        otp_store: store.clone(),
        identity: store.clone(),
        transport: outbox.clone(),
        notifier: sink.clone(),
        clock: clock.clone(),
    };
    let engine = WorkflowEngine::new(deps, &ServiceConfig::default());
    Harness {
        store,
        engine,
        outbox,
        sink,
        clock,
    }
}

pub fn harness() -> Harness {
    harness_with(seeded_store(), false, |s| s)
}

impl Harness {
    pub fn create(&self) -> ResultWorkflow {
        self.engine
            .create_workflow(&key("2024-spring"), INSTRUCTOR)
            .expect("create workflow")
    }

    pub fn otp(&self, workflow_id: &str, actor_id: &str, action: Action) -> String {
        self.engine
            .issue_otp(workflow_id, actor_id, action)
            .expect("issue otp")
            .code
    }

    pub fn status(&self, workflow_id: &str) -> resultd::WorkflowStatus {
        self.engine.workflow(workflow_id).expect("load").status
    }

    pub fn version(&self, workflow_id: &str) -> i64 {
        self.engine.workflow(workflow_id).expect("load").version
    }
}

pub fn theory(attendance: f64, midterm: f64, ca: Option<f64>, final_exam: f64) -> ComponentMarks {
    ComponentMarks::Theory(TheoryMarks {
        attendance: Some(attendance),
        midterm: Some(midterm),
        continuous_assessment: ca,
        final_exam: Some(final_exam),
    })
}
