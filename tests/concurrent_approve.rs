mod support;

use resultd::audit::AuditEntry;
use resultd::cgpa::PublishedGrade;
use resultd::store::{Changes, GradeSnapshot, StoreError};
use resultd::{
    Action, Course, GradeRecord, ResultWorkflow, SqliteStore, Store, WorkflowError, WorkflowKey,
    WorkflowStatus,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use support::*;

/// Holds every armed `load_workflow` caller until both racers have read the
/// same version.
struct RendezvousStore {
    inner: Arc<SqliteStore>,
    armed: AtomicBool,
    barrier: Barrier,
}

impl Store for RendezvousStore {
    fn load_workflow(&self, workflow_id: &str) -> Result<Option<ResultWorkflow>, StoreError> {
        let loaded = self.inner.load_workflow(workflow_id)?;
        if self.armed.load(Ordering::SeqCst) {
            self.barrier.wait();
        }
        Ok(loaded)
    }

    fn create_workflow(&self, workflow: &ResultWorkflow, seed: &[GradeRecord]) -> Result<(), StoreError> {
        self.inner.create_workflow(workflow, seed)
    }

    fn save_workflow(
        &self,
        workflow: &ResultWorkflow,
        expected_version: i64,
        changes: Changes<'_>,
    ) -> Result<(), StoreError> {
        self.inner.save_workflow(workflow, expected_version, changes)
    }

    fn load_grade_records(&self, workflow_id: &str) -> Result<Vec<GradeRecord>, StoreError> {
        self.inner.load_grade_records(workflow_id)
    }

    fn snapshots(&self, workflow_id: &str) -> Result<Vec<GradeSnapshot>, StoreError> {
        self.inner.snapshots(workflow_id)
    }

    fn audit_history(&self, workflow_id: &str) -> Result<Vec<AuditEntry>, StoreError> {
        self.inner.audit_history(workflow_id)
    }

    fn published_grades(&self, student_id: &str) -> Result<Vec<PublishedGrade>, StoreError> {
        self.inner.published_grades(student_id)
    }

    fn course(&self, course_id: &str) -> Result<Option<Course>, StoreError> {
        self.inner.course(course_id)
    }

    fn active_enrollments(&self, key: &WorkflowKey) -> Result<Vec<String>, StoreError> {
        self.inner.active_enrollments(key)
    }
}

#[test]
fn exactly_one_of_two_racing_approvals_commits() {
    let mut rendezvous = None;
    let h = harness_with(seeded_store(), false, |inner| {
        let store = Arc::new(RendezvousStore {
            inner,
            armed: AtomicBool::new(false),
            barrier: Barrier::new(2),
        });
        rendezvous = Some(store.clone());
        let erased: Arc<dyn Store> = store;
        erased
    });
    let rendezvous = rendezvous.expect("wrapped store");

    let wf = h.create();
    h.engine.submit(&wf.id, INSTRUCTOR).expect("submit");
    let code_a = h.otp(&wf.id, MEMBER_A, Action::Approve);
    let code_b = h.otp(&wf.id, MEMBER_B, Action::Approve);
    let loaded_version = h.version(&wf.id);

    rendezvous.armed.store(true, Ordering::SeqCst);
    let engine = &h.engine;
    let id = wf.id.as_str();
    let (a, b) = thread::scope(|s| {
        let a = s.spawn(|| engine.approve(id, MEMBER_A, Some(&code_a)));
        let b = s.spawn(|| engine.approve(id, MEMBER_B, Some(&code_b)));
        (
            a.join().expect("racer a panicked"),
            b.join().expect("racer b panicked"),
        )
    });
    rendezvous.armed.store(false, Ordering::SeqCst);

    let outcomes = [a, b];
    let won = outcomes
        .iter()
        .filter(|r| matches!(r, Ok(WorkflowStatus::CommitteeApproved)))
        .count();
    let lost = outcomes
        .iter()
        .filter(|r| matches!(r, Err(WorkflowError::ConcurrentModification(_))))
        .count();
    assert_eq!((won, lost), (1, 1), "{outcomes:?}");

    let current = h.engine.workflow(&wf.id).expect("load");
    assert_eq!(current.status, WorkflowStatus::CommitteeApproved);
    assert_eq!(current.version, loaded_version + 1);

    let history = h.engine.history(&wf.id).expect("history");
    let approvals = history
        .iter()
        .filter(|e| e.to_state == WorkflowStatus::CommitteeApproved)
        .count();
    assert_eq!(approvals, 1);
    assert_eq!(h.sink.events.lock().expect("sink").len(), 2);
}
