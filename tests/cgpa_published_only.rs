mod support;

use resultd::{Action, Course, CourseType, EnrollmentStatus, Role, WorkflowKey};
use support::*;

fn course(id: &str, credit: f64) -> Course {
    Course {
        id: id.to_string(),
        code: id.to_string(),
        title: format!("Course {id}"),
        credit,
        course_type: CourseType::Theory,
    }
}

fn key_for(course_id: &str, semester: &str) -> WorkflowKey {
    WorkflowKey {
        batch_id: "B21".to_string(),
        course_id: course_id.to_string(),
        semester: semester.to_string(),
    }
}

#[test]
fn cgpa_weights_published_results_by_credit() {
    let store = seeded_store();
    for (id, credit) in [("MAT201", 3.0), ("PHY101", 4.0), ("EEE105", 3.0)] {
        store.upsert_course(&course(id, credit)).expect("course");
        store.grant_role(INSTRUCTOR, id, Role::Instructor).expect("instructor");
        store.grant_role(MEMBER_A, id, Role::Committee).expect("committee");
    }
    let h = harness_with(store.clone(), false, |s| s);

    // (course, semester, final exam mark, publish?)
    let plan = [
        ("MAT201", "2024-spring", 42.0, true),
        ("PHY101", "2024-fall", 32.0, true),
        ("EEE105", "2024-fall", 55.0, false),
    ];
    for (course_id, semester, final_exam, publish) in plan {
        let k = key_for(course_id, semester);
        store
            .set_enrollment(&k, "s-001", EnrollmentStatus::Active)
            .expect("enroll");
        let wf = h.engine.create_workflow(&k, INSTRUCTOR).expect("create");
        h.engine
            .enter_marks(&wf.id, INSTRUCTOR, "s-001", theory(8.0, 15.0, Some(7.0), final_exam))
            .expect("marks");
        h.engine.submit(&wf.id, INSTRUCTOR).expect("submit");
        let code = h.otp(&wf.id, MEMBER_A, Action::Approve);
        h.engine.approve(&wf.id, MEMBER_A, Some(&code)).expect("approve");
        if publish {
            let code = h.otp(&wf.id, MEMBER_A, Action::Publish);
            h.engine.publish(&wf.id, MEMBER_A, Some(&code)).expect("publish");
        }
    }

    // 72 -> A- (3.5) over 3 credits, 62 -> B (3.0) over 4 credits. The
    // approved-but-unpublished 85 (A+) does not count.
    let summary = h.engine.calculate_cgpa("s-001").expect("cgpa");
    assert!((summary.cgpa - (3.5 * 3.0 + 3.0 * 4.0) / 7.0).abs() < 1e-9);
    assert_eq!(summary.cgpa_rounded, 3.21);
    assert_eq!(summary.total_credits, 7.0);
    assert_eq!(summary.course_count, 2);
    let semesters: Vec<_> = summary.semesters.iter().map(|s| s.semester.as_str()).collect();
    assert_eq!(semesters, vec!["2024-fall", "2024-spring"]);

    assert_eq!(h.engine.calculate_cgpa("s-001").expect("again"), summary);
}

#[test]
fn student_without_published_results_has_zero_cgpa() {
    let h = harness();
    let wf = h.create();
    h.engine
        .enter_marks(&wf.id, INSTRUCTOR, "s-001", theory(10.0, 25.0, Some(15.0), 40.0))
        .expect("marks");
    h.engine.submit(&wf.id, INSTRUCTOR).expect("submit");

    let summary = h.engine.calculate_cgpa("s-001").expect("cgpa");
    assert_eq!(summary.cgpa, 0.0);
    assert_eq!(summary.course_count, 0);
    assert!(summary.semesters.is_empty());
}

fn publish_cycle(h: &Harness, final_exam: f64) -> resultd::ResultWorkflow {
    let wf = h.create();
    h.engine
        .enter_marks(&wf.id, INSTRUCTOR, "s-001", theory(8.0, 15.0, Some(7.0), final_exam))
        .expect("marks");
    h.engine.submit(&wf.id, INSTRUCTOR).expect("submit");
    let code = h.otp(&wf.id, MEMBER_A, Action::Approve);
    h.engine.approve(&wf.id, MEMBER_A, Some(&code)).expect("approve");
    let code = h.otp(&wf.id, MEMBER_A, Action::Publish);
    h.engine.publish(&wf.id, MEMBER_A, Some(&code)).expect("publish");
    wf
}

#[test]
fn republished_result_replaces_the_earlier_cycle() {
    let h = harness();
    publish_cycle(&h, 42.0);

    // A reopened cycle counts for nothing until it is published.
    let reopened = h.create();
    let summary = h.engine.calculate_cgpa("s-001").expect("cgpa");
    assert_eq!(summary.course_count, 1);
    assert_eq!(summary.cgpa, 3.5);

    h.engine
        .enter_marks(&reopened.id, INSTRUCTOR, "s-001", theory(8.0, 15.0, Some(7.0), 32.0))
        .expect("marks");
    h.engine.submit(&reopened.id, INSTRUCTOR).expect("submit");
    let code = h.otp(&reopened.id, MEMBER_A, Action::Approve);
    h.engine.approve(&reopened.id, MEMBER_A, Some(&code)).expect("approve");
    let code = h.otp(&reopened.id, MEMBER_A, Action::Publish);
    h.engine.publish(&reopened.id, MEMBER_A, Some(&code)).expect("publish");

    let summary = h.engine.calculate_cgpa("s-001").expect("cgpa");
    assert_eq!(summary.total_credits, 3.0);
    assert_eq!(summary.course_count, 1);
    assert_eq!(summary.cgpa, 3.0);
}

#[test]
fn credit_changes_after_publication_do_not_rewrite_cgpa() {
    let h = harness();
    publish_cycle(&h, 42.0);
    h.store
        .upsert_course(&Course {
            credit: 4.0,
            ..course(COURSE, 3.0)
        })
        .expect("raise credit");

    let summary = h.engine.calculate_cgpa("s-001").expect("cgpa");
    assert_eq!(summary.total_credits, 3.0);
    assert_eq!(summary.cgpa, 3.5);
}
