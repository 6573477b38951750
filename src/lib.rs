//! Academic result approval workflow: marks aggregation, committee review
//! with step-up one-time passcodes, an append-only audit trail and CGPA.

pub mod audit;
pub mod cgpa;
pub mod config;
pub mod db;
pub mod grading;
pub mod ipc;
pub mod otp;
pub mod ports;
pub mod store;
pub mod telemetry;
pub mod workflow;

pub use audit::{AuditEntry, AuditTrail};
pub use cgpa::{calculate_cgpa, CgpaSummary, PublishedGrade};
pub use config::{OtpPolicy, ServiceConfig};
pub use grading::{
    ComponentMarks, CourseType, CourseWeights, GradeAggregator, GradeOutcome, GradingScale,
    GradingScaleEntry, LabMarks, TheoryMarks,
};
pub use otp::{IssuedOtp, OtpPurpose, StepUpAuthGate};
pub use ports::{
    Capabilities, Clock, IdentityProvider, ManualClock, NotificationSink, OtpTransport,
    SystemClock, WorkflowEvent,
};
pub use store::{Course, EnrollmentStatus, GradeRecord, Role, SqliteStore, Store};
pub use workflow::{
    Action, EngineDeps, ResultWorkflow, WorkflowEngine, WorkflowError, WorkflowKey,
    WorkflowStatus,
};
