//! Step-up authentication: single-use, time-limited codes bound to one
//! (actor, workflow, purpose) triple.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::OtpPolicy;
use crate::ports::{Clock, OtpTransport};
use crate::store::{OtpStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    ResultApproval,
    ResultReturn,
    ResultPublication,
}

impl OtpPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            OtpPurpose::ResultApproval => "result_approval",
            OtpPurpose::ResultReturn => "result_return",
            OtpPurpose::ResultPublication => "result_publication",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "result_approval" => Some(OtpPurpose::ResultApproval),
            "result_return" => Some(OtpPurpose::ResultReturn),
            "result_publication" => Some(OtpPurpose::ResultPublication),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OtpChallenge {
    pub id: String,
    pub actor_id: String,
    pub workflow_id: String,
    pub purpose: OtpPurpose,
    /// Hex SHA-256 of `"{id}:{code}"`.
    pub code_digest: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedOtp {
    pub challenge_id: String,
    pub purpose: OtpPurpose,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub code: String,
}

#[derive(Debug, Error)]
pub enum OtpError {
    #[error("one-time passcode is invalid or expired")]
    InvalidOrExpired,
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn code_digest(challenge_id: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge_id.as_bytes());
    hasher.update(b":");
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn digests_match(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn generate_code(digits: u32) -> String {
    let upper = 10u32.pow(digits);
    let n = rand::rng().random_range(0..upper);
    format!("{:0width$}", n, width = digits as usize)
}

pub struct StepUpAuthGate {
    store: Arc<dyn OtpStore>,
    transport: Arc<dyn OtpTransport>,
    clock: Arc<dyn Clock>,
    policy: OtpPolicy,
}

impl StepUpAuthGate {
    pub fn new(
        store: Arc<dyn OtpStore>,
        transport: Arc<dyn OtpTransport>,
        clock: Arc<dyn Clock>,
        policy: OtpPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &OtpPolicy {
        &self.policy
    }

    /// Creates a fresh challenge, superseding any unused one for the same
    /// triple, and hands the code to the transport.
    pub fn issue(
        &self,
        actor_id: &str,
        workflow_id: &str,
        purpose: OtpPurpose,
    ) -> Result<IssuedOtp, StoreError> {
        let now = self.clock.now();
        let id = Uuid::new_v4().to_string();
        let code = generate_code(self.policy.code_digits);
        let challenge = OtpChallenge {
            code_digest: code_digest(&id, &code),
            id: id.clone(),
            actor_id: actor_id.to_string(),
            workflow_id: workflow_id.to_string(),
            purpose,
            created_at: now,
            expires_at: now + Duration::seconds(self.policy.ttl_secs),
            used: false,
        };
        self.store.insert_challenge(&challenge)?;

        // Delivery is best-effort; the challenge stays valid either way.
        if let Err(e) = self.transport.deliver(actor_id, purpose, &code) {
            warn!(actor_id, workflow_id, purpose = purpose.as_str(), error = %e, "otp delivery failed");
        }

        Ok(IssuedOtp {
            challenge_id: id,
            purpose,
            expires_at: challenge.expires_at,
            code,
        })
    }

    /// Consumes the outstanding challenge for the triple and checks `code`
    /// against it. The challenge is spent whether or not the check passes.
    pub fn verify(
        &self,
        actor_id: &str,
        workflow_id: &str,
        purpose: OtpPurpose,
        code: Option<&str>,
    ) -> Result<(), OtpError> {
        let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
            return Err(OtpError::InvalidOrExpired);
        };
        let Some(challenge) = self.store.take_challenge(actor_id, workflow_id, purpose)? else {
            debug!(actor_id, workflow_id, purpose = purpose.as_str(), "no outstanding challenge");
            return Err(OtpError::InvalidOrExpired);
        };
        if challenge.used {
            return Err(OtpError::InvalidOrExpired);
        }
        if self.clock.now() >= challenge.expires_at {
            debug!(challenge_id = %challenge.id, "challenge expired");
            return Err(OtpError::InvalidOrExpired);
        }
        if !digests_match(&challenge.code_digest, &code_digest(&challenge.id, code)) {
            debug!(challenge_id = %challenge.id, "code mismatch");
            return Err(OtpError::InvalidOrExpired);
        }
        Ok(())
    }
}
