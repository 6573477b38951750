//! Service settings persisted as JSON rows in the workspace database and
//! layered over compiled defaults.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db;
use crate::grading::{CourseWeights, GradeAggregator, GradingScale, ScaleError};
use crate::store::StoreError;

pub const GRADING_SCALE_KEY: &str = "grading.scale";
pub const GRADING_WEIGHTS_KEY: &str = "grading.weights";
pub const OTP_POLICY_KEY: &str = "otp.policy";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Scale(#[from] ScaleError),
    #[error("invalid course weights: {0}")]
    Weights(String),
    #[error("invalid otp policy: {0}")]
    Otp(String),
    #[error("malformed setting {key}: {source}")]
    Malformed {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OtpPolicy {
    pub ttl_secs: i64,
    pub code_digits: u32,
    /// Return issued codes in the `otp.issue` response. Local testing only.
    pub expose_codes: bool,
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            code_digits: 6,
            expose_codes: false,
        }
    }
}

impl OtpPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(30..=3600).contains(&self.ttl_secs) {
            return Err(ConfigError::Otp(
                "ttlSecs must be between 30 and 3600".to_string(),
            ));
        }
        if !(4..=9).contains(&self.code_digits) {
            return Err(ConfigError::Otp(
                "codeDigits must be between 4 and 9".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub scale: GradingScale,
    pub weights: CourseWeights,
    pub otp: OtpPolicy,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate().map_err(ConfigError::Weights)?;
        self.otp.validate()
    }

    pub fn aggregator(&self) -> GradeAggregator {
        GradeAggregator::new(self.scale.clone(), self.weights)
    }
}

fn section<T>(conn: &Connection, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: for<'de> Deserialize<'de>,
{
    let Some(raw) = db::settings_get_json(conn, key)? else {
        return Ok(None);
    };
    serde_json::from_value(raw)
        .map(Some)
        .map_err(|source| ConfigError::Malformed { key, source })
}

/// Reads every section, falling back to the default for absent keys.
pub fn load(conn: &Connection) -> Result<ServiceConfig, ConfigError> {
    let defaults = ServiceConfig::default();
    let cfg = ServiceConfig {
        scale: section(conn, GRADING_SCALE_KEY)?.unwrap_or(defaults.scale),
        weights: section(conn, GRADING_WEIGHTS_KEY)?.unwrap_or(defaults.weights),
        otp: section(conn, OTP_POLICY_KEY)?.unwrap_or(defaults.otp),
    };
    cfg.validate()?;
    Ok(cfg)
}

pub fn save(conn: &Connection, cfg: &ServiceConfig) -> Result<(), ConfigError> {
    cfg.validate()?;
    let to_value = |key: &'static str, v: serde_json::Result<serde_json::Value>| {
        v.map_err(|source| ConfigError::Malformed { key, source })
    };
    db::settings_set_json(
        conn,
        GRADING_SCALE_KEY,
        &to_value(GRADING_SCALE_KEY, serde_json::to_value(&cfg.scale))?,
    )?;
    db::settings_set_json(
        conn,
        GRADING_WEIGHTS_KEY,
        &to_value(GRADING_WEIGHTS_KEY, serde_json::to_value(cfg.weights))?,
    )?;
    db::settings_set_json(
        conn,
        OTP_POLICY_KEY,
        &to_value(OTP_POLICY_KEY, serde_json::to_value(cfg.otp))?,
    )?;
    Ok(())
}
