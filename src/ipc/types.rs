use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

use crate::config::ServiceConfig;
use crate::ports::{LogNotificationSink, LogOtpTransport, SystemClock};
use crate::store::SqliteStore;
use crate::workflow::{EngineDeps, WorkflowEngine};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub store: Option<Arc<SqliteStore>>,
    pub engine: Option<WorkflowEngine>,
    pub config: ServiceConfig,
}

impl AppState {
    /// Wires a fresh engine over `store` with the given settings.
    pub fn attach(&mut self, store: Arc<SqliteStore>, config: ServiceConfig) {
        let deps = EngineDeps {
            store: store.clone(),
            otp_store: store.clone(),
            identity: store.clone(),
            transport: Arc::new(LogOtpTransport),
            notifier: Arc::new(LogNotificationSink),
            clock: Arc::new(SystemClock),
        };
        self.engine = Some(WorkflowEngine::new(deps, &config));
        self.store = Some(store);
        self.config = config;
    }
}
