//! Device and session identity.
//!
//! The device id is created once and persisted in local storage so it is the
//! same across restarts. The session id is new for every `DeviceSession`
//! (i.e. every process start) and never persisted.
//!
//! Ids are `<prefix>_<unix millis>_<9 random chars>`. They only need to tell
//! concurrent devices apart, not resist collision attacks.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use uuid::Uuid;

use crate::storage::{LocalStorage, DEVICE_ID_KEY};

/// Identity of one connected device/tab.
pub struct DeviceSession {
    storage: Arc<dyn LocalStorage>,
    device_id: OnceLock<String>,
    session_id: String,
}

impl DeviceSession {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            storage,
            device_id: OnceLock::new(),
            session_id: generate_id("session"),
        }
    }

    /// Stable device id, created and persisted on first use.
    pub fn device_id(&self) -> &str {
        self.device_id.get_or_init(|| self.load_or_create_device_id())
    }

    /// Id unique to this process lifetime.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn load_or_create_device_id(&self) -> String {
        match self.storage.get_item(DEVICE_ID_KEY) {
            Ok(Some(existing)) if !existing.trim().is_empty() => return existing,
            Ok(_) => {}
            Err(e) => log::warn!("Failed to read device id, generating a new one: {e}"),
        }

        let device_id = generate_id("device");
        if let Err(e) = self.storage.set_item(DEVICE_ID_KEY, &device_id) {
            log::warn!("Failed to persist device id {device_id}: {e}");
        }
        log::info!("Generated device id {device_id}");
        device_id
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.device_id.get())
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// `<prefix>_<unix millis>_<random suffix>`.
pub(crate) fn generate_id(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let random = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{millis}_{}", &random[..9])
}
