//! Configurable constants (§6). Every default matches the spec table;
//! override via the `DL_SESSION_*` environment variables for deployments
//! that need a different pool size or rotation cadence without a rebuild.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Target one-time-prekey pool size.
    pub one_time_prekey_target: u32,
    /// Pool size at or below which a refill is triggered.
    pub min_pool: u32,
    /// Prekeys included per upload request.
    pub max_upload_batch: u32,
    /// Age after which a signed prekey is rotated on next `initialize`.
    pub signed_prekey_ttl: Duration,
    /// Upper bound on skipped message keys cached per ratchet step.
    pub max_skip: u64,
    /// Bounded timeout for remote bundle fetch/upload.
    pub network_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            one_time_prekey_target: 100,
            min_pool: 20,
            max_upload_batch: 50,
            signed_prekey_ttl: Duration::from_secs(7 * 24 * 3600),
            max_skip: dl_crypto::ratchet::MAX_SKIP,
            network_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Overlay `DL_SESSION_ONE_TIME_PREKEY_TARGET`, `DL_SESSION_MIN_POOL`,
    /// `DL_SESSION_MAX_UPLOAD_BATCH`, `DL_SESSION_SIGNED_PREKEY_TTL_SECS`,
    /// and `DL_SESSION_NETWORK_TIMEOUT_SECS` onto the defaults, where set.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_u32("DL_SESSION_ONE_TIME_PREKEY_TARGET") {
            cfg.one_time_prekey_target = v;
        }
        if let Some(v) = env_u32("DL_SESSION_MIN_POOL") {
            cfg.min_pool = v;
        }
        if let Some(v) = env_u32("DL_SESSION_MAX_UPLOAD_BATCH") {
            cfg.max_upload_batch = v;
        }
        if let Some(v) = env_u64("DL_SESSION_SIGNED_PREKEY_TTL_SECS") {
            cfg.signed_prekey_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("DL_SESSION_NETWORK_TIMEOUT_SECS") {
            cfg.network_timeout = Duration::from_secs(v);
        }
        cfg
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
