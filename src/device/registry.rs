use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, DeviceQuotas, EvictionStrategy};
use crate::db::models::{Device, DeviceActivity, DeviceClass, DeviceStatus, DeviceType, NewDevice};
use crate::db::store::{DeviceStore, SessionStore};
use crate::device::cache::OnlineCache;
use crate::device::identity::{DeviceIdentity, FingerprintInput};
use crate::error::{AppError, DatabaseError, DeviceError};
use crate::reaper::Reaper;
use crate::sources::Clock;
use crate::Result;

#[derive(Debug, Clone)]
pub struct DevicePolicy {
    pub quotas: DeviceQuotas,
    pub online_timeout: Duration,
    pub strategy: EvictionStrategy,
    pub auto_evict: bool,
    pub sweep_interval: std::time::Duration,
    pub heartbeat_write_interval: Duration,
}

impl DevicePolicy {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            quotas: config.quotas,
            online_timeout: Duration::minutes(config.online_timeout_minutes),
            strategy: config.strategy,
            auto_evict: config.auto_evict,
            sweep_interval: std::time::Duration::from_secs(config.sweep_interval_secs),
            heartbeat_write_interval: Duration::seconds(config.heartbeat_write_interval_secs),
        }
    }

    pub fn quota_for(&self, class: DeviceClass) -> u32 {
        match class {
            DeviceClass::Mobile => self.quotas.mobile,
            DeviceClass::Pc => self.quotas.pc,
            DeviceClass::Web => self.quotas.web,
            DeviceClass::MiniProgram => self.quotas.miniprogram,
        }
    }
}

// Column widths of the `devices` table.
const MAX_FINGERPRINT_LEN: usize = 128;
const MAX_DEVICE_NAME_LEN: usize = 128;
const MAX_ATTRIBUTE_LEN: usize = 64;
const MAX_USER_AGENT_LEN: usize = 512;

fn check_len(field: &str, value: Option<&str>, max: usize) -> Result<()> {
    match value {
        Some(v) if v.chars().count() > max => Err(AppError::ValidationError(format!(
            "{} must be at most {} characters",
            field, max
        ))),
        _ => Ok(()),
    }
}

/// What the client reports about itself at login.
#[derive(Debug, Clone)]
pub struct LoginDevice {
    pub device_type: DeviceType,
    /// Client-computed fingerprint. Derived server-side when absent.
    pub fingerprint: Option<String>,
    pub device_name: Option<String>,
    pub platform: Option<String>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl LoginDevice {
    pub fn new(device_type: DeviceType) -> Self {
        Self {
            device_type,
            fingerprint: None,
            device_name: None,
            platform: None,
            os_version: None,
            app_version: None,
            client_ip: None,
            user_agent: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Rejects attributes that do not fit the device record.
    pub fn validate(&self) -> Result<()> {
        check_len("fingerprint", self.fingerprint.as_deref(), MAX_FINGERPRINT_LEN)?;
        check_len("device_name", self.device_name.as_deref(), MAX_DEVICE_NAME_LEN)?;
        check_len("platform", self.platform.as_deref(), MAX_ATTRIBUTE_LEN)?;
        check_len("os_version", self.os_version.as_deref(), MAX_ATTRIBUTE_LEN)?;
        check_len("app_version", self.app_version.as_deref(), MAX_ATTRIBUTE_LEN)?;
        check_len("client_ip", self.client_ip.as_deref(), MAX_ATTRIBUTE_LEN)?;
        check_len("user_agent", self.user_agent.as_deref(), MAX_USER_AGENT_LEN)
    }

    fn fingerprint_input(&self) -> FingerprintInput {
        FingerprintInput {
            platform: self.platform.clone().unwrap_or_default(),
            os_version: self.os_version.clone().unwrap_or_default(),
            app_version: self.app_version.clone().unwrap_or_default(),
            client_ip: self.client_ip.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub device: Device,
    /// False when an existing device of the same user logged in again.
    pub created: bool,
    pub evicted: Option<Device>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KickReport {
    pub kicked: Vec<String>,
    /// Unknown ids and ids owned by someone else, indistinguishably.
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: Device,
    pub online: bool,
}

/// Picks the eviction victim within one quota class: the smallest
/// `last_active_at`, ties going to the smallest record id.
pub fn select_eviction_victim(candidates: &[Device], strategy: EvictionStrategy) -> Option<&Device> {
    match strategy {
        EvictionStrategy::Oldest => candidates
            .iter()
            .min_by(|a, b| (a.last_active_at, a.id).cmp(&(b.last_active_at, b.id))),
    }
}

pub struct DeviceRegistry {
    devices: Arc<dyn DeviceStore>,
    sessions: Arc<dyn SessionStore>,
    cache: OnlineCache,
    identity: DeviceIdentity,
    policy: DevicePolicy,
    clock: Arc<dyn Clock>,
    reaper: Reaper,
}

impl DeviceRegistry {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        sessions: Arc<dyn SessionStore>,
        identity: DeviceIdentity,
        policy: DevicePolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let reaper = Reaper::new("device-offline-sweep", policy.sweep_interval);
        Self {
            devices,
            sessions,
            cache: OnlineCache::new(),
            identity,
            policy,
            clock,
            reaper,
        }
    }

    pub fn policy(&self) -> &DevicePolicy {
        &self.policy
    }

    pub fn cache(&self) -> &OnlineCache {
        &self.cache
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Binds the login to a device record, creating one (and evicting to make
    /// room) when the fingerprint is new.
    pub async fn register_login(&self, user_id: i64, login: &LoginDevice) -> Result<Registration> {
        if user_id <= 0 {
            return Err(AppError::ValidationError("user id must be positive".into()));
        }
        login.validate()?;
        let now = self.clock.now();
        let fingerprint = match login.fingerprint.as_deref().map(str::trim) {
            Some(fp) if !fp.is_empty() => fp.to_string(),
            _ => self.identity.fingerprint(login.device_type, &login.fingerprint_input()),
        };

        if let Some(device) = self.login_existing(user_id, &fingerprint, login, now).await? {
            return Ok(Registration { device, created: false, evicted: None });
        }

        let class = login.device_type.class();
        let evicted = self.enforce_quota(user_id, class).await?;

        let new_device = NewDevice {
            device_id: self
                .identity
                .generate_device_id(login.device_type, user_id, &fingerprint),
            device_fingerprint: fingerprint.clone(),
            device_type: login.device_type,
            user_id,
            device_name: login.device_name.clone(),
            platform: login.platform.clone(),
            os_version: login.os_version.clone(),
            app_version: login.app_version.clone(),
            last_ip: login.client_ip.clone(),
            user_agent: login.user_agent.clone(),
            login_at: now,
        };

        let device = match self.devices.create_device(&new_device).await {
            Ok(device) => device,
            Err(AppError::DatabaseError(DatabaseError::Duplicate)) => {
                // Lost a race against a concurrent login for the same fingerprint.
                if let Some(winner) = self.devices.get_by_fingerprint(&fingerprint).await? {
                    if winner.user_id != user_id {
                        warn!(user_id = user_id, "fingerprint claimed concurrently by another account");
                        return Err(DeviceError::Conflict.into());
                    }
                }
                warn!(user_id = user_id, device_type = %login.device_type, "concurrent device registration lost");
                return Err(DatabaseError::Duplicate.into());
            }
            Err(e) => return Err(e),
        };

        self.cache.mark_online(&device.device_id, user_id, now);
        info!(
            user_id = user_id,
            device_id = %device.device_id,
            device_type = %device.device_type,
            evicted = evicted.as_ref().map(|d| d.device_id.as_str()).unwrap_or(""),
            "device registered"
        );
        Ok(Registration { device, created: true, evicted })
    }

    async fn login_existing(
        &self,
        user_id: i64,
        fingerprint: &str,
        login: &LoginDevice,
        now: DateTime<Utc>,
    ) -> Result<Option<Device>> {
        let Some(existing) = self.devices.get_by_fingerprint(fingerprint).await? else {
            return Ok(None);
        };
        if existing.user_id != user_id {
            warn!(
                user_id = user_id,
                device_id = %existing.device_id,
                "login presented a fingerprint bound to another account"
            );
            return Err(DeviceError::Conflict.into());
        }

        let activity = DeviceActivity {
            at: now,
            ip: login.client_ip.clone(),
            user_agent: login.user_agent.clone(),
            login: true,
        };
        if !self.devices.update_activity(&existing.device_id, &activity).await? {
            // Removed between lookup and update; register it afresh.
            return Ok(None);
        }
        let device = self
            .devices
            .get_by_device_id(&existing.device_id)
            .await?
            .ok_or(AppError::DatabaseError(DatabaseError::NotFound))?;

        self.cache.mark_online(&device.device_id, user_id, now);
        info!(user_id = user_id, device_id = %device.device_id, "known device logged in");
        Ok(Some(device))
    }

    /// Makes room for one more device in `class`. Returns the evicted device, if any.
    pub async fn enforce_quota(&self, user_id: i64, class: DeviceClass) -> Result<Option<Device>> {
        let limit = u64::from(self.policy.quota_for(class));
        let count = self.devices.count_by_user_and_class(user_id, class).await?;
        if count < limit {
            return Ok(None);
        }
        if !self.policy.auto_evict {
            info!(user_id = user_id, class = %class, count = count, "device quota reached");
            return Err(DeviceError::QuotaExceeded.into());
        }

        let candidates: Vec<Device> = self
            .devices
            .list_by_user(user_id)
            .await?
            .into_iter()
            .filter(|d| class.contains(d.device_type))
            .collect();
        let Some(victim) = select_eviction_victim(&candidates, self.policy.strategy).cloned() else {
            // Counted devices vanished before listing; room was made for us.
            return Ok(None);
        };

        self.remove_device(&victim).await?;
        info!(
            user_id = user_id,
            device_id = %victim.device_id,
            class = %class,
            "evicted oldest device to respect quota"
        );
        Ok(Some(victim))
    }

    /// Device record first, then sessions, then cache. A refresh racing this
    /// sees either a missing device or a missing session.
    async fn remove_device(&self, device: &Device) -> Result<()> {
        self.devices.delete(&device.device_id).await?;
        let sessions = self.sessions.delete_all_for_device(&device.device_id).await?;
        self.cache.forget(&device.device_id, self.clock.now());
        debug!(device_id = %device.device_id, sessions = sessions, "device removed");
        Ok(())
    }

    /// Folds in activity this process absorbed without writing it through.
    fn with_cached_activity(&self, mut device: Device) -> Device {
        if device.status == DeviceStatus::Online {
            if let Some(at) = self.cache.last_active_at(&device.device_id) {
                if at > device.last_active_at {
                    device.last_active_at = at;
                }
            }
        }
        device
    }

    /// Live lookup used by refresh and strong session checks. The store
    /// decides existence and ownership.
    pub async fn verify_device_live(&self, user_id: i64, device_id: &str) -> Result<Device> {
        let device = self
            .devices
            .get_by_device_id(device_id)
            .await?
            .map(|d| self.with_cached_activity(d))
            .ok_or(AppError::DeviceError(DeviceError::Revoked))?;
        if device.user_id != user_id {
            warn!(user_id = user_id, device_id = %device_id, "device owner does not match credentials");
            return Err(DeviceError::Revoked.into());
        }
        if !device.is_online_at(self.clock.now(), self.policy.online_timeout) {
            debug!(user_id = user_id, device_id = %device_id, "device no longer online");
            return Err(DeviceError::Revoked.into());
        }
        Ok(device)
    }

    /// Records activity for a device. Within the heartbeat write interval of
    /// the last store write only the online cache is updated, so address and
    /// user-agent changes reach the store at the next write.
    pub async fn heartbeat(
        &self,
        user_id: i64,
        device_id: &str,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<bool> {
        let now = self.clock.now();
        if self
            .cache
            .touch(device_id, user_id, now, self.policy.heartbeat_write_interval)
        {
            return Ok(true);
        }
        let activity = DeviceActivity { at: now, ip, user_agent, login: false };
        let updated = self.devices.update_activity(device_id, &activity).await?;
        // False as well when a removal landed between the write and the cache update.
        Ok(updated && self.cache.mark_online(device_id, user_id, now))
    }

    /// Runs the heartbeat off the request path. Failures are logged and dropped.
    pub fn heartbeat_detached(
        self: &Arc<Self>,
        user_id: i64,
        device_id: String,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            match registry.heartbeat(user_id, &device_id, ip, user_agent).await {
                Ok(true) => {}
                Ok(false) => debug!(user_id = user_id, device_id = %device_id, "heartbeat for unknown device"),
                Err(e) => warn!(user_id = user_id, device_id = %device_id, error = %e, "heartbeat update failed"),
            }
        })
    }

    pub async fn mark_offline(&self, device_id: &str) -> Result<bool> {
        self.cache.mark_offline(device_id);
        self.devices.set_offline(device_id).await
    }

    /// Removes the listed devices of `user_id`. Ids that are unknown or owned
    /// by another user are reported as rejected and left untouched.
    pub async fn kick(&self, user_id: i64, device_ids: &[String]) -> Result<KickReport> {
        let mut report = KickReport::default();
        for device_id in device_ids {
            match self.devices.get_by_device_id(device_id).await? {
                Some(device) if device.user_id == user_id => {
                    self.remove_device(&device).await?;
                    report.kicked.push(device_id.clone());
                }
                Some(_) => {
                    warn!(user_id = user_id, device_id = %device_id, "refused to kick a device owned by another account");
                    report.rejected.push(device_id.clone());
                }
                None => report.rejected.push(device_id.clone()),
            }
        }
        info!(
            user_id = user_id,
            kicked = report.kicked.len(),
            rejected = report.rejected.len(),
            "devices kicked"
        );
        Ok(report)
    }

    /// Most recently active first.
    pub async fn list_devices(&self, user_id: i64) -> Result<Vec<DeviceView>> {
        let now = self.clock.now();
        let mut devices: Vec<Device> = self
            .devices
            .list_by_user(user_id)
            .await?
            .into_iter()
            .map(|d| self.with_cached_activity(d))
            .collect();
        devices.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at).then(a.id.cmp(&b.id)));
        Ok(devices
            .into_iter()
            .map(|device| {
                let online = device.is_online_at(now, self.policy.online_timeout);
                DeviceView { device, online }
            })
            .collect())
    }

    /// Drops idle cache entries and flips idle store records to offline.
    /// Store timestamps may trail the cache by one write interval.
    pub async fn sweep_offline(&self) -> Result<u64> {
        let now = self.clock.now();
        let dropped = self.cache.sweep(now, self.policy.online_timeout);
        let cutoff = now - self.policy.online_timeout - self.policy.heartbeat_write_interval;
        let flipped = self
            .devices
            .mark_stale_offline(cutoff)
            .await?;
        debug!(cache_dropped = dropped, store_flipped = flipped, "offline sweep finished");
        Ok(flipped)
    }

    pub fn start(self: &Arc<Self>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        self.reaper.start(move || {
            let registry = registry.clone();
            async move {
                if let Some(registry) = registry.upgrade() {
                    if let Err(e) = registry.sweep_offline().await {
                        warn!(error = %e, "offline sweep failed");
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        self.reaper.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.reaper.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::db::memory::{MemoryDeviceStore, MemorySessionStore};
    use crate::db::models::Session;
    use crate::db::store::MockDeviceStore;
    use crate::sources::{ManualClock, SeededRandom};

    struct Fixture {
        clock: Arc<ManualClock>,
        devices: Arc<MemoryDeviceStore>,
        sessions: Arc<MemorySessionStore>,
        registry: Arc<DeviceRegistry>,
    }

    fn fixture_with(configure: impl FnOnce(&mut DevicePolicy)) -> Fixture {
        let settings = Settings::new_for_test().unwrap();
        let mut policy = DevicePolicy::from_config(&settings.device);
        configure(&mut policy);

        let clock = Arc::new(ManualClock::starting_now());
        let devices = Arc::new(MemoryDeviceStore::new());
        let sessions = Arc::new(MemorySessionStore::new());
        let identity = DeviceIdentity::new("test_salt", clock.clone(), Arc::new(SeededRandom::new(7)));
        let registry = Arc::new(DeviceRegistry::new(
            devices.clone(),
            sessions.clone(),
            identity,
            policy,
            clock.clone(),
        ));
        Fixture { clock, devices, sessions, registry }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn login(device_type: DeviceType, fingerprint: &str) -> LoginDevice {
        LoginDevice::new(device_type).with_fingerprint(fingerprint)
    }

    fn session_for(device: &Device, token: &str, now: DateTime<Utc>) -> Session {
        Session {
            session_token: token.into(),
            user_id: device.user_id,
            device_id: device.device_id.clone(),
            access_token: "a".into(),
            refresh_token: "r".into(),
            created_at: now,
            expires_at: now + Duration::days(1),
        }
    }

    #[tokio::test]
    async fn test_eleventh_mobile_device_evicts_oldest() {
        let f = fixture();
        let mut first = None;
        for i in 0..10 {
            let device_type = if i % 2 == 0 { DeviceType::Ios } else { DeviceType::Android };
            let reg = f
                .registry
                .register_login(42, &login(device_type, &format!("fp-{}", i)))
                .await
                .unwrap();
            assert!(reg.created);
            assert!(reg.evicted.is_none());
            if i == 0 {
                first = Some(reg.device);
            }
            f.clock.advance(Duration::seconds(10));
        }
        let first = first.unwrap();
        f.sessions
            .create_session(&session_for(&first, "s-first", f.clock.now()))
            .await
            .unwrap();

        let reg = f
            .registry
            .register_login(42, &login(DeviceType::Android, "fp-new"))
            .await
            .unwrap();

        assert!(reg.created);
        assert_eq!(reg.evicted.map(|d| d.device_id), Some(first.device_id.clone()));
        assert_eq!(
            f.devices.count_by_user_and_class(42, DeviceClass::Mobile).await.unwrap(),
            10
        );
        assert!(f.devices.get_by_device_id(&first.device_id).await.unwrap().is_none());
        assert!(f.sessions.get_by_token("s-first").await.unwrap().is_none());
        assert!(f.registry.cache().last_active_at(&first.device_id).is_none());
        // A heartbeat that lost the race against the eviction does not revive it.
        assert!(!f.registry.cache().mark_online(&first.device_id, 42, f.clock.now()));
    }

    #[tokio::test]
    async fn test_classes_have_independent_quotas() {
        let f = fixture_with(|p| p.quotas.pc = 1);
        f.registry.register_login(1, &login(DeviceType::Pc, "pc-1")).await.unwrap();
        let web = f.registry.register_login(1, &login(DeviceType::Web, "web-1")).await.unwrap();
        assert!(web.evicted.is_none());

        let pc = f.registry.register_login(1, &login(DeviceType::Pc, "pc-2")).await.unwrap();
        assert_eq!(pc.evicted.map(|d| d.device_fingerprint), Some("pc-1".to_string()));
        assert!(f.devices.get_by_fingerprint("web-1").await.unwrap().is_some());
    }

    #[test]
    fn test_victim_tie_breaks_on_record_id() {
        let now = Utc::now();
        let make = |id: i64, last_active_at: DateTime<Utc>| Device {
            id,
            device_id: format!("pc_{}", id),
            device_fingerprint: format!("fp{}", id),
            device_type: DeviceType::Pc,
            user_id: 1,
            status: crate::db::models::DeviceStatus::Online,
            device_name: None,
            platform: None,
            os_version: None,
            app_version: None,
            last_ip: None,
            user_agent: None,
            login_at: last_active_at,
            last_active_at,
            created_at: last_active_at,
        };
        let candidates = vec![make(9, now), make(4, now), make(7, now + Duration::seconds(1))];
        let victim = select_eviction_victim(&candidates, EvictionStrategy::Oldest).unwrap();
        assert_eq!(victim.id, 4);
        assert!(select_eviction_victim(&[], EvictionStrategy::Oldest).is_none());
    }

    #[tokio::test]
    async fn test_quota_without_auto_evict_is_an_error() {
        let f = fixture_with(|p| {
            p.quotas.miniprogram = 1;
            p.auto_evict = false;
        });
        f.registry.register_login(5, &login(DeviceType::MiniProgram, "mp-1")).await.unwrap();
        let err = f
            .registry
            .register_login(5, &login(DeviceType::MiniProgram, "mp-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DeviceError(DeviceError::QuotaExceeded)));
        assert_eq!(f.devices.len(), 1);
    }

    #[tokio::test]
    async fn test_fingerprint_conflict_leaves_owner_untouched() {
        let f = fixture();
        let owner = f.registry.register_login(1, &login(DeviceType::Ios, "shared")).await.unwrap();

        f.clock.advance(Duration::minutes(1));
        let err = f
            .registry
            .register_login(2, &login(DeviceType::Ios, "shared"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DeviceError(DeviceError::Conflict)));
        // The message must not name the other account.
        assert!(!err.to_string().contains('1'));

        let stored = f.devices.get_by_fingerprint("shared").await.unwrap().unwrap();
        assert_eq!(stored, owner.device);
        assert!(f.devices.list_by_user(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_user_relogin_skips_quota() {
        let f = fixture_with(|p| {
            p.quotas.web = 1;
            p.auto_evict = false;
        });
        let first = f.registry.register_login(3, &login(DeviceType::Web, "browser")).await.unwrap();
        f.clock.advance(Duration::minutes(5));

        let mut again = login(DeviceType::Web, "browser");
        again.client_ip = Some("198.51.100.4".into());
        let second = f.registry.register_login(3, &again).await.unwrap();

        assert!(!second.created);
        assert_eq!(second.device.device_id, first.device.device_id);
        assert_eq!(second.device.last_active_at, f.clock.now());
        assert_eq!(second.device.login_at, f.clock.now());
        assert_eq!(second.device.last_ip.as_deref(), Some("198.51.100.4"));
    }

    #[tokio::test]
    async fn test_server_side_fingerprint_when_client_sends_none() {
        let f = fixture();
        let mut device = LoginDevice::new(DeviceType::Android);
        device.platform = Some("Pixel 8".into());
        device.fingerprint = Some("   ".into());

        let reg = f.registry.register_login(8, &device).await.unwrap();
        assert_eq!(reg.device.device_fingerprint.len(), 64);
        assert!(reg.device.device_id.starts_with("and_"));
    }

    #[tokio::test]
    async fn test_kick_checks_ownership() {
        let f = fixture();
        let mine = f.registry.register_login(1, &login(DeviceType::Pc, "mine")).await.unwrap().device;
        let theirs = f.registry.register_login(2, &login(DeviceType::Pc, "theirs")).await.unwrap().device;
        f.sessions.create_session(&session_for(&mine, "s-mine", f.clock.now())).await.unwrap();

        let report = f
            .registry
            .kick(
                1,
                &[mine.device_id.clone(), theirs.device_id.clone(), "pc_missing".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(report.kicked, vec![mine.device_id.clone()]);
        assert_eq!(report.rejected, vec![theirs.device_id.clone(), "pc_missing".to_string()]);
        assert!(f.devices.get_by_device_id(&mine.device_id).await.unwrap().is_none());
        assert!(f.devices.get_by_device_id(&theirs.device_id).await.unwrap().is_some());
        assert!(f.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_verify_device_live() {
        let f = fixture();
        let device = f.registry.register_login(1, &login(DeviceType::Ios, "live")).await.unwrap().device;

        assert!(f.registry.verify_device_live(1, &device.device_id).await.is_ok());
        assert!(matches!(
            f.registry.verify_device_live(2, &device.device_id).await,
            Err(AppError::DeviceError(DeviceError::Revoked))
        ));

        f.clock.advance(Duration::minutes(30));
        assert!(matches!(
            f.registry.verify_device_live(1, &device.device_id).await,
            Err(AppError::DeviceError(DeviceError::Revoked))
        ));

        f.registry.heartbeat(1, &device.device_id, None, None).await.unwrap();
        assert!(f.registry.verify_device_live(1, &device.device_id).await.is_ok());

        f.registry.mark_offline(&device.device_id).await.unwrap();
        assert!(f.registry.verify_device_live(1, &device.device_id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_devices_reports_online_flag() {
        let f = fixture();
        let old = f.registry.register_login(1, &login(DeviceType::Pc, "old")).await.unwrap().device;
        f.clock.advance(Duration::minutes(40));
        let fresh = f.registry.register_login(1, &login(DeviceType::Web, "fresh")).await.unwrap().device;

        let views = f.registry.list_devices(1).await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].device.device_id, fresh.device_id);
        assert!(views[0].online);
        assert_eq!(views[1].device.device_id, old.device_id);
        assert!(!views[1].online);

        let json = serde_json::to_value(&views[0]).unwrap();
        assert_eq!(json["online"], true);
        assert!(json.get("device_fingerprint").is_none());
    }

    #[tokio::test]
    async fn test_sweep_offline_flips_stale_devices() {
        let f = fixture();
        let stale = f.registry.register_login(1, &login(DeviceType::Pc, "stale")).await.unwrap().device;
        f.clock.advance(Duration::minutes(32));
        f.registry.register_login(1, &login(DeviceType::Web, "active")).await.unwrap();

        assert_eq!(f.registry.sweep_offline().await.unwrap(), 1);
        let stored = f.devices.get_by_device_id(&stale.device_id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::db::models::DeviceStatus::Offline);
        assert_eq!(f.registry.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeats_within_write_interval_skip_the_store() {
        let f = fixture();
        let start = f.clock.now();
        let device = f.registry.register_login(1, &login(DeviceType::Ios, "phone")).await.unwrap().device;

        f.clock.advance(Duration::seconds(20));
        assert!(f
            .registry
            .heartbeat(1, &device.device_id, Some("203.0.113.1".into()), None)
            .await
            .unwrap());
        let stored = f.devices.get_by_device_id(&device.device_id).await.unwrap().unwrap();
        assert_eq!(stored.last_active_at, start);
        assert_eq!(stored.last_ip, None);

        // Stale in the store, fresh in the cache.
        f.clock.set(start + Duration::minutes(30) + Duration::seconds(10));
        assert!(f.registry.verify_device_live(1, &device.device_id).await.is_ok());
        let views = f.registry.list_devices(1).await.unwrap();
        assert!(views[0].online);
        assert_eq!(views[0].device.last_active_at, start + Duration::seconds(20));

        // Past the write interval the heartbeat goes to the store again.
        f.registry
            .heartbeat(1, &device.device_id, Some("203.0.113.1".into()), None)
            .await
            .unwrap();
        let stored = f.devices.get_by_device_id(&device.device_id).await.unwrap().unwrap();
        assert_eq!(stored.last_active_at, f.clock.now());
        assert_eq!(stored.last_ip.as_deref(), Some("203.0.113.1"));
    }

    #[tokio::test]
    async fn test_heartbeat_after_kick_does_not_revive_device() {
        let f = fixture();
        let device = f.registry.register_login(1, &login(DeviceType::Pc, "desk")).await.unwrap().device;
        f.registry.kick(1, &[device.device_id.clone()]).await.unwrap();

        assert!(!f.registry.heartbeat(1, &device.device_id, None, None).await.unwrap());
        assert!(f.registry.cache().last_active_at(&device.device_id).is_none());
        assert!(f.registry.cache().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_racing_removal_reports_unknown_device() {
        let f = fixture();
        let device = f.registry.register_login(1, &login(DeviceType::Web, "tab")).await.unwrap().device;

        // Removal reached the cache while the row was still in the store.
        f.registry.cache().forget(&device.device_id, f.clock.now());
        f.clock.advance(Duration::minutes(2));
        assert!(!f.registry.heartbeat(1, &device.device_id, None, None).await.unwrap());
        assert!(f.registry.cache().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_login_attributes_are_rejected() {
        let f = fixture();

        let err = f
            .registry
            .register_login(1, &login(DeviceType::Pc, &"a".repeat(100_000)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));

        let mut device = login(DeviceType::Pc, "fits");
        device.platform = Some("p".repeat(65));
        assert!(matches!(
            f.registry.register_login(1, &device).await,
            Err(AppError::ValidationError(_))
        ));

        device.platform = Some("p".repeat(64));
        device.device_name = Some("n".repeat(128));
        assert!(f.registry.register_login(1, &device).await.is_ok());
        assert_eq!(f.devices.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_failure_is_swallowed() {
        let mut store = MockDeviceStore::new();
        store
            .expect_update_activity()
            .returning(|_, _| Err(DatabaseError::ConnectionError("pool closed".into()).into()));

        let clock = Arc::new(ManualClock::starting_now());
        let settings = Settings::new_for_test().unwrap();
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(store),
            Arc::new(MemorySessionStore::new()),
            DeviceIdentity::new("s", clock.clone(), Arc::new(SeededRandom::new(1))),
            DevicePolicy::from_config(&settings.device),
            clock,
        ));

        let handle = registry.heartbeat_detached(1, "pc_whatever".into(), None, None);
        assert!(handle.await.is_ok());
        assert!(registry.cache().is_empty());
    }

    #[tokio::test]
    async fn test_background_sweep_lifecycle() {
        let f = fixture_with(|p| p.sweep_interval = std::time::Duration::from_millis(5));
        f.registry.start();
        assert!(f.registry.is_running());
        f.registry.stop().await;
        assert!(!f.registry.is_running());
    }
}
