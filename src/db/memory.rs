//! In-process stores with the same uniqueness guarantees as the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::db::models::{Device, DeviceActivity, DeviceClass, DeviceStatus, NewDevice, Session};
use crate::db::store::{DeviceStore, SessionStore};
use crate::error::DatabaseError;
use crate::Result;

#[derive(Debug, Default)]
struct DeviceTable {
    rows: BTreeMap<i64, Device>,
    by_device_id: HashMap<String, i64>,
    by_fingerprint: HashMap<String, i64>,
    next_id: i64,
}

impl DeviceTable {
    fn find(&self, device_id: &str) -> Option<&Device> {
        self.by_device_id.get(device_id).and_then(|id| self.rows.get(id))
    }

    fn find_mut(&mut self, device_id: &str) -> Option<&mut Device> {
        let id = *self.by_device_id.get(device_id)?;
        self.rows.get_mut(&id)
    }
}

#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    table: RwLock<DeviceTable>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn create_device(&self, device: &NewDevice) -> Result<Device> {
        let mut table = self.table.write();
        if table.by_device_id.contains_key(&device.device_id)
            || table.by_fingerprint.contains_key(&device.device_fingerprint)
        {
            return Err(DatabaseError::Duplicate.into());
        }

        table.next_id += 1;
        let id = table.next_id;
        let row = Device {
            id,
            device_id: device.device_id.clone(),
            device_fingerprint: device.device_fingerprint.clone(),
            device_type: device.device_type,
            user_id: device.user_id,
            status: DeviceStatus::Online,
            device_name: device.device_name.clone(),
            platform: device.platform.clone(),
            os_version: device.os_version.clone(),
            app_version: device.app_version.clone(),
            last_ip: device.last_ip.clone(),
            user_agent: device.user_agent.clone(),
            login_at: device.login_at,
            last_active_at: device.login_at,
            created_at: device.login_at,
        };
        table.by_device_id.insert(row.device_id.clone(), id);
        table.by_fingerprint.insert(row.device_fingerprint.clone(), id);
        table.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn get_by_device_id(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.table.read().find(device_id).cloned())
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Device>> {
        let table = self.table.read();
        Ok(table
            .by_fingerprint
            .get(fingerprint)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Device>> {
        Ok(self
            .table
            .read()
            .rows
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_activity(&self, device_id: &str, activity: &DeviceActivity) -> Result<bool> {
        let mut table = self.table.write();
        let Some(device) = table.find_mut(device_id) else {
            return Ok(false);
        };
        device.status = DeviceStatus::Online;
        if activity.at > device.last_active_at {
            device.last_active_at = activity.at;
        }
        if activity.login {
            device.login_at = activity.at;
        }
        if let Some(ip) = &activity.ip {
            device.last_ip = Some(ip.clone());
        }
        if let Some(ua) = &activity.user_agent {
            device.user_agent = Some(ua.clone());
        }
        Ok(true)
    }

    async fn set_offline(&self, device_id: &str) -> Result<bool> {
        let mut table = self.table.write();
        match table.find_mut(device_id) {
            Some(device) => {
                device.status = DeviceStatus::Offline;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut table = self.table.write();
        let mut flipped = 0;
        for device in table.rows.values_mut() {
            if device.status == DeviceStatus::Online && device.last_active_at < cutoff {
                device.status = DeviceStatus::Offline;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn delete(&self, device_id: &str) -> Result<bool> {
        let mut table = self.table.write();
        let Some(id) = table.by_device_id.remove(device_id) else {
            return Ok(false);
        };
        if let Some(row) = table.rows.remove(&id) {
            table.by_fingerprint.remove(&row.device_fingerprint);
        }
        Ok(true)
    }

    async fn count_by_user_and_class(&self, user_id: i64, class: DeviceClass) -> Result<u64> {
        Ok(self
            .table
            .read()
            .rows
            .values()
            .filter(|d| d.user_id == user_id && class.contains(d.device_type))
            .count() as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: &Session) -> Result<Session> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.session_token) {
            return Err(DatabaseError::Duplicate.into());
        }
        sessions.insert(session.session_token.clone(), session.clone());
        Ok(session.clone())
    }

    async fn get_by_token(&self, session_token: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().get(session_token).cloned())
    }

    async fn delete_by_token(&self, session_token: &str) -> Result<bool> {
        Ok(self.sessions.write().remove(session_token).is_some())
    }

    async fn delete_all_for_device(&self, device_id: &str) -> Result<u64> {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.device_id != device_id);
        Ok((before - sessions.len()) as u64)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        Ok((before - sessions.len()) as u64)
    }
}
