//! Storage collaborators consumed by the device registry and session manager.
//!
//! Both stores are the systems of record. They must enforce uniqueness of
//! `device_id`, `device_fingerprint` and `session_token`, reporting a
//! violation as [`DatabaseError::Duplicate`](crate::error::DatabaseError::Duplicate)
//! so that the loser of a concurrent registration fails predictably.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{Device, DeviceActivity, DeviceClass, NewDevice, Session};
use crate::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn create_device(&self, device: &NewDevice) -> Result<Device>;

    async fn get_by_device_id(&self, device_id: &str) -> Result<Option<Device>>;

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Device>>;

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Device>>;

    /// Sets the device online and moves `last_active_at` forward (never back).
    /// Returns false when the device does not exist.
    async fn update_activity(&self, device_id: &str, activity: &DeviceActivity) -> Result<bool>;

    async fn set_offline(&self, device_id: &str) -> Result<bool>;

    /// Flips every online device idle since before `cutoff` to offline.
    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn delete(&self, device_id: &str) -> Result<bool>;

    async fn count_by_user_and_class(&self, user_id: i64, class: DeviceClass) -> Result<u64>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<Session>;

    async fn get_by_token(&self, session_token: &str) -> Result<Option<Session>>;

    /// Returns false when nothing was deleted, which is how rotation detects
    /// that a concurrent refresh already consumed the session.
    async fn delete_by_token(&self, session_token: &str) -> Result<bool>;

    async fn delete_all_for_device(&self, device_id: &str) -> Result<u64>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}
