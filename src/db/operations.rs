use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use std::time::Duration;

use crate::db::models::{Device, DeviceActivity, DeviceClass, DeviceStatus, NewDevice, Session};
use crate::db::store::{DeviceStore, SessionStore};
use crate::error::{AppError, DeviceError};
use crate::Result;

const DEVICE_COLUMNS: &str = "id, device_id, device_fingerprint, device_type, user_id, status, \
     device_name, platform, os_version, app_version, last_ip, user_agent, \
     login_at, last_active_at, created_at";

const SESSION_COLUMNS: &str =
    "session_token, user_id, device_id, access_token, refresh_token, created_at, expires_at";

/// `device_sessions.device_id` references `devices`, so a foreign key
/// violation means the device was deleted after it was checked.
fn session_insert_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => DeviceError::Revoked.into(),
        _ => err.into(),
    }
}

pub async fn connect_pool(
    url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(url)
        .await?;
    Ok(pool)
}

#[derive(Debug, FromRow)]
struct DeviceRow {
    id: i64,
    device_id: String,
    device_fingerprint: String,
    device_type: String,
    user_id: i64,
    status: i16,
    device_name: Option<String>,
    platform: Option<String>,
    os_version: Option<String>,
    app_version: Option<String>,
    last_ip: Option<String>,
    user_agent: Option<String>,
    login_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeviceRow> for Device {
    type Error = AppError;

    fn try_from(row: DeviceRow) -> Result<Self> {
        Ok(Device {
            id: row.id,
            device_id: row.device_id,
            device_fingerprint: row.device_fingerprint,
            device_type: row.device_type.parse()?,
            user_id: row.user_id,
            status: DeviceStatus::try_from(row.status)?,
            device_name: row.device_name,
            platform: row.platform,
            os_version: row.os_version,
            app_version: row.app_version,
            last_ip: row.last_ip,
            user_agent: row.user_agent,
            login_at: row.login_at,
            last_active_at: row.last_active_at,
            created_at: row.created_at,
        })
    }
}

pub struct PgDeviceStore {
    pool: Arc<PgPool>,
}

impl PgDeviceStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceStore for PgDeviceStore {
    async fn create_device(&self, device: &NewDevice) -> Result<Device> {
        let sql = format!(
            r#"
            INSERT INTO devices
                (device_id, device_fingerprint, device_type, user_id, status, device_name,
                 platform, os_version, app_version, last_ip, user_agent,
                 login_at, last_active_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12, $12)
            RETURNING {}
            "#,
            DEVICE_COLUMNS
        );
        let row = sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(&device.device_id)
            .bind(&device.device_fingerprint)
            .bind(device.device_type.as_str())
            .bind(device.user_id)
            .bind(DeviceStatus::Online.as_i16())
            .bind(&device.device_name)
            .bind(&device.platform)
            .bind(&device.os_version)
            .bind(&device.app_version)
            .bind(&device.last_ip)
            .bind(&device.user_agent)
            .bind(device.login_at)
            .fetch_one(self.pool.as_ref())
            .await?;
        row.try_into()
    }

    async fn get_by_device_id(&self, device_id: &str) -> Result<Option<Device>> {
        let sql = format!("SELECT {} FROM devices WHERE device_id = $1", DEVICE_COLUMNS);
        sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(device_id)
            .fetch_optional(self.pool.as_ref())
            .await?
            .map(Device::try_from)
            .transpose()
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Device>> {
        let sql = format!("SELECT {} FROM devices WHERE device_fingerprint = $1", DEVICE_COLUMNS);
        sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(fingerprint)
            .fetch_optional(self.pool.as_ref())
            .await?
            .map(Device::try_from)
            .transpose()
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<Device>> {
        let sql = format!(
            "SELECT {} FROM devices WHERE user_id = $1 ORDER BY last_active_at DESC, id DESC",
            DEVICE_COLUMNS
        );
        sqlx::query_as::<_, DeviceRow>(&sql)
            .bind(user_id)
            .fetch_all(self.pool.as_ref())
            .await?
            .into_iter()
            .map(Device::try_from)
            .collect()
    }

    async fn update_activity(&self, device_id: &str, activity: &DeviceActivity) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET status = $2,
                last_active_at = GREATEST(last_active_at, $3),
                login_at = CASE WHEN $4 THEN $3 ELSE login_at END,
                last_ip = COALESCE($5, last_ip),
                user_agent = COALESCE($6, user_agent)
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .bind(DeviceStatus::Online.as_i16())
        .bind(activity.at)
        .bind(activity.login)
        .bind(&activity.ip)
        .bind(&activity.user_agent)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_offline(&self, device_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE devices SET status = $2 WHERE device_id = $1")
            .bind(device_id)
            .bind(DeviceStatus::Offline.as_i16())
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE devices SET status = $1 WHERE status = $2 AND last_active_at < $3",
        )
        .bind(DeviceStatus::Offline.as_i16())
        .bind(DeviceStatus::Online.as_i16())
        .bind(cutoff)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete(&self, device_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE device_id = $1")
            .bind(device_id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_by_user_and_class(&self, user_id: i64, class: DeviceClass) -> Result<u64> {
        let types: Vec<&str> = class.members().iter().map(|t| t.as_str()).collect();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM devices WHERE user_id = $1 AND device_type = ANY($2)",
        )
        .bind(user_id)
        .bind(&types)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(count.max(0) as u64)
    }
}

pub struct PgSessionStore {
    pool: Arc<PgPool>,
}

impl PgSessionStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create_session(&self, session: &Session) -> Result<Session> {
        let sql = format!(
            r#"
            INSERT INTO device_sessions
                (session_token, user_id, device_id, access_token, refresh_token, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(&session.session_token)
            .bind(session.user_id)
            .bind(&session.device_id)
            .bind(&session.access_token)
            .bind(&session.refresh_token)
            .bind(session.created_at)
            .bind(session.expires_at)
            .fetch_one(self.pool.as_ref())
            .await
            .map_err(session_insert_error)?;

        Ok(session)
    }

    async fn get_by_token(&self, session_token: &str) -> Result<Option<Session>> {
        let sql = format!(
            "SELECT {} FROM device_sessions WHERE session_token = $1",
            SESSION_COLUMNS
        );
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(session_token)
            .fetch_optional(self.pool.as_ref())
            .await?;

        Ok(session)
    }

    async fn delete_by_token(&self, session_token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM device_sessions WHERE session_token = $1")
            .bind(session_token)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_all_for_device(&self, device_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM device_sessions WHERE device_id = $1")
            .bind(device_id)
            .execute(self.pool.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut transaction = self.pool.as_ref().begin().await?;

        let result = sqlx::query("DELETE FROM device_sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&mut *transaction)
            .await;

        match result {
            Ok(result) => {
                transaction.commit().await?;
                Ok(result.rows_affected())
            }
            Err(e) => {
                transaction.rollback().await?;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;
    use sqlx::error::{DatabaseError as SqlxDatabaseError, ErrorKind};
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct ConstraintViolation {
        foreign_key: bool,
    }

    impl fmt::Display for ConstraintViolation {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("constraint violated")
        }
    }

    impl StdError for ConstraintViolation {}

    impl SqlxDatabaseError for ConstraintViolation {
        fn message(&self) -> &str {
            "constraint violated"
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            if self.foreign_key {
                ErrorKind::ForeignKeyViolation
            } else {
                ErrorKind::UniqueViolation
            }
        }
    }

    #[test]
    fn test_session_for_deleted_device_is_revoked() {
        let err = sqlx::Error::Database(Box::new(ConstraintViolation { foreign_key: true }));
        assert!(matches!(
            session_insert_error(err),
            AppError::DeviceError(DeviceError::Revoked)
        ));
    }

    #[test]
    fn test_other_session_insert_errors_keep_their_mapping() {
        let err = sqlx::Error::Database(Box::new(ConstraintViolation { foreign_key: false }));
        assert!(matches!(
            session_insert_error(err),
            AppError::DatabaseError(DatabaseError::Duplicate)
        ));
        assert!(matches!(
            session_insert_error(sqlx::Error::PoolTimedOut),
            AppError::DatabaseError(DatabaseError::ConnectionError(_))
        ));
    }
}
