use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

use crate::error::{AppError, DeviceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Pc,
    Ios,
    Android,
    Web,
    #[serde(rename = "miniprogram")]
    MiniProgram,
}

impl DeviceType {
    pub const ALL: [DeviceType; 5] = [
        DeviceType::Pc,
        DeviceType::Ios,
        DeviceType::Android,
        DeviceType::Web,
        DeviceType::MiniProgram,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Pc => "pc",
            DeviceType::Ios => "ios",
            DeviceType::Android => "android",
            DeviceType::Web => "web",
            DeviceType::MiniProgram => "miniprogram",
        }
    }

    /// Prefix of server-issued device ids for this type.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            DeviceType::Pc => "pc_",
            DeviceType::Ios => "ios_",
            DeviceType::Android => "and_",
            DeviceType::Web => "web_",
            DeviceType::MiniProgram => "mp_",
        }
    }

    pub fn from_id_prefix(device_id: &str) -> Option<DeviceType> {
        DeviceType::ALL
            .into_iter()
            .find(|t| device_id.starts_with(t.id_prefix()))
    }

    pub fn class(&self) -> DeviceClass {
        match self {
            DeviceType::Ios | DeviceType::Android => DeviceClass::Mobile,
            DeviceType::Pc => DeviceClass::Pc,
            DeviceType::Web => DeviceClass::Web,
            DeviceType::MiniProgram => DeviceClass::MiniProgram,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pc" => Ok(DeviceType::Pc),
            "ios" => Ok(DeviceType::Ios),
            "android" => Ok(DeviceType::Android),
            "web" => Ok(DeviceType::Web),
            "miniprogram" | "mp" => Ok(DeviceType::MiniProgram),
            other => Err(AppError::ValidationError(format!("unknown device type '{}'", other))),
        }
    }
}

/// Quota pool. iOS and Android share the mobile pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Pc,
    Web,
    #[serde(rename = "miniprogram")]
    MiniProgram,
}

impl DeviceClass {
    pub fn members(&self) -> &'static [DeviceType] {
        match self {
            DeviceClass::Mobile => &[DeviceType::Ios, DeviceType::Android],
            DeviceClass::Pc => &[DeviceType::Pc],
            DeviceClass::Web => &[DeviceType::Web],
            DeviceClass::MiniProgram => &[DeviceType::MiniProgram],
        }
    }

    pub fn contains(&self, device_type: DeviceType) -> bool {
        device_type.class() == *self
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Pc => "pc",
            DeviceClass::Web => "web",
            DeviceClass::MiniProgram => "miniprogram",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Offline = 0,
    Online = 1,
}

impl DeviceStatus {
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}

impl TryFrom<i16> for DeviceStatus {
    type Error = AppError;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeviceStatus::Offline),
            1 => Ok(DeviceStatus::Online),
            other => Err(AppError::InternalError(format!("unknown device status {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Internal record id; breaks eviction ties.
    pub id: i64,
    pub device_id: String,
    #[serde(skip_serializing)]
    pub device_fingerprint: String,
    pub device_type: DeviceType,
    pub user_id: i64,
    pub status: DeviceStatus,
    pub device_name: Option<String>,
    pub platform: Option<String>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    pub last_ip: Option<String>,
    pub user_agent: Option<String>,
    pub login_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// Derived, never stored: status says online and the last activity is
    /// younger than `online_timeout`.
    pub fn is_online_at(&self, now: DateTime<Utc>, online_timeout: Duration) -> bool {
        self.status == DeviceStatus::Online && now - self.last_active_at < online_timeout
    }

    pub fn class(&self) -> DeviceClass {
        self.device_type.class()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDevice {
    pub device_id: String,
    pub device_fingerprint: String,
    pub device_type: DeviceType,
    pub user_id: i64,
    pub device_name: Option<String>,
    pub platform: Option<String>,
    pub os_version: Option<String>,
    pub app_version: Option<String>,
    pub last_ip: Option<String>,
    pub user_agent: Option<String>,
    pub login_at: DateTime<Utc>,
}

/// Field-level activity update applied atomically by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceActivity {
    pub at: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    /// Also stamps `login_at`.
    pub login: bool,
}

impl DeviceActivity {
    pub fn heartbeat(at: DateTime<Utc>) -> Self {
        Self { at, ip: None, user_agent: None, login: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub session_token: String,
    pub user_id: i64,
    pub device_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub(crate) fn invalid_device_id(reason: impl Into<String>) -> AppError {
    AppError::DeviceError(DeviceError::InvalidDeviceId(reason.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(status: DeviceStatus, last_active_at: DateTime<Utc>) -> Device {
        Device {
            id: 1,
            device_id: "ios_0000".into(),
            device_fingerprint: "fp".into(),
            device_type: DeviceType::Ios,
            user_id: 42,
            status,
            device_name: None,
            platform: None,
            os_version: None,
            app_version: None,
            last_ip: None,
            user_agent: None,
            login_at: last_active_at,
            last_active_at,
            created_at: last_active_at,
        }
    }

    #[test]
    fn test_online_predicate_boundary() {
        let now = Utc::now();
        let timeout = Duration::minutes(30);

        let d = device(DeviceStatus::Online, now - Duration::minutes(29));
        assert!(d.is_online_at(now, timeout));

        let d = device(DeviceStatus::Online, now - timeout);
        assert!(!d.is_online_at(now, timeout));

        let d = device(DeviceStatus::Offline, now);
        assert!(!d.is_online_at(now, timeout));
    }

    #[test]
    fn test_online_predicate_does_not_mutate() {
        let now = Utc::now();
        let d = device(DeviceStatus::Online, now - Duration::hours(2));
        let before = d.clone();
        assert!(!d.is_online_at(now, Duration::minutes(30)));
        assert_eq!(d, before);
    }

    #[test]
    fn test_device_classes() {
        assert_eq!(DeviceType::Ios.class(), DeviceClass::Mobile);
        assert_eq!(DeviceType::Android.class(), DeviceClass::Mobile);
        assert_eq!(DeviceType::Pc.class(), DeviceClass::Pc);
        assert!(DeviceClass::Mobile.contains(DeviceType::Android));
        assert!(!DeviceClass::Web.contains(DeviceType::MiniProgram));
    }

    #[test]
    fn test_device_type_parsing() {
        assert_eq!("IOS".parse::<DeviceType>().unwrap(), DeviceType::Ios);
        assert_eq!("miniprogram".parse::<DeviceType>().unwrap(), DeviceType::MiniProgram);
        assert!("toaster".parse::<DeviceType>().is_err());
        assert_eq!(
            serde_json::to_string(&DeviceType::MiniProgram).unwrap(),
            "\"miniprogram\""
        );
    }

    #[test]
    fn test_prefix_lookup() {
        assert_eq!(DeviceType::from_id_prefix("and_1234"), Some(DeviceType::Android));
        assert_eq!(DeviceType::from_id_prefix("mp_1234"), Some(DeviceType::MiniProgram));
        assert_eq!(DeviceType::from_id_prefix("xx_1234"), None);
    }
}
