//! Device fingerprints and server-issued device ids.
//!
//! A device id is `prefix | user tag | random | fingerprint tag | checksum`,
//! all lowercase hex after the type prefix, always [`DEVICE_ID_LEN`] chars:
//!
//! - user tag: 8 hex chars of SHA-256(salt:user_id), so ids do not reveal user ids
//! - random: fills the remaining width from the injected random source
//! - fingerprint tag: 6 hex chars of SHA-256(fingerprint)
//! - checksum: 2 hex chars of SHA-256(everything before it)
//!
//! Generation is intentionally not deterministic. Uniqueness is enforced by
//! the device store, not here.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::db::models::{invalid_device_id, DeviceType};
use crate::sources::{Clock, RandomSource};
use crate::Result;

pub const DEVICE_ID_LEN: usize = 32;
pub const DEVICE_ID_MIN_LEN: usize = 16;
pub const DEVICE_ID_MAX_LEN: usize = 64;

const USER_TAG_LEN: usize = 8;
const FINGERPRINT_TAG_LEN: usize = 6;
const CHECKSUM_LEN: usize = 2;

/// Client-reported attributes used when the client sends no fingerprint of its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintInput {
    pub platform: String,
    pub os_version: String,
    pub app_version: String,
    pub client_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDeviceId {
    pub device_type: DeviceType,
    pub user_tag: String,
    pub fingerprint_tag: String,
    pub checksum: String,
}

pub struct DeviceIdentity {
    salt: String,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
}

impl DeviceIdentity {
    pub fn new(salt: impl Into<String>, clock: Arc<dyn Clock>, random: Arc<dyn RandomSource>) -> Self {
        Self {
            salt: salt.into(),
            clock,
            random,
        }
    }

    /// SHA-256 over the device attributes plus the current UTC day, hex encoded.
    /// The day factor keeps the value stable within a day and lets it drift across days.
    pub fn fingerprint(&self, device_type: DeviceType, input: &FingerprintInput) -> String {
        fingerprint_at(device_type, input, self.clock.now())
    }

    pub fn generate_device_id(&self, device_type: DeviceType, user_id: i64, fingerprint: &str) -> String {
        let prefix = device_type.id_prefix();
        let user_tag = self.user_tag(user_id);
        let fingerprint_tag = &sha256_hex(fingerprint.as_bytes())[..FINGERPRINT_TAG_LEN];

        let random_len = DEVICE_ID_LEN - prefix.len() - USER_TAG_LEN - FINGERPRINT_TAG_LEN - CHECKSUM_LEN;
        let mut random = vec![0u8; (random_len + 1) / 2];
        self.random.fill_bytes(&mut random);
        let random_hex = &hex::encode(random)[..random_len];

        let mut id = String::with_capacity(DEVICE_ID_LEN);
        id.push_str(prefix);
        id.push_str(&user_tag);
        id.push_str(random_hex);
        id.push_str(fingerprint_tag);
        let checksum = checksum(&id);
        id.push_str(&checksum);
        id
    }

    /// Whether a well-formed id carries the tags for this user and fingerprint.
    pub fn is_bound_to(&self, device_id: &str, user_id: i64, fingerprint: &str) -> bool {
        match parse_device_id(device_id) {
            Ok(parsed) => {
                parsed.user_tag == self.user_tag(user_id)
                    && parsed.fingerprint_tag == sha256_hex(fingerprint.as_bytes())[..FINGERPRINT_TAG_LEN]
            }
            Err(_) => false,
        }
    }

    fn user_tag(&self, user_id: i64) -> String {
        let digest = sha256_hex(format!("{}:{}", self.salt, user_id).as_bytes());
        // Low-order bytes of the digest.
        digest[digest.len() - USER_TAG_LEN..].to_string()
    }
}

pub fn fingerprint_at(device_type: DeviceType, input: &FingerprintInput, now: DateTime<Utc>) -> String {
    let material = [
        device_type.as_str(),
        input.platform.as_str(),
        input.os_version.as_str(),
        input.app_version.as_str(),
        input.client_ip.as_str(),
        &now.format("%Y-%m-%d").to_string(),
    ]
    .join("|");
    sha256_hex(material.as_bytes())
}

/// Cheap shape check: length bounds, a known prefix, and a plain charset.
/// Not authoritative; the device store decides whether the id exists.
pub fn validate_device_id(device_id: &str) -> bool {
    (DEVICE_ID_MIN_LEN..=DEVICE_ID_MAX_LEN).contains(&device_id.len())
        && DeviceType::from_id_prefix(device_id).is_some()
        && device_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

pub fn parse_device_id(device_id: &str) -> Result<ParsedDeviceId> {
    if device_id.len() != DEVICE_ID_LEN {
        return Err(invalid_device_id(format!(
            "expected {} characters, got {}",
            DEVICE_ID_LEN,
            device_id.len()
        )));
    }
    let device_type = DeviceType::from_id_prefix(device_id)
        .ok_or_else(|| invalid_device_id("unrecognized prefix"))?;

    let body = &device_id[device_type.id_prefix().len()..];
    if !body.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(invalid_device_id("body is not lowercase hex"));
    }

    let (signed, checksum_part) = device_id.split_at(DEVICE_ID_LEN - CHECKSUM_LEN);
    if checksum(signed) != checksum_part {
        return Err(invalid_device_id("checksum mismatch"));
    }

    let fingerprint_start = body.len() - CHECKSUM_LEN - FINGERPRINT_TAG_LEN;
    Ok(ParsedDeviceId {
        device_type,
        user_tag: body[..USER_TAG_LEN].to_string(),
        fingerprint_tag: body[fingerprint_start..fingerprint_start + FINGERPRINT_TAG_LEN].to_string(),
        checksum: checksum_part.to_string(),
    })
}

fn checksum(signed: &str) -> String {
    sha256_hex(signed.as_bytes())[..CHECKSUM_LEN].to_string()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
