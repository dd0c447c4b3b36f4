//! Device identity, online tracking and the quota-enforcing registry.

pub mod cache;
pub mod identity;
pub mod registry;

pub use cache::OnlineCache;
pub use identity::{parse_device_id, validate_device_id, DeviceIdentity, FingerprintInput, ParsedDeviceId};
pub use registry::{DevicePolicy, DeviceRegistry, DeviceView, KickReport, LoginDevice, Registration};
