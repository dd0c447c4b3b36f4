//! Storage layer for devicegate
//!
//! Device and session records, the store traits the core consumes, and
//! their PostgreSQL and in-memory implementations.

pub mod memory;
pub mod models;
pub mod operations;
pub mod store;

pub use memory::{MemoryDeviceStore, MemorySessionStore};
pub use models::{Device, DeviceActivity, DeviceClass, DeviceStatus, DeviceType, NewDevice, Session};
pub use operations::{connect_pool, PgDeviceStore, PgSessionStore};
pub use store::{DeviceStore, SessionStore};
