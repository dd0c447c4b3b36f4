use chrono::Duration;
use devicegate::db::{DeviceClass, DeviceStore, DeviceType};
use devicegate::error::{AppError, AuthError, DatabaseError, DeviceError};
use devicegate::sources::{ManualClock, SeededRandom};
use devicegate::{AppState, LoginDevice, MemoryDeviceStore, MemorySessionStore, Settings};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

struct Setup {
    clock: Arc<ManualClock>,
    devices: Arc<MemoryDeviceStore>,
    state: AppState,
}

fn setup(configure: impl FnOnce(&mut Settings)) -> Setup {
    let mut config = Settings::new_for_test().expect("Failed to load test config");
    configure(&mut config);
    let clock = Arc::new(ManualClock::starting_now());
    let devices = Arc::new(MemoryDeviceStore::new());
    let state = AppState::with_stores(
        config,
        devices.clone(),
        Arc::new(MemorySessionStore::new()),
        clock.clone(),
        Arc::new(SeededRandom::new(2024)),
    )
    .expect("Failed to build state");
    Setup { clock, devices, state }
}

fn device(device_type: DeviceType, fingerprint: &str) -> LoginDevice {
    LoginDevice::new(device_type).with_fingerprint(fingerprint)
}

#[tokio::test]
async fn test_auth_flow() {
    let s = setup(|_| {});

    let login = assert_ok!(s.state.sessions.login(42, &device(DeviceType::Ios, "iphone")).await);
    assert!(login.device.device_id.starts_with("ios_"));
    assert!(login.evicted_device_id.is_none());

    let identity = assert_ok!(s.state.sessions.validate_access(&login.tokens.access_token));
    assert_eq!(identity.user_id, 42);
    assert_ok!(s.state.sessions.verify_session(&identity).await);

    s.clock.advance(Duration::minutes(10));
    let rotated = assert_ok!(s.state.sessions.refresh(&login.tokens.refresh_token).await);
    let identity = assert_ok!(s.state.sessions.validate_access(&rotated.access_token));
    assert_eq!(identity.device_id, login.device.device_id);

    assert_ok!(s.state.sessions.logout(&identity).await);
    assert_err!(s.state.sessions.refresh(&rotated.refresh_token).await);
}

#[tokio::test]
async fn test_mobile_pool_is_shared_between_ios_and_android() {
    let s = setup(|config| config.device.quotas.mobile = 2);

    let ios = assert_ok!(s.state.sessions.login(1, &device(DeviceType::Ios, "ios-1")).await);
    s.clock.advance(Duration::seconds(1));
    assert_ok!(s.state.sessions.login(1, &device(DeviceType::Android, "and-1")).await);
    s.clock.advance(Duration::seconds(1));

    // A third mobile device of either sub-type pushes out the oldest overall.
    let third = assert_ok!(s.state.sessions.login(1, &device(DeviceType::Android, "and-2")).await);
    assert_eq!(third.evicted_device_id, Some(ios.device.device_id.clone()));
    assert_eq!(
        s.devices.count_by_user_and_class(1, DeviceClass::Mobile).await.unwrap(),
        2
    );

    match s.state.sessions.refresh(&ios.tokens.refresh_token).await {
        Err(AppError::DeviceError(DeviceError::Revoked)) => {}
        other => panic!("expected revoked device, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_fingerprint_conflict_between_accounts() {
    let s = setup(|_| {});
    let first = assert_ok!(s.state.sessions.login(1, &device(DeviceType::Web, "shared-browser")).await);

    let err = assert_err!(s.state.sessions.login(2, &device(DeviceType::Web, "shared-browser")).await);
    assert!(matches!(err, AppError::DeviceError(DeviceError::Conflict)));

    // The original owner keeps working.
    assert_ok!(s.state.sessions.refresh(&first.tokens.refresh_token).await);
}

#[tokio::test]
async fn test_idle_device_needs_new_login() {
    let s = setup(|_| {});
    let login = assert_ok!(s.state.sessions.login(3, &device(DeviceType::Pc, "desk")).await);

    s.clock.advance(Duration::minutes(45));
    let err = assert_err!(s.state.sessions.refresh(&login.tokens.refresh_token).await);
    assert!(matches!(err, AppError::DeviceError(DeviceError::Revoked)));
    assert!(err.requires_relogin());

    // Logging in again from the same fingerprint revives the same device.
    let again = assert_ok!(s.state.sessions.login(3, &device(DeviceType::Pc, "desk")).await);
    assert_eq!(again.device.device_id, login.device.device_id);
    assert_ok!(s.state.sessions.refresh(&again.tokens.refresh_token).await);
}

#[tokio::test]
async fn test_heartbeat_keeps_device_live() {
    let s = setup(|_| {});
    let login = assert_ok!(s.state.sessions.login(4, &device(DeviceType::MiniProgram, "wx")).await);

    for _ in 0..3 {
        s.clock.advance(Duration::minutes(20));
        let updated = assert_ok!(
            s.state
                .registry
                .heartbeat(4, &login.device.device_id, Some("192.0.2.1".into()), None)
                .await
        );
        assert!(updated);
    }

    assert_ok!(s.state.sessions.refresh(&login.tokens.refresh_token).await);
    let stored = s.devices.get_by_device_id(&login.device.device_id).await.unwrap().unwrap();
    assert_eq!(stored.last_ip.as_deref(), Some("192.0.2.1"));
}

#[tokio::test]
async fn test_expired_access_token() {
    let s = setup(|_| {});
    let login = assert_ok!(s.state.sessions.login(5, &device(DeviceType::Pc, "desk")).await);

    s.clock.advance(Duration::minutes(30));
    let err = assert_err!(s.state.sessions.validate_access(&login.tokens.access_token));
    assert!(matches!(err, AppError::AuthError(AuthError::SessionExpired)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_logins_for_one_fingerprint() {
    let s = setup(|_| {});
    let sessions = s.state.sessions.clone();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let sessions = sessions.clone();
            tokio::spawn(async move { sessions.login(6, &device(DeviceType::Pc, "racy")).await })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(AppError::DatabaseError(DatabaseError::Duplicate)) => {}
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }

    assert!(successes >= 1);
    assert_eq!(s.devices.len(), 1);
}

#[tokio::test]
async fn test_background_sweeps_run_and_stop() {
    let s = setup(|config| {
        config.device.sweep_interval_secs = 1;
        config.auth.session_sweep_interval_secs = 1;
        config.rate_limit.reap_interval_secs = 1;
    });
    let login = assert_ok!(s.state.sessions.login(7, &device(DeviceType::Web, "tab")).await);

    s.state.start_background();
    s.clock.advance(Duration::days(15));
    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
    assert_ok!(s.state.shutdown().await);

    let stored = s.devices.get_by_device_id(&login.device.device_id).await.unwrap().unwrap();
    assert_eq!(stored.status, devicegate::db::DeviceStatus::Offline);
    assert!(s.state.registry.cache().is_empty());
}
