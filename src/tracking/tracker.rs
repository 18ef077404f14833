//! Location tracker: device fixes → geocode → `SendGeolocationData`.
//!
//! ```text
//! LocationSource ──fix──► DistanceFilter ──► ReverseGeocoder ──► TrackingService
//!   (device)               (50 m)            (best effort)       (guarded send)
//! ```
//!
//! The tracker runs a single pump task while active. Permission is read
//! from the source on `start()`; an undetermined permission is requested
//! and the tracker waits for [`LocationTracker::on_permission_changed`].

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::filter::DistanceFilter;
use super::geocode::ReverseGeocoder;
use super::service::TrackingService;
use crate::constants::{DISTANCE_FILTER_METERS, TRACKING_RECONNECT_INTERVAL};
use crate::credentials::CredentialsProvider;
use crate::protocol::{GeoPoint, GeolocationUpdate};

/// Capacity of the fix channel handed out by [`ChannelLocationSource`].
const FIX_CHANNEL_CAPACITY: usize = 64;

/// Location permission as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// Updates may be requested.
    Granted,
    /// The user has not been asked yet.
    NotDetermined,
    /// The user refused.
    Denied,
}

/// A single position report from the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    /// Reported position.
    pub point: GeoPoint,
    /// When the device took the fix.
    pub recorded_at: DateTime<Utc>,
}

impl LocationFix {
    /// Fix taken now.
    pub fn now(latitude: f64, longitude: f64) -> Self {
        Self {
            point: GeoPoint::new(latitude, longitude),
            recorded_at: Utc::now(),
        }
    }
}

/// Device location provider contract.
pub trait LocationSource: Send + Sync + std::fmt::Debug {
    /// Current permission.
    fn permission(&self) -> PermissionStatus;

    /// Ask the user for permission. The answer arrives through
    /// [`LocationTracker::on_permission_changed`].
    fn request_permission(&self);

    /// Begin delivering fixes on a fresh channel.
    fn start_updates(&self) -> mpsc::Receiver<LocationFix>;

    /// Stop delivering fixes.
    fn stop_updates(&self);
}

/// Location source fed programmatically (stdin, tests, simulators).
#[derive(Debug)]
pub struct ChannelLocationSource {
    permission: RwLock<PermissionStatus>,
    sink: Mutex<Option<mpsc::Sender<LocationFix>>>,
}

impl ChannelLocationSource {
    /// Source with the given initial permission.
    pub fn new(permission: PermissionStatus) -> Self {
        Self {
            permission: RwLock::new(permission),
            sink: Mutex::new(None),
        }
    }

    /// Change the reported permission.
    pub fn set_permission(&self, permission: PermissionStatus) {
        *self
            .permission
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = permission;
    }

    /// Deliver a fix to the active tracker. Returns `false` if none is listening.
    pub async fn push(&self, fix: LocationFix) -> bool {
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match sink {
            Some(sink) => sink.send(fix).await.is_ok(),
            None => false,
        }
    }
}

impl LocationSource for ChannelLocationSource {
    fn permission(&self) -> PermissionStatus {
        *self
            .permission
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn request_permission(&self) {
        log::debug!("[Tracking] Permission requested");
    }

    fn start_updates(&self) -> mpsc::Receiver<LocationFix> {
        let (tx, rx) = mpsc::channel(FIX_CHANNEL_CAPACITY);
        *self
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
        rx
    }

    fn stop_updates(&self) {
        self.sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }
}

/// Truck and driver details stamped on every update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverProfile {
    /// Assigned truck id.
    pub truck_id: String,
    /// Truck display number.
    pub truck_number: Option<String>,
    /// Driver display name.
    pub drivers_name: Option<String>,
}

/// Lifecycle of the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerStatus {
    /// Not tracking.
    #[default]
    Stopped,
    /// Started, waiting for the user to grant permission.
    AwaitingPermission,
    /// Pump task running.
    Running,
}

struct Pump {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct TrackerInner {
    status: TrackerStatus,
    pump: Option<Pump>,
}

/// Publishes device location while tracking is active.
pub struct LocationTracker {
    source: Arc<dyn LocationSource>,
    service: Arc<TrackingService>,
    geocoder: Arc<dyn ReverseGeocoder>,
    credentials: Arc<dyn CredentialsProvider>,
    profile: Arc<RwLock<DriverProfile>>,
    distance_filter_meters: f64,
    inner: Mutex<TrackerInner>,
}

impl std::fmt::Debug for LocationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationTracker")
            .field("status", &self.status())
            .field("source", &self.source)
            .field("geocoder", &self.geocoder)
            .finish_non_exhaustive()
    }
}

impl LocationTracker {
    /// Assemble a tracker. Nothing runs until [`start`](Self::start).
    pub fn new(
        source: Arc<dyn LocationSource>,
        service: Arc<TrackingService>,
        geocoder: Arc<dyn ReverseGeocoder>,
        credentials: Arc<dyn CredentialsProvider>,
        profile: DriverProfile,
    ) -> Self {
        Self {
            source,
            service,
            geocoder,
            credentials,
            profile: Arc::new(RwLock::new(profile)),
            distance_filter_meters: DISTANCE_FILTER_METERS,
            inner: Mutex::new(TrackerInner::default()),
        }
    }

    /// Override the minimum displacement between published fixes.
    #[must_use]
    pub fn with_distance_filter(mut self, meters: f64) -> Self {
        self.distance_filter_meters = meters;
        self
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Current lifecycle status.
    pub fn status(&self) -> TrackerStatus {
        self.lock().status
    }

    /// Whether tracking has been started (running or awaiting permission).
    pub fn is_running(&self) -> bool {
        self.status() != TrackerStatus::Stopped
    }

    /// Replace the truck/driver details used for later updates.
    pub fn set_profile(&self, profile: DriverProfile) {
        *self
            .profile
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = profile;
    }

    /// Start tracking. No-op when already started.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&self) -> TrackerStatus {
        let mut inner = self.lock();
        if inner.status != TrackerStatus::Stopped {
            log::debug!("[Tracking] Already tracking");
            return inner.status;
        }

        match self.source.permission() {
            PermissionStatus::Granted => {
                inner.pump = Some(self.spawn_pump());
                inner.status = TrackerStatus::Running;
                log::info!("[Tracking] Tracking started");
            }
            PermissionStatus::NotDetermined => {
                self.source.request_permission();
                inner.status = TrackerStatus::AwaitingPermission;
                log::info!("[Tracking] Requesting location permission");
            }
            PermissionStatus::Denied => {
                log::warn!("[Tracking] Location permission denied");
            }
        }
        inner.status
    }

    /// Stop tracking. Safe to call when stopped.
    pub fn stop(&self) {
        let pump = {
            let mut inner = self.lock();
            inner.status = TrackerStatus::Stopped;
            inner.pump.take()
        };
        if let Some(pump) = pump {
            pump.cancel.cancel();
            pump.task.abort();
            self.source.stop_updates();
            log::info!("[Tracking] Tracking stopped");
        }
    }

    /// App returned to the foreground: start if a session is signed in, and
    /// reconnect the hub if a running tracker lost it.
    ///
    /// Must be called inside a tokio runtime.
    pub fn on_foreground_resume(&self) -> TrackerStatus {
        if self.credentials.is_authenticated() {
            let status = self.start();
            if status == TrackerStatus::Running && !self.service.is_connected() {
                let service = Arc::clone(&self.service);
                tokio::spawn(async move {
                    if let Err(e) = service.connect().await {
                        log::warn!("[Tracking] Reconnect on resume failed: {e}");
                    }
                });
            }
            status
        } else {
            log::debug!("[Tracking] Not signed in, staying stopped");
            self.status()
        }
    }

    /// Session ended.
    pub fn on_logout(&self) {
        self.stop();
    }

    /// The device reported a permission change.
    pub fn on_permission_changed(&self, permission: PermissionStatus) -> TrackerStatus {
        let mut inner = self.lock();
        match (inner.status, permission) {
            (TrackerStatus::AwaitingPermission, PermissionStatus::Granted) => {
                inner.pump = Some(self.spawn_pump());
                inner.status = TrackerStatus::Running;
                log::info!("[Tracking] Permission granted, tracking started");
            }
            (TrackerStatus::Running, PermissionStatus::Denied | PermissionStatus::NotDetermined) => {
                if let Some(pump) = inner.pump.take() {
                    pump.cancel.cancel();
                    pump.task.abort();
                }
                self.source.stop_updates();
                inner.status = TrackerStatus::AwaitingPermission;
                log::warn!("[Tracking] Permission revoked, updates paused");
            }
            _ => {}
        }
        inner.status
    }

    fn spawn_pump(&self) -> Pump {
        let cancel = CancellationToken::new();
        let fixes = self.source.start_updates();
        let publisher = Publisher {
            service: Arc::clone(&self.service),
            geocoder: Arc::clone(&self.geocoder),
            credentials: Arc::clone(&self.credentials),
            profile: Arc::clone(&self.profile),
            filter: DistanceFilter::new(self.distance_filter_meters),
            retry_after: None,
        };
        let task = tokio::spawn(publisher.run(fixes, cancel.clone()));
        Pump { cancel, task }
    }
}

impl Drop for LocationTracker {
    fn drop(&mut self) {
        if let Some(pump) = self.lock().pump.take() {
            pump.cancel.cancel();
            pump.task.abort();
        }
    }
}

/// State owned by the pump task.
struct Publisher {
    service: Arc<TrackingService>,
    geocoder: Arc<dyn ReverseGeocoder>,
    credentials: Arc<dyn CredentialsProvider>,
    profile: Arc<RwLock<DriverProfile>>,
    filter: DistanceFilter,
    /// Set after a failed connect; no new attempt before this instant.
    retry_after: Option<Instant>,
}

impl Publisher {
    async fn run(mut self, mut fixes: mpsc::Receiver<LocationFix>, cancel: CancellationToken) {
        self.ensure_connected().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                fix = fixes.recv() => match fix {
                    Some(fix) => {
                        self.publish(fix).await;
                    }
                    None => {
                        log::debug!("[Tracking] Location source closed");
                        break;
                    }
                },
            }
        }
    }

    /// Connect if the hub is down, at most once per retry interval after a
    /// failure. Returns whether the hub is connected.
    async fn ensure_connected(&mut self) -> bool {
        if self.service.is_connected() {
            return true;
        }
        if self.retry_after.is_some_and(|at| Instant::now() < at) {
            return false;
        }
        match self.service.connect().await {
            Ok(()) => {
                self.retry_after = None;
                true
            }
            Err(e) => {
                log::warn!("[Tracking] Hub unavailable, dropping updates for now: {e}");
                self.retry_after = Some(Instant::now() + TRACKING_RECONNECT_INTERVAL);
                false
            }
        }
    }

    /// Filter, geocode and send one fix. Returns `true` if it was sent.
    ///
    /// A fix dropped for lack of a connection does not count against the
    /// distance filter.
    async fn publish(&mut self, fix: LocationFix) -> bool {
        if !self.ensure_connected().await {
            log::debug!("[Tracking] Not connected, fix dropped");
            return false;
        }
        if !self.filter.accept(fix.point) {
            log::trace!("[Tracking] Fix within {} m, suppressed", self.filter.threshold_meters());
            return false;
        }

        let current_address = match self.geocoder.reverse(fix.point).await {
            Ok(address) => address,
            Err(e) => {
                log::warn!("[Tracking] Geocode error: {e:#}");
                None
            }
        };

        let profile = self
            .profile
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let update = GeolocationUpdate {
            truck_id: profile.truck_id,
            tenant_id: self.credentials.tenant_id().unwrap_or_default(),
            current_location: fix.point,
            current_address,
            truck_number: profile.truck_number,
            drivers_name: profile.drivers_name,
        };
        self.service.send_location_update(&update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::RecordingHub;
    use crate::client::HubClient;
    use crate::credentials::Credentials;
    use crate::protocol::Address;
    use crate::tracking::geocode::NoopGeocoder;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Debug)]
    struct FailingGeocoder;

    #[async_trait]
    impl ReverseGeocoder for FailingGeocoder {
        async fn reverse(&self, _point: GeoPoint) -> anyhow::Result<Option<Address>> {
            anyhow::bail!("geocoder offline")
        }
    }

    #[derive(Debug)]
    struct FixedGeocoder;

    #[async_trait]
    impl ReverseGeocoder for FixedGeocoder {
        async fn reverse(&self, _point: GeoPoint) -> anyhow::Result<Option<Address>> {
            Ok(Some(Address {
                line1: Some("1 Dock Rd".into()),
                city: Some("Savannah".into()),
                ..Address::default()
            }))
        }
    }

    fn signed_in() -> Arc<Credentials> {
        Arc::new(Credentials {
            access_token: Some("tok".into()),
            tenant_id: Some("tenant-1".into()),
            user_id: Some("driver-1".into()),
        })
    }

    fn profile() -> DriverProfile {
        DriverProfile {
            truck_id: "truck-9".into(),
            truck_number: Some("409".into()),
            drivers_name: Some("Sam Reyes".into()),
        }
    }

    struct Fixture {
        hub: Arc<RecordingHub>,
        source: Arc<ChannelLocationSource>,
        tracker: LocationTracker,
    }

    fn fixture(
        permission: PermissionStatus,
        geocoder: Arc<dyn ReverseGeocoder>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Fixture {
        let hub = Arc::new(RecordingHub::new());
        let service = Arc::new(TrackingService::new(hub.clone()));
        let source = Arc::new(ChannelLocationSource::new(permission));
        let tracker = LocationTracker::new(source.clone(), service, geocoder, credentials, profile());
        Fixture {
            hub,
            source,
            tracker,
        }
    }

    async fn wait_for_sends(hub: &RecordingHub, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.sent().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timed out waiting for sends");
    }

    #[tokio::test]
    async fn test_fix_is_geocoded_and_sent() {
        let f = fixture(PermissionStatus::Granted, Arc::new(FixedGeocoder), signed_in());
        assert_eq!(f.tracker.start(), TrackerStatus::Running);

        assert!(f.source.push(LocationFix::now(32.08, -81.09)).await);
        wait_for_sends(&f.hub, 1).await;

        let sent = f.hub.sent();
        let payload = &sent[0].arguments[0];
        assert_eq!(sent[0].method, "SendGeolocationData");
        assert_eq!(payload["truckId"], "truck-9");
        assert_eq!(payload["tenantId"], "tenant-1");
        assert_eq!(payload["truckNumber"], "409");
        assert_eq!(payload["driversName"], "Sam Reyes");
        assert_eq!(payload["currentAddress"]["line1"], "1 Dock Rd");
        assert_eq!(payload["currentLocation"]["latitude"], 32.08);
    }

    #[tokio::test]
    async fn test_geocode_failure_still_sends_without_address() {
        let f = fixture(PermissionStatus::Granted, Arc::new(FailingGeocoder), signed_in());
        f.tracker.start();

        f.source.push(LocationFix::now(10.0, 10.0)).await;
        wait_for_sends(&f.hub, 1).await;

        assert!(f.hub.sent()[0].arguments[0]["currentAddress"].is_null());
    }

    #[tokio::test]
    async fn test_nearby_fixes_are_suppressed() {
        let f = fixture(PermissionStatus::Granted, Arc::new(NoopGeocoder), signed_in());
        f.tracker.start();

        f.source.push(LocationFix::now(40.0, -75.0)).await;
        f.source.push(LocationFix::now(40.0001, -75.0)).await; // ~11 m
        f.source.push(LocationFix::now(40.001, -75.0)).await; // ~111 m
        wait_for_sends(&f.hub, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(f.hub.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_denied_permission_refuses_to_start() {
        let f = fixture(PermissionStatus::Denied, Arc::new(NoopGeocoder), signed_in());
        assert_eq!(f.tracker.start(), TrackerStatus::Stopped);
        assert!(!f.tracker.is_running());
        assert!(!f.source.push(LocationFix::now(1.0, 1.0)).await);
    }

    #[tokio::test]
    async fn test_undetermined_permission_waits_then_runs() {
        let f = fixture(PermissionStatus::NotDetermined, Arc::new(NoopGeocoder), signed_in());
        assert_eq!(f.tracker.start(), TrackerStatus::AwaitingPermission);
        assert!(f.tracker.is_running());

        f.source.set_permission(PermissionStatus::Granted);
        assert_eq!(
            f.tracker.on_permission_changed(PermissionStatus::Granted),
            TrackerStatus::Running
        );

        f.source.push(LocationFix::now(5.0, 5.0)).await;
        wait_for_sends(&f.hub, 1).await;
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let f = fixture(PermissionStatus::Granted, Arc::new(NoopGeocoder), signed_in());
        f.tracker.start();
        f.tracker.start();

        f.source.push(LocationFix::now(5.0, 5.0)).await;
        wait_for_sends(&f.hub, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.hub.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_foreground_resume_requires_sign_in() {
        let f = fixture(
            PermissionStatus::Granted,
            Arc::new(NoopGeocoder),
            Arc::new(Credentials::default()),
        );
        assert_eq!(f.tracker.on_foreground_resume(), TrackerStatus::Stopped);

        let g = fixture(PermissionStatus::Granted, Arc::new(NoopGeocoder), signed_in());
        assert_eq!(g.tracker.on_foreground_resume(), TrackerStatus::Running);
    }

    #[tokio::test]
    async fn test_pump_reconnects_after_socket_loss() {
        let f = fixture(PermissionStatus::Granted, Arc::new(NoopGeocoder), signed_in());
        f.tracker.start();
        f.source.push(LocationFix::now(40.0, -75.0)).await;
        wait_for_sends(&f.hub, 1).await;

        f.hub.drop_connection();
        f.source.push(LocationFix::now(40.01, -75.0)).await;
        wait_for_sends(&f.hub, 2).await;

        assert!(f.hub.is_connected());
        assert_eq!(f.hub.sent()[1].arguments[0]["currentLocation"]["latitude"], 40.01);
    }

    #[tokio::test]
    async fn test_foreground_resume_reconnects_running_tracker() {
        let f = fixture(PermissionStatus::Granted, Arc::new(NoopGeocoder), signed_in());
        f.tracker.start();
        f.source.push(LocationFix::now(40.0, -75.0)).await;
        wait_for_sends(&f.hub, 1).await;
        f.hub.drop_connection();

        assert_eq!(f.tracker.on_foreground_resume(), TrackerStatus::Running);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !f.hub.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Timed out waiting for reconnect");
    }

    #[tokio::test]
    async fn test_failed_reconnect_waits_before_retrying() {
        let f = fixture(PermissionStatus::Granted, Arc::new(NoopGeocoder), signed_in());
        f.hub.fail_connect.store(true, std::sync::atomic::Ordering::SeqCst);
        f.tracker.start();

        f.source.push(LocationFix::now(40.0, -75.0)).await;
        f.source.push(LocationFix::now(41.0, -75.0)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.hub.fail_connect.store(false, std::sync::atomic::Ordering::SeqCst);
        f.source.push(LocationFix::now(42.0, -75.0)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Still inside the retry interval after the failed attempt.
        assert!(f.hub.sent().is_empty());
        assert!(!f.hub.is_connected());
    }

    #[tokio::test]
    async fn test_logout_stops_updates() {
        let f = fixture(PermissionStatus::Granted, Arc::new(NoopGeocoder), signed_in());
        f.tracker.start();
        f.tracker.on_logout();

        assert_eq!(f.tracker.status(), TrackerStatus::Stopped);
        assert!(!f.source.push(LocationFix::now(1.0, 1.0)).await);
        assert!(f.hub.sent().is_empty());
    }
}
