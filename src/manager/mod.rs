//! # Mesh manager core
//!
//! [`Manager`] is the single value that owns the transport, the
//! device-state model, the init-capture buffer, and the scheduler
//! tasks (§9 redesign note: no implicit globals, no process-wide
//! registration slots — the virtual-node broadcaster, push notifier,
//! and completion callback are all passed in at construction).
//! [`ManagerHandle`] is the cheap, cloneable, `Send + Sync` front door
//! external callers (REST handlers, the virtual-node server) use to
//! invoke the outbound surface without touching the dispatch loop.

pub mod autoack;
pub mod autowelcome;
pub mod capture;
pub mod device_state;
pub mod dispatch;
pub mod geo;
pub mod outbound;
pub mod scheduler;
pub mod template;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::config::{Config, SchedulerConfig};
use crate::error::{ManagerError, ManagerResult};
use crate::push::PushNotifier;
use crate::store::MeshStore;
use crate::transport::{self, TransportEvent, TransportHandle};
use crate::virtual_node::VirtualNodeBroadcaster;

use autoack::AutoAckRegexCache;
use capture::{CaptureSnapshotHandle, InitCaptureBuffer};
use device_state::DeviceState;
use outbound::{OutboundSurface, SessionPasskey};
use scheduler::SchedulerSupervisor;

/// §3 `Connection state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    UserDisconnected,
}

type CompletionCallback = Arc<dyn Fn() + Send + Sync>;
type PasskeyWaiters = Arc<Mutex<Vec<oneshot::Sender<SessionPasskey>>>>;

/// Tri-state favorites-support flag shared with [`ManagerHandle`] (§4.15,
/// I7). `0` = unknown, `1` = supported, `2` = not supported. Kept as a
/// plain atomic rather than behind the same lock as [`DeviceState`]
/// because the dispatch loop is the only writer and external callers
/// only ever need a cheap, eventually-consistent read before gating a
/// favorites admin call.
const FAVORITES_UNKNOWN: u8 = 0;
const FAVORITES_YES: u8 = 1;
const FAVORITES_NO: u8 = 2;

/// Cheap, cloneable handle external callers use to drive the manager
/// (§5 "External callers ... invoking the outbound surface and query
/// methods"). Holds no mutable dispatch state of its own.
#[derive(Clone)]
pub struct ManagerHandle {
    outbound: Arc<OutboundSurface>,
    store: Arc<dyn MeshStore>,
    transport: TransportHandle,
    passkey_waiters: PasskeyWaiters,
    is_connected: Arc<AtomicBool>,
    favorites_supported: Arc<AtomicU8>,
    init_capture: CaptureSnapshotHandle,
    schedulers: Arc<SchedulerSupervisor>,
}

impl ManagerHandle {
    pub fn outbound(&self) -> ManagerResult<&OutboundSurface> {
        if self.is_connected.load(Ordering::SeqCst) {
            Ok(&self.outbound)
        } else {
            Err(ManagerError::NotConnected)
        }
    }

    pub fn store(&self) -> &Arc<dyn MeshStore> {
        &self.store
    }

    /// §4.15: favorites add/remove must fail with `FirmwareNotSupported`
    /// unless the firmware is known (≥ 2.7.0) to support it (I7). Treats
    /// "unknown" the same as "no" — a caller that hasn't yet seen a
    /// `DeviceMetadata` frame gets a clear rejection, not a guess.
    fn require_favorites_support(&self) -> ManagerResult<()> {
        if self.favorites_supported.load(Ordering::SeqCst) == FAVORITES_YES {
            Ok(())
        } else {
            Err(ManagerError::FirmwareNotSupported)
        }
    }

    pub async fn add_favorite_node(&self, node_num: u32) -> ManagerResult<()> {
        self.require_favorites_support()?;
        self.outbound()?
            .add_favorite_node(node_num)
            .await
            .map_err(|e| ManagerError::Transport(e.to_string()))
    }

    pub async fn remove_favorite_node(&self, node_num: u32) -> ManagerResult<()> {
        self.require_favorites_support()?;
        self.outbound()?
            .remove_favorite_node(node_num)
            .await
            .map_err(|e| ManagerError::Transport(e.to_string()))
    }

    /// §2 "Init-capture buffer ... exposed as a snapshot for replay",
    /// §4.14 "snapshots are returned by value (defensive copy)". Called
    /// by the (external, out-of-scope) virtual-node server when a
    /// mobile client connects and needs the init sequence replayed.
    pub fn init_capture_snapshot(&self) -> Vec<bytes::Bytes> {
        self.init_capture.snapshot()
    }

    /// User-initiated disconnect (§3, §5: "cancels all schedulers").
    /// Scheduler cancellation happens because `is_connected` flips to
    /// false and each scheduler tick checks it before acting.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// §3 "Scheduler state ... Mutated only by configuration API;
    /// schedulers restart on change", §4.12 "Any configuration change
    /// restarts the active scheduler; disabling stops all timers". The
    /// narrow configuration API spec.md calls for: the new section is
    /// validated before anything currently running is touched, so a
    /// rejected update leaves both scheduler tasks exactly as they were.
    pub fn update_scheduler_config(&self, scheduler: SchedulerConfig) -> ManagerResult<()> {
        self.schedulers
            .update_scheduler_config(scheduler)
            .map_err(|e| ManagerError::InvalidConfiguration(e.to_string()))
    }

    /// `requestSessionPasskey()` (§4.7): waits ≈3s for a device
    /// response. Required before remote-node admin ops; not required
    /// for local TCP admin operations.
    pub async fn request_session_passkey(&self) -> ManagerResult<SessionPasskey> {
        if !self.is_connected.load(Ordering::SeqCst) {
            return Err(ManagerError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        self.passkey_waiters
            .lock()
            .expect("passkey waiters mutex poisoned")
            .push(tx);
        self.outbound
            .request_session_passkey(rx)
            .await
            .map_err(|e| ManagerError::Transport(e.to_string()))
    }
}

/// Owns the transport, device-state, init-capture buffer, and (via
/// [`ManagerHandle`]) the outbound surface. Runs the single dispatch
/// loop that processes inbound frames in wire order (§5).
pub struct Manager {
    transport_events: mpsc::Receiver<TransportEvent>,
    transport: TransportHandle,
    store: Arc<dyn MeshStore>,
    push: Arc<dyn PushNotifier>,
    virtual_node: Arc<dyn VirtualNodeBroadcaster>,
    outbound: Arc<OutboundSurface>,
    device_state: DeviceState,
    capture: InitCaptureBuffer,
    connection_state: ConnectionState,
    config: Config,
    autoack_cache: AutoAckRegexCache,
    session_passkey: Option<SessionPasskey>,
    passkey_waiters: PasskeyWaiters,
    on_config_capture_complete: Option<CompletionCallback>,
    is_connected: Arc<AtomicBool>,
    favorites_supported: Arc<AtomicU8>,
    started_at: DateTime<Utc>,
    /// Longest route-segment distance observed so far (§4.9
    /// "update the record-holder flag"); tracked here because the store
    /// interface exposes `updateRecordHolderSegment` as a point write,
    /// not a query over every segment ever seen.
    longest_segment_km: f64,
}

impl Manager {
    /// Connects to `config.session.host:port` and returns the running
    /// manager paired with a handle external callers use. Folds the
    /// spec's `connect(host, port)` contract into construction — this
    /// crate models one `Manager` as one configured, continuously
    /// (re)connecting session, not a disconnected value connected
    /// later by a separate call (see DESIGN.md).
    pub fn connect(
        config: Config,
        store: Arc<dyn MeshStore>,
        push: Arc<dyn PushNotifier>,
        virtual_node: Arc<dyn VirtualNodeBroadcaster>,
        on_config_capture_complete: Option<CompletionCallback>,
    ) -> (Manager, ManagerHandle) {
        let stale_timeout = std::time::Duration::from_millis(config.session.stale_timeout_ms);
        let (transport, transport_events) =
            transport::connect(config.session.host.clone(), config.session.port, stale_timeout);

        let outbound = Arc::new(OutboundSurface::new(transport.clone(), store.clone()));
        let is_connected = Arc::new(AtomicBool::new(false));
        let favorites_supported = Arc::new(AtomicU8::new(FAVORITES_UNKNOWN));
        let passkey_waiters: PasskeyWaiters = Arc::new(Mutex::new(Vec::new()));
        let capture = InitCaptureBuffer::new();

        let started_at = Utc::now();
        let schedulers = SchedulerSupervisor::spawn(
            config.clone(),
            store.clone(),
            outbound.clone(),
            is_connected.clone(),
            started_at,
        );

        let handle = ManagerHandle {
            outbound: outbound.clone(),
            store: store.clone(),
            transport: transport.clone(),
            passkey_waiters: passkey_waiters.clone(),
            is_connected: is_connected.clone(),
            favorites_supported: favorites_supported.clone(),
            init_capture: capture.snapshot_handle(),
            schedulers,
        };

        let manager = Manager {
            transport_events,
            transport,
            store,
            push,
            virtual_node,
            outbound,
            device_state: DeviceState::new(),
            capture,
            connection_state: ConnectionState::Connecting,
            config,
            autoack_cache: AutoAckRegexCache::default(),
            session_passkey: None,
            passkey_waiters,
            on_config_capture_complete,
            is_connected,
            favorites_supported,
            started_at,
            longest_segment_km: 0.0,
        };

        (manager, handle)
    }

    /// Drives the dispatch loop until the transport shuts down (either
    /// through a user-initiated disconnect or because every
    /// [`ManagerHandle`] / [`TransportHandle`] was dropped).
    pub async fn run(mut self) {
        while let Some(event) = self.transport_events.recv().await {
            match event {
                TransportEvent::Connected => {
                    info!("transport connected");
                    self.connection_state = ConnectionState::Connected;
                    self.is_connected.store(true, Ordering::SeqCst);
                    self.device_state.invalidate_favorites_cache();
                    self.sync_favorites_cache();
                    self.begin_init_capture().await;
                }
                TransportEvent::Message(frame) => {
                    self.handle_frame(frame).await;
                }
                TransportEvent::Disconnected => {
                    info!("transport disconnected");
                    self.is_connected.store(false, Ordering::SeqCst);
                    self.connection_state = if self.connection_state == ConnectionState::UserDisconnected {
                        ConnectionState::UserDisconnected
                    } else {
                        ConnectionState::Disconnected
                    };
                    self.device_state.invalidate_favorites_cache();
                    self.sync_favorites_cache();
                }
                TransportEvent::Error(message) => {
                    warn!("transport error: {}", message);
                }
            }
        }
    }

    /// Recomputes `supportsFavorites()` and republishes it to the shared
    /// atomic [`ManagerHandle`] reads (§4.15). Called whenever something
    /// that could change the answer happens: connect, disconnect, or a
    /// firmware-version update.
    pub(super) fn sync_favorites_cache(&mut self) {
        let supported = self.device_state.supports_favorites();
        self.favorites_supported.store(
            if supported { FAVORITES_YES } else { FAVORITES_NO },
            Ordering::SeqCst,
        );
    }

    /// §4.14: clear buffer, start capturing, request config in stages.
    async fn begin_init_capture(&mut self) {
        self.capture.start();
        let mut request_id: u32 = rand::random();
        if request_id == 0 {
            request_id = 1;
        }
        if let Err(e) = self.outbound.send_want_config_id(request_id).await {
            warn!("want_config_id send skipped, transport not ready: {}", e);
        }

        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            let _ = outbound.get_config(0).await;
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            for module in 0..13i32 {
                let _ = outbound.get_module_config(module).await;
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        });
    }
}
