// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The accessory server: lifecycle, persistent counters, event raising,
//! and the plumbing between the external run loop, the platform
//! capabilities, and the two transports.

use log::{error, info, warn};

use crate::accessory::{self, Accessory, Database};
use crate::ble::BleTransport;
use crate::event;
use crate::ip::IpTransport;
use crate::pairing::setup::{PairSetup, SetupInfo};
use crate::pairing::store::{self, DeviceIdentity};
use crate::pairing::verify::ResumeCache;
use crate::pairing::{PairingStore, KEY_BROADCAST_KEY};
use crate::platform::{
    Clock, ConnectionHandle, GattHandle, KeyValueStore, Platform, Rng, TcpStreamHandle,
};
use crate::session::{SessionHandle, SessionPool};
use crate::{Error, Result};

/// Default number of concurrent IP sessions.
pub const DEFAULT_MAX_IP_SESSIONS: usize = 17;

/// Default number of pairing slots.
pub const DEFAULT_MAX_PAIRINGS: usize = 16;

static_assertions::const_assert!(DEFAULT_MAX_IP_SESSIONS >= 8);

/// Server lifecycle states. A state-change handler observes every
/// transition synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Running,
    Stopping,
}

/// Construction-time options.
pub struct ServerConfig {
    /// Setup code in `XXX-XX-XXX` form.
    pub setup_code: String,
    /// Four-character setup id behind the `sh` TXT record and the
    /// advertisement setup hash.
    pub setup_id: Option<String>,
    pub max_ip_sessions: usize,
    pub max_pairings: usize,
}

impl ServerConfig {
    pub fn new(setup_code: &str) -> Self {
        ServerConfig {
            setup_code: setup_code.to_string(),
            setup_id: None,
            max_ip_sessions: DEFAULT_MAX_IP_SESSIONS,
            max_pairings: DEFAULT_MAX_PAIRINGS,
        }
    }
}

/// State shared by both transports: the attribute database, platform
/// capabilities, pairing machinery, and the session pool.
pub struct ServerCore<'a> {
    pub db: Database<'a>,
    pub kv: Box<dyn KeyValueStore>,
    pub clock: Box<dyn Clock>,
    pub rng: Box<dyn Rng>,
    pub identity: DeviceIdentity,
    pub store: PairingStore,
    pub setup: SetupInfo,
    pub sessions: SessionPool,
    pub pair_setup: PairSetup,
    pub resume: ResumeCache,
    setup_id: Option<String>,
}

impl<'a> ServerCore<'a> {
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn is_paired(&self) -> bool {
        self.store.is_paired(self.kv.as_ref()).unwrap_or(false)
    }

    pub fn config_number(&self) -> u32 {
        store::load_config_number(self.kv.as_ref()).unwrap_or(1)
    }

    /// Increments the global state number; every event raise and pairing
    /// mutation goes through here.
    pub fn bump_gsn(&mut self) {
        if let Err(e) = store::increment_gsn(self.kv.as_mut()) {
            error!("Failed to persist GSN: {}.", e);
        }
    }

    /// First four bytes of SHA-512 over setup id and device id, for the
    /// `sh` TXT record and the advertisement.
    pub fn setup_hash(&self) -> Option<[u8; 4]> {
        let setup_id = self.setup_id.as_deref()?;
        let mut message = Vec::with_capacity(setup_id.len() + 17);
        message.extend_from_slice(setup_id.as_bytes());
        message.extend_from_slice(self.identity.id_string().as_bytes());
        let digest = crate::crypto::sha512(&message);
        Some([digest[0], digest[1], digest[2], digest[3]])
    }

    pub fn broadcast_key(&self) -> Option<[u8; 32]> {
        match self.kv.get(store::DOMAIN_DEVICE, KEY_BROADCAST_KEY) {
            Ok(Some(bytes)) if bytes.len() == 32 => bytes.try_into().ok(),
            _ => None,
        }
    }
}

/// The process-wide accessory server. Owns the platform capabilities and
/// borrows the attribute database for its lifetime.
pub struct AccessoryServer<'a> {
    core: ServerCore<'a>,
    ip: Option<IpTransport>,
    ble: Option<BleTransport>,
    state: ServerState,
    on_state_change: Option<Box<dyn Fn(ServerState)>>,
}

impl<'a> AccessoryServer<'a> {
    /// Builds a server from an accessory list, configuration, and
    /// platform. The device identity is loaded (or created) here; the
    /// database is validated at `start`.
    pub fn new(
        accessories: &'a [Accessory],
        config: ServerConfig,
        platform: Platform,
    ) -> Result<Self> {
        let Platform {
            mut kv,
            clock,
            mut rng,
            tcp,
            discovery,
            ble,
        } = platform;
        if tcp.is_none() && ble.is_none() {
            error!("Accessory server needs at least one transport.");
            return Err(Error::InvalidData);
        }

        let identity = DeviceIdentity::load_or_create(kv.as_mut(), rng.as_mut())?;
        let setup = SetupInfo::from_code(rng.as_mut(), &config.setup_code)?;
        let ble_enabled = ble.is_some();
        let pool_size = config.max_ip_sessions + usize::from(ble_enabled);

        Ok(AccessoryServer {
            core: ServerCore {
                db: Database::new(accessories),
                kv,
                clock,
                rng,
                identity,
                store: PairingStore::new(config.max_pairings),
                setup,
                sessions: SessionPool::new(pool_size),
                pair_setup: PairSetup::new(),
                resume: ResumeCache::new(),
                setup_id: config.setup_id,
            },
            ip: tcp.map(|tcp| IpTransport::new(tcp, discovery)),
            ble: ble.map(BleTransport::new),
            state: ServerState::Idle,
            on_state_change: None,
        })
    }

    /// Installs the state-change handler, invoked synchronously on every
    /// transition.
    pub fn set_state_handler(&mut self, handler: Box<dyn Fn(ServerState)>) {
        self.on_state_change = Some(handler);
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    fn transition(&mut self, state: ServerState) {
        self.state = state;
        if let Some(handler) = &self.on_state_change {
            handler(state);
        }
    }

    /// Validates the database and brings both transports up. Validation
    /// failures are fatal and leave the server idle.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ServerState::Idle {
            return Err(Error::InvalidState);
        }
        accessory::validate(self.core.db.accessories, self.ble.is_some())?;
        if let Some(ip) = self.ip.as_mut() {
            ip.start(&mut self.core)?;
        }
        if let Some(ble) = self.ble.as_mut() {
            ble.start(&mut self.core)?;
        }
        info!(
            "Accessory server running; device id {}.",
            self.core.identity.id_string()
        );
        self.transition(ServerState::Running);
        Ok(())
    }

    /// Drains the transports and returns to idle. In the single-threaded
    /// model the drain completes synchronously.
    pub fn stop(&mut self) {
        if self.state != ServerState::Running {
            return;
        }
        self.transition(ServerState::Stopping);
        if let Some(ip) = self.ip.as_mut() {
            ip.stop(&mut self.core);
        }
        if let Some(ble) = self.ble.as_mut() {
            ble.stop(&mut self.core);
        }
        for handle in self.core.sessions.handles() {
            self.core.sessions.free(handle);
        }
        self.core.pair_setup.reset();
        info!("Accessory server stopped.");
        self.transition(ServerState::Idle);
    }

    /// Removes all pairings and volatile keys; the accessory returns to
    /// the unpaired, discoverable state. The device identity survives.
    pub fn factory_reset(&mut self) -> Result<()> {
        warn!("Factory reset: purging pairings and derived keys.");
        self.core.store.purge(self.core.kv.as_mut())?;
        self.core.kv.remove(store::DOMAIN_DEVICE, KEY_BROADCAST_KEY)?;
        self.core
            .kv
            .remove(store::DOMAIN_DEVICE, store::KEY_SETUP_ATTEMPTS)?;
        self.core.resume.clear();
        self.core.pair_setup.reset();
        if self.state == ServerState::Running {
            if let Some(ip) = self.ip.as_mut() {
                ip.invalidate_all_secured(&mut self.core);
                ip.update_advertisement(&mut self.core);
            }
            if let Some(ble) = self.ble.as_mut() {
                ble.advertise_regular(&mut self.core);
            }
        }
        Ok(())
    }

    /// Schedules event notification for every subscribed session and, on
    /// BLE, triggers the disconnected-notification advertisement when no
    /// central is connected.
    pub fn raise_event(&mut self, aid: u64, iid: u64) {
        self.core.bump_gsn();
        event::raise(&mut self.core.sessions, aid, iid);
        if let Some(ble) = self.ble.as_mut() {
            if !ble.is_connected() {
                ble.on_event_raised(&mut self.core, aid, iid);
            }
        }
    }

    /// Schedules event notification for one session only.
    pub fn raise_event_on_session(&mut self, session: SessionHandle, aid: u64, iid: u64) {
        self.core.bump_gsn();
        event::raise_on_session(&mut self.core.sessions, session, aid, iid);
    }

    /// Periodic work: event delivery, pairing timeouts, advertisement
    /// reverts. The run loop calls this every ~50-100 ms while running.
    pub fn on_timer_tick(&mut self) {
        if self.state != ServerState::Running {
            return;
        }
        let now = self.core.now_ms();
        self.core.pair_setup.expire(now);
        if let Some(ip) = self.ip.as_mut() {
            ip.on_timer_tick(&mut self.core);
        }
        if let Some(ble) = self.ble.as_mut() {
            ble.on_timer_tick(&mut self.core);
        }
    }

    // Run-loop upcalls, IP side.

    pub fn ip_listener_event(&mut self) {
        if self.state != ServerState::Running {
            return;
        }
        if let Some(ip) = self.ip.as_mut() {
            ip.on_listener_event(&mut self.core);
        }
    }

    pub fn ip_stream_event(&mut self, stream: TcpStreamHandle) {
        if self.state != ServerState::Running {
            return;
        }
        if let Some(ip) = self.ip.as_mut() {
            ip.on_stream_event(&mut self.core, stream);
        }
    }

    // Run-loop upcalls, BLE side.

    pub fn ble_central_connected(&mut self, connection: ConnectionHandle) {
        if let Some(ble) = self.ble.as_mut() {
            ble.on_connect(&mut self.core, connection);
        }
    }

    pub fn ble_central_disconnected(&mut self, connection: ConnectionHandle) {
        if let Some(ble) = self.ble.as_mut() {
            ble.on_disconnect(&mut self.core, connection);
        }
    }

    pub fn ble_mtu_changed(&mut self, mtu: usize) {
        if let Some(ble) = self.ble.as_mut() {
            ble.on_mtu_changed(mtu);
        }
    }

    pub fn ble_gatt_write(
        &mut self,
        connection: ConnectionHandle,
        handle: GattHandle,
        bytes: &[u8],
    ) {
        if self.state != ServerState::Running {
            return;
        }
        if let Some(ble) = self.ble.as_mut() {
            ble.on_gatt_write(&mut self.core, connection, handle, bytes);
        }
    }

    pub fn ble_gatt_read(&mut self, connection: ConnectionHandle, handle: GattHandle) -> Vec<u8> {
        if self.state != ServerState::Running {
            return Vec::new();
        }
        match self.ble.as_mut() {
            Some(ble) => ble.on_gatt_read(&mut self.core, connection, handle),
            None => Vec::new(),
        }
    }

    pub fn ble_ccc_write(&mut self, handle: GattHandle, enabled: bool) {
        if self.state != ServerState::Running {
            return;
        }
        if let Some(ble) = self.ble.as_mut() {
            ble.on_ccc_write(&mut self.core, handle, enabled);
        }
    }
}
