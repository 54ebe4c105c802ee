// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The BLE transport: GATT table publication, HAP-PDU procedures against
//! the attribute database, the secured session envelope, and the
//! advertising state machine for regular and disconnected-event
//! broadcasts.

use std::collections::{BTreeSet, HashMap};

use log::{debug, info, warn};

use crate::access::{self, AccessError, ReadKind};
use crate::accessory::service_types;
use crate::ble::adv::{self, AdvertisementInfo};
use crate::ble::pdu::{self, body_types, BleStatus, OpCode, PduRequest, RequestAssembler};
use crate::characteristic::{types, Characteristic, Constraints, Format, HapValue, Properties};
use crate::event;
use crate::hapuuid::HapUuid;
use crate::pairing::setup::SetupContext;
use crate::pairing::verify::{PairVerify, VerifyContext};
use crate::pairing::{store, KEY_BROADCAST_KEY};
use crate::platform::{BlePeripheralManager, ConnectionHandle, GattHandle, GattProperties};
use crate::server::ServerCore;
use crate::session::{SecuredChannel, SessionHandle, TransportType};
use crate::tlv8::{self, Reader, Tlv, TlvSlot};
use crate::{Error, Result};

/// Owner token used for pair-setup procedures arriving over BLE.
const BLE_SETUP_OWNER: u64 = u64::MAX;

/// BLE timed writes expire after TTL × 100 ms, still bounded by the
/// overall 5 s limit.
const TIMED_WRITE_UNIT_MS: u64 = 100;

struct PendingTimedWrite {
    iid: u16,
    body: Vec<u8>,
    expires_ms: u64,
}

/// The BLE transport. At most one central is bound at a time.
pub struct BleTransport {
    ble: Box<dyn BlePeripheralManager>,
    connection: Option<ConnectionHandle>,
    session: Option<SessionHandle>,
    mtu: usize,
    assembler: RequestAssembler,
    verify: PairVerify,
    /// Value handle to characteristic instance id of the primary
    /// accessory (BLE never exposes bridged accessories).
    value_handles: HashMap<GattHandle, u16>,
    ccc_handles: HashMap<GattHandle, u16>,
    /// Response fragments waiting to be collected by GATT reads.
    pending_fragments: Vec<Vec<u8>>,
    /// Whether those fragments are sealed on the way out. A response
    /// composed before session keys existed stays plaintext.
    seal_pending_response: bool,
    /// Characteristics with broadcast notifications enabled.
    broadcasts_enabled: BTreeSet<u16>,
    pending_timed_write: Option<PendingTimedWrite>,
    /// Shared secret of the current verified session; the broadcast key
    /// derives from it.
    shared_secret: Option<[u8; 32]>,
    /// While set, the notification advertisement is active and reverts at
    /// this time.
    notification_until: Option<u64>,
}

impl BleTransport {
    pub fn new(ble: Box<dyn BlePeripheralManager>) -> Self {
        BleTransport {
            ble,
            connection: None,
            session: None,
            mtu: pdu::DEFAULT_MTU,
            assembler: RequestAssembler::new(),
            verify: PairVerify::new(),
            value_handles: HashMap::new(),
            ccc_handles: HashMap::new(),
            pending_fragments: Vec::new(),
            seal_pending_response: false,
            broadcasts_enabled: BTreeSet::new(),
            pending_timed_write: None,
            shared_secret: None,
            notification_until: None,
        }
    }

    /// Publishes the GATT table for the primary accessory and starts
    /// regular advertising.
    pub fn start(&mut self, core: &mut ServerCore<'_>) -> Result<()> {
        let primary = core.db.primary();
        self.ble.set_device_address(&core.identity.device_id);
        self.ble.set_device_name(&primary.name);
        self.ble.remove_all_services();
        self.value_handles.clear();
        self.ccc_handles.clear();

        for service in &primary.services {
            self.ble.add_service(&service.service_type, service.primary)?;
            for characteristic in &service.characteristics {
                let mut properties = GattProperties::READ | GattProperties::WRITE;
                if characteristic
                    .properties
                    .contains(Properties::SUPPORTS_EVENTS)
                {
                    properties |= GattProperties::INDICATE;
                }
                let (value_handle, ccc_handle) = self
                    .ble
                    .add_characteristic(&characteristic.char_type, properties)?;
                self.value_handles
                    .insert(value_handle, characteristic.iid as u16);
                if let Some(ccc_handle) = ccc_handle {
                    self.ccc_handles.insert(ccc_handle, characteristic.iid as u16);
                }
            }
        }
        self.ble.publish_services()?;
        self.advertise_regular(core);
        info!("BLE transport published {} services.", primary.services.len());
        Ok(())
    }

    pub fn stop(&mut self, core: &mut ServerCore<'_>) {
        if let Some(connection) = self.connection.take() {
            self.ble.cancel_central_connection(connection);
        }
        if let Some(session) = self.session.take() {
            core.sessions.free(session);
        }
        self.ble.stop_advertising();
        self.ble.remove_all_services();
    }

    /// Publishes the regular advertisement from the current server state.
    pub fn advertise_regular(&mut self, core: &mut ServerCore<'_>) {
        let (gsn, _) = store::load_gsn(core.kv.as_ref()).unwrap_or((1, 0));
        let info = AdvertisementInfo {
            paired: core.is_paired(),
            device_id: core.identity.device_id,
            category: core.db.primary().category as u16,
            gsn,
            config_number: (core.config_number() & 0xff) as u8,
            setup_hash: core.setup_hash(),
        };
        let adv_data = adv::regular_advertisement(&info);
        let scan_response = adv::scan_response(&core.db.primary().name);
        self.notification_until = None;
        self.ble
            .start_advertising(adv::REGULAR_INTERVAL_MS, &adv_data, &scan_response);
    }

    pub fn on_connect(&mut self, core: &mut ServerCore<'_>, connection: ConnectionHandle) {
        if self.connection.is_some() {
            warn!("BLE central connected while another is bound; cancelling.");
            self.ble.cancel_central_connection(connection);
            return;
        }
        debug!("BLE central {:?} connected.", connection);
        self.connection = Some(connection);
        self.session = core.sessions.allocate(TransportType::Ble, core.now_ms()).ok();
        if self.session.is_none() {
            warn!("No session slot for BLE central; cancelling connection.");
            self.ble.cancel_central_connection(connection);
            self.connection = None;
        }
    }

    pub fn on_disconnect(&mut self, core: &mut ServerCore<'_>, connection: ConnectionHandle) {
        if self.connection != Some(connection) {
            return;
        }
        debug!("BLE central {:?} disconnected.", connection);
        self.connection = None;
        if let Some(session) = self.session.take() {
            core.sessions.free(session);
        }
        core.pair_setup.owner_disconnected(BLE_SETUP_OWNER);
        self.verify.reset();
        self.assembler.reset();
        self.pending_fragments.clear();
        self.seal_pending_response = false;
        self.pending_timed_write = None;
        self.shared_secret = None;
        self.advertise_regular(core);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn on_mtu_changed(&mut self, mtu: usize) {
        self.mtu = mtu.max(pdu::DEFAULT_MTU);
        debug!("BLE MTU is now {}.", self.mtu);
    }

    /// Handles a CCC descriptor write: the controller enabling or
    /// disabling connected-event indications.
    pub fn on_ccc_write(&mut self, core: &mut ServerCore<'_>, handle: GattHandle, enabled: bool) {
        let (iid, session_handle) = match (self.ccc_handles.get(&handle), self.session) {
            (Some(iid), Some(session)) => (*iid as u64, session),
            _ => return,
        };
        let aid = core.db.primary().aid;
        if let Some(session) = core.sessions.get_mut(session_handle) {
            let result = if enabled {
                access::subscribe(core.db, session, aid, iid)
            } else {
                access::unsubscribe(core.db, session, aid, iid)
            };
            if result.is_err() {
                debug!("CCC write for {}.{} rejected.", aid, iid);
            }
        }
    }

    /// Handles a GATT write to a characteristic value handle: one request
    /// fragment, possibly encrypted.
    pub fn on_gatt_write(
        &mut self,
        core: &mut ServerCore<'_>,
        connection: ConnectionHandle,
        handle: GattHandle,
        bytes: &[u8],
    ) {
        if self.connection != Some(connection) {
            return;
        }
        let iid = match self.value_handles.get(&handle) {
            Some(iid) => *iid,
            None => return,
        };
        let plaintext = match self.open_secured(core, bytes) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                self.teardown_session(core);
                return;
            }
        };
        let request = match self.assembler.push(&plaintext) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(_) => {
                warn!("Malformed HAP-PDU fragment; dropping procedure.");
                self.assembler.reset();
                return;
            }
        };
        if !self.pending_fragments.is_empty() {
            // The previous procedure's response was never collected.
            self.queue_response(core, request.tid, BleStatus::MaxProcedures, &[]);
            return;
        }
        // Service-level opcodes address a service instance id through the
        // signature characteristic's handle.
        let service_level = matches!(
            request.opcode,
            OpCode::ServiceSignatureRead
                | OpCode::ProtocolConfiguration
                | OpCode::AccessorySignatureRead
        );
        if !service_level && request.iid != iid {
            self.queue_response(core, request.tid, BleStatus::InvalidInstanceId, &[]);
            return;
        }
        self.dispatch(core, request);
    }

    /// Handles a GATT read on a characteristic value handle: returns the
    /// next response fragment.
    pub fn on_gatt_read(
        &mut self,
        core: &mut ServerCore<'_>,
        connection: ConnectionHandle,
        _handle: GattHandle,
    ) -> Vec<u8> {
        if self.connection != Some(connection) {
            return Vec::new();
        }
        if self.pending_fragments.is_empty() {
            return Vec::new();
        }
        let fragment = self.pending_fragments.remove(0);
        if self.seal_pending_response {
            self.seal_secured(core, &fragment)
        } else {
            fragment
        }
    }

    /// Sends connected-event indications or switches to the notification
    /// advertisement for a raised characteristic.
    pub fn on_event_raised(&mut self, core: &mut ServerCore<'_>, aid: u64, iid: u64) {
        let primary_aid = core.db.primary().aid;
        if aid != primary_aid || iid > u16::MAX as u64 {
            return;
        }
        let characteristic = match core.db.characteristic(aid, iid) {
            Some((_, _, characteristic)) => characteristic,
            None => return,
        };

        if self.connection.is_some() {
            let subscribed = self
                .session
                .and_then(|handle| core.sessions.get(handle))
                .map(|session| session.subscriptions.contains(&(aid, iid)))
                .unwrap_or(false);
            if subscribed {
                let handle = self
                    .value_handles
                    .iter()
                    .find(|(_, v)| **v as u64 == iid)
                    .map(|(handle, _)| *handle);
                if let (Some(handle), Some(connection)) = (handle, self.connection) {
                    // Empty indication; the controller reads the value.
                    let _ = self.ble.send_handle_value_indication(connection, handle, &[]);
                }
            }
            return;
        }

        if !characteristic
            .properties
            .contains(Properties::BLE_SUPPORTS_DISCONNECTED_NOTIFICATION)
        {
            return;
        }
        let broadcast_key = match core.broadcast_key() {
            Some(key) => key,
            None => return,
        };
        let (gsn, _) = match store::load_gsn(core.kv.as_ref()) {
            Ok(gsn) => gsn,
            Err(_) => return,
        };
        let value = self
            .session
            .and_then(|handle| core.sessions.get(handle))
            .and_then(|session| access::read(core.db, session, aid, iid, ReadKind::Addressed).ok())
            .map(|value| encode_value(&value))
            .unwrap_or_default();
        let adv_data = adv::notification_advertisement(
            &core.identity.device_id,
            &broadcast_key,
            gsn,
            iid as u16,
            &value,
        );
        let scan_response = adv::scan_response(&core.db.primary().name);
        debug!("Switching to notification advertisement for {}.{}.", aid, iid);
        self.ble
            .start_advertising(adv::NOTIFICATION_INTERVAL_MS, &adv_data, &scan_response);
        self.notification_until = Some(core.now_ms() + adv::NOTIFICATION_DURATION_MS);
    }

    /// Reverts expired notification advertisements and delivers due
    /// connected events.
    pub fn on_timer_tick(&mut self, core: &mut ServerCore<'_>) {
        if let Some(until) = self.notification_until {
            if core.now_ms() >= until {
                debug!("Notification advertisement period over; back to regular.");
                self.advertise_regular(core);
            }
        }
        if let Some(session_handle) = self.session {
            let now_ms = core.now_ms();
            let due = core
                .sessions
                .get_mut(session_handle)
                .and_then(|session| event::take_due_events(session, now_ms));
            if let Some(events) = due {
                for (aid, iid) in events {
                    self.on_event_raised(core, aid, iid);
                }
            }
        }
    }

    fn teardown_session(&mut self, core: &mut ServerCore<'_>) {
        warn!("BLE session security failure; disconnecting central.");
        if let Some(connection) = self.connection {
            self.ble.cancel_central_connection(connection);
        }
        self.on_disconnect(core, self.connection.unwrap_or(ConnectionHandle(0)));
    }

    fn open_secured(&mut self, core: &mut ServerCore<'_>, bytes: &[u8]) -> Result<Vec<u8>> {
        let session = self
            .session
            .and_then(|handle| core.sessions.get_mut(handle))
            .ok_or(Error::InvalidState)?;
        match session.secured.as_mut() {
            Some(channel) => channel.open(&[], bytes),
            None => Ok(bytes.to_vec()),
        }
    }

    fn seal_secured(&mut self, core: &mut ServerCore<'_>, bytes: &[u8]) -> Vec<u8> {
        let session = self
            .session
            .and_then(|handle| core.sessions.get_mut(handle));
        match session.and_then(|s| s.secured.as_mut()) {
            Some(channel) => channel.seal(&[], bytes),
            None => bytes.to_vec(),
        }
    }

    fn queue_response(
        &mut self,
        core: &mut ServerCore<'_>,
        tid: u8,
        status: BleStatus,
        body: &[u8],
    ) {
        self.seal_pending_response = self.is_secured(core);
        self.pending_fragments = pdu::build_response(tid, status, body, self.mtu);
    }

    fn dispatch(&mut self, core: &mut ServerCore<'_>, request: PduRequest) {
        let aid = core.db.primary().aid;
        let iid = request.iid as u64;
        debug!("BLE {:?} for iid {}.", request.opcode, iid);
        match request.opcode {
            OpCode::CharacteristicSignatureRead => {
                match core.db.characteristic(aid, iid) {
                    Some((_, service, characteristic)) => {
                        let body = characteristic_signature(
                            service.iid as u16,
                            &service.service_type,
                            characteristic,
                        );
                        self.queue_response(core, request.tid, BleStatus::Success, &body);
                    }
                    None => {
                        self.queue_response(core, request.tid, BleStatus::InvalidInstanceId, &[])
                    }
                }
            }
            OpCode::ServiceSignatureRead => match core.db.service(aid, iid) {
                Some((_, service)) => {
                    let mut properties = 0u16;
                    if service.primary {
                        properties |= 1 << 0;
                    }
                    if service.hidden {
                        properties |= 1 << 1;
                    }
                    if service.supports_configuration {
                        properties |= 1 << 2;
                    }
                    let mut linked = Vec::with_capacity(service.linked_services.len() * 2);
                    for linked_iid in &service.linked_services {
                        linked.extend_from_slice(&(*linked_iid as u16).to_le_bytes());
                    }
                    let body = tlv8::encode(&[
                        Tlv::new(body_types::SERVICE_PROPERTIES, properties.to_le_bytes().to_vec()),
                        Tlv::new(body_types::LINKED_SERVICES, linked),
                    ]);
                    self.queue_response(core, request.tid, BleStatus::Success, &body);
                }
                None => self.queue_response(core, request.tid, BleStatus::InvalidInstanceId, &[]),
            },
            OpCode::CharacteristicRead => self.characteristic_read(core, request),
            OpCode::CharacteristicWrite => self.characteristic_write(core, request),
            OpCode::CharacteristicTimedWrite => self.timed_write(core, request),
            OpCode::CharacteristicExecuteWrite => self.execute_write(core, request),
            OpCode::CharacteristicConfiguration => self.characteristic_configuration(core, request),
            OpCode::ProtocolConfiguration => self.protocol_configuration(core, request),
            OpCode::AccessorySignatureRead => {
                let body = accessory_signature(core);
                self.queue_response(core, request.tid, BleStatus::Success, &body);
            }
        }
    }

    fn is_secured(&self, core: &ServerCore<'_>) -> bool {
        self.session
            .and_then(|handle| core.sessions.get(handle))
            .map(|session| session.is_secured())
            .unwrap_or(false)
    }

    fn characteristic_read(&mut self, core: &mut ServerCore<'_>, request: PduRequest) {
        let aid = core.db.primary().aid;
        let iid = request.iid as u64;
        let characteristic = match core.db.characteristic(aid, iid) {
            Some((_, _, characteristic)) => characteristic,
            None => {
                self.queue_response(core, request.tid, BleStatus::InvalidInstanceId, &[]);
                return;
            }
        };

        // The pairing characteristics answer through write-with-response
        // only.
        if characteristic.char_type == types::PAIR_SETUP
            || characteristic.char_type == types::PAIR_VERIFY
        {
            self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
            return;
        }
        if !self.is_secured(core)
            && !characteristic
                .properties
                .contains(Properties::BLE_READABLE_WITHOUT_SECURITY)
        {
            self.queue_response(core, request.tid, BleStatus::InsufficientAuthentication, &[]);
            return;
        }

        let session = match self.session.and_then(|handle| core.sessions.get(handle)) {
            Some(session) => session,
            None => {
                self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
                return;
            }
        };
        match access::read(core.db, session, aid, iid, ReadKind::Addressed) {
            Ok(value) => {
                let body = tlv8::encode(&[Tlv::new(body_types::VALUE, encode_value(&value))]);
                self.queue_response(core, request.tid, BleStatus::Success, &body);
            }
            Err(error) => {
                let status = ble_status_of(error);
                self.queue_response(core, request.tid, status, &[]);
            }
        }
    }

    fn characteristic_write(&mut self, core: &mut ServerCore<'_>, request: PduRequest) {
        let aid = core.db.primary().aid;
        let iid = request.iid as u64;
        let char_type = match core.db.characteristic(aid, iid) {
            Some((_, _, characteristic)) => characteristic.char_type,
            None => {
                self.queue_response(core, request.tid, BleStatus::InvalidInstanceId, &[]);
                return;
            }
        };

        let mut slots = [
            TlvSlot::new(body_types::VALUE),
            TlvSlot::new(body_types::AUTHORIZATION_DATA),
            TlvSlot::new(body_types::RETURN_RESPONSE),
        ];
        if Reader::new(&request.body).extract(&mut slots).is_err() {
            self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
            return;
        }
        let [value, authorization_data, return_response] = slots;
        let value = match value.value {
            Some(value) => value,
            None => {
                self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
                return;
            }
        };

        if char_type == types::PAIR_SETUP {
            self.pair_setup_write(core, request.tid, &value);
            return;
        }
        if char_type == types::PAIR_VERIFY {
            self.pair_verify_write(core, request.tid, &value);
            return;
        }

        let characteristic = match core.db.characteristic(aid, iid) {
            Some((_, _, characteristic)) => characteristic,
            None => return,
        };
        if !self.is_secured(core)
            && !characteristic
                .properties
                .contains(Properties::BLE_WRITABLE_WITHOUT_SECURITY)
        {
            self.queue_response(core, request.tid, BleStatus::InsufficientAuthentication, &[]);
            return;
        }
        let typed = match decode_value(characteristic.format, &value) {
            Some(typed) => typed,
            None => {
                self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
                return;
            }
        };
        let wants_response = return_response.value.as_deref() == Some(&[0x01]);

        let session_handle = match self.session {
            Some(handle) => handle,
            None => return,
        };
        let now = core.now_ms();
        let session = match core.sessions.get_mut(session_handle) {
            Some(session) => session,
            None => return,
        };
        let result = access::write(
            core.db,
            session,
            aid,
            iid,
            &typed,
            authorization_data.value.as_deref(),
            None,
            now,
        );
        match result {
            Ok(_) => {
                let body = if wants_response {
                    core.sessions
                        .get(session_handle)
                        .and_then(|session| {
                            access::read(core.db, session, aid, iid, ReadKind::Addressed).ok()
                        })
                        .map(|value| {
                            tlv8::encode(&[Tlv::new(body_types::VALUE, encode_value(&value))])
                        })
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                self.queue_response(core, request.tid, BleStatus::Success, &body);
            }
            Err(error) => {
                let status = ble_status_of(error);
                self.queue_response(core, request.tid, status, &[]);
            }
        }
    }

    fn pair_setup_write(&mut self, core: &mut ServerCore<'_>, tid: u8, value: &[u8]) {
        let now = core.now_ms();
        let mut ctx = SetupContext {
            kv: core.kv.as_mut(),
            rng: core.rng.as_mut(),
            identity: &core.identity,
            store: &core.store,
            setup: &core.setup,
        };
        match core.pair_setup.handle(&mut ctx, BLE_SETUP_OWNER, value, now) {
            Ok(response) => {
                if response.completed {
                    core.bump_gsn();
                    self.advertise_regular(core);
                }
                let body = tlv8::encode(&[Tlv::new(body_types::VALUE, response.body)]);
                self.queue_response(core, tid, BleStatus::Success, &body);
            }
            Err(_) => self.queue_response(core, tid, BleStatus::InvalidRequest, &[]),
        }
    }

    fn pair_verify_write(&mut self, core: &mut ServerCore<'_>, tid: u8, value: &[u8]) {
        let now = core.now_ms();
        let mut ctx = VerifyContext {
            kv: core.kv.as_ref(),
            rng: core.rng.as_mut(),
            identity: &core.identity,
            store: &core.store,
            resume: &mut core.resume,
            now_ms: now,
        };
        match self.verify.handle(&mut ctx, value) {
            Ok(response) => {
                if let Some(keys) = response.installed {
                    if let Some(session) = self
                        .session
                        .and_then(|handle| core.sessions.get_mut(handle))
                    {
                        info!("BLE session secured for {:?}.", keys.controller);
                        self.shared_secret = Some(keys.shared_secret);
                        session.secured = Some(SecuredChannel::new(
                            keys.controller,
                            keys.controller_is_admin,
                            keys.encrypt_key,
                            keys.decrypt_key,
                        ));
                    }
                }
                let body = tlv8::encode(&[Tlv::new(body_types::VALUE, response.body)]);
                // The completing response is still read in plaintext; the
                // new keys only cover traffic after it.
                self.seal_pending_response = false;
                self.pending_fragments = pdu::build_response(tid, BleStatus::Success, &body, self.mtu);
            }
            Err(_) => self.queue_response(core, tid, BleStatus::InvalidRequest, &[]),
        }
    }

    fn timed_write(&mut self, core: &mut ServerCore<'_>, request: PduRequest) {
        let mut slots = [TlvSlot::new(body_types::VALUE), TlvSlot::new(body_types::TTL)];
        if Reader::new(&request.body).extract(&mut slots).is_err() {
            self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
            return;
        }
        let [value, ttl] = slots;
        let (value, ttl) = match (value.value, ttl.value.as_deref()) {
            (Some(value), Some([ttl])) => (value, *ttl as u64),
            _ => {
                self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
                return;
            }
        };
        let ttl_ms = (ttl * TIMED_WRITE_UNIT_MS).min(access::MAX_TIMED_WRITE_TTL_MS);
        self.pending_timed_write = Some(PendingTimedWrite {
            iid: request.iid,
            body: value,
            expires_ms: core.now_ms() + ttl_ms,
        });
        self.queue_response(core, request.tid, BleStatus::Success, &[]);
    }

    fn execute_write(&mut self, core: &mut ServerCore<'_>, request: PduRequest) {
        let pending = match self.pending_timed_write.take() {
            Some(pending) if pending.iid == request.iid => pending,
            _ => {
                self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
                return;
            }
        };
        if core.now_ms() >= pending.expires_ms {
            debug!("Timed write expired before execution.");
            self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
            return;
        }
        let synthesized = PduRequest {
            opcode: OpCode::CharacteristicWrite,
            tid: request.tid,
            iid: pending.iid,
            body: tlv8::encode(&[Tlv::new(body_types::VALUE, pending.body)]),
        };
        self.characteristic_write(core, synthesized);
    }

    fn characteristic_configuration(&mut self, core: &mut ServerCore<'_>, request: PduRequest) {
        if !self.is_secured(core) {
            self.queue_response(core, request.tid, BleStatus::InsufficientAuthentication, &[]);
            return;
        }
        let mut slots = [TlvSlot::new(0x01)];
        if Reader::new(&request.body).extract(&mut slots).is_err() {
            self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
            return;
        }
        let properties = slots[0]
            .value
            .as_deref()
            .and_then(|v| match v {
                [a] => Some(*a as u16),
                [a, b] => Some(u16::from_le_bytes([*a, *b])),
                _ => None,
            })
            .unwrap_or(0);
        if properties & 0x01 != 0 {
            self.broadcasts_enabled.insert(request.iid);
        } else {
            self.broadcasts_enabled.remove(&request.iid);
        }
        let body = tlv8::encode(&[Tlv::new(0x01, properties.to_le_bytes().to_vec())]);
        self.queue_response(core, request.tid, BleStatus::Success, &body);
    }

    fn protocol_configuration(&mut self, core: &mut ServerCore<'_>, request: PduRequest) {
        if !self.is_secured(core) {
            self.queue_response(core, request.tid, BleStatus::InsufficientAuthentication, &[]);
            return;
        }
        // The target must be the protocol information service.
        let aid = core.db.primary().aid;
        let service_ok = core
            .db
            .service(aid, request.iid as u64)
            .map(|(_, service)| service.service_type == service_types::PROTOCOL_INFORMATION)
            .unwrap_or(false);
        if !service_ok {
            self.queue_response(core, request.tid, BleStatus::InvalidInstanceId, &[]);
            return;
        }

        let mut slots = [TlvSlot::new(0x01), TlvSlot::new(0x02)];
        if Reader::new(&request.body).extract(&mut slots).is_err() {
            self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
            return;
        }
        let generate_key = slots[0].value.is_some();
        if generate_key {
            match self.shared_secret {
                Some(shared) => {
                    let key = crate::crypto::derive_key(&shared, &[], b"Broadcast-Encryption-Key");
                    if core
                        .kv
                        .set(store::DOMAIN_DEVICE, KEY_BROADCAST_KEY, &key)
                        .is_err()
                    {
                        self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
                        return;
                    }
                    info!("Generated new broadcast encryption key.");
                }
                None => {
                    self.queue_response(core, request.tid, BleStatus::InvalidRequest, &[]);
                    return;
                }
            }
        }

        let (gsn, _) = store::load_gsn(core.kv.as_ref()).unwrap_or((1, 0));
        let mut items = vec![
            Tlv::new(0x01, gsn.to_le_bytes().to_vec()),
            Tlv::new(0x02, vec![(core.config_number() & 0xff) as u8]),
        ];
        if let Some(key) = core.broadcast_key() {
            items.push(Tlv::new(0x03, key.to_vec()));
        }
        let body = tlv8::encode(&items);
        self.queue_response(core, request.tid, BleStatus::Success, &body);
    }
}

fn ble_status_of(error: AccessError) -> BleStatus {
    match error {
        AccessError::NotFound => BleStatus::InvalidInstanceId,
        AccessError::NotAllowed => BleStatus::InsufficientAuthorization,
        AccessError::InsufficientAuthorization => BleStatus::InsufficientAuthorization,
        AccessError::NotReadable
        | AccessError::NotWritable
        | AccessError::NotifyUnsupported
        | AccessError::InvalidValue => BleStatus::InvalidRequest,
        AccessError::Core(_) => BleStatus::InvalidRequest,
    }
}

/// Encodes a value into its BLE wire representation.
pub fn encode_value(value: &HapValue) -> Vec<u8> {
    match value {
        HapValue::Null => Vec::new(),
        HapValue::Bool(v) => vec![*v as u8],
        HapValue::UInt8(v) => vec![*v],
        HapValue::UInt16(v) => v.to_le_bytes().to_vec(),
        HapValue::UInt32(v) => v.to_le_bytes().to_vec(),
        HapValue::UInt64(v) => v.to_le_bytes().to_vec(),
        HapValue::Int32(v) => v.to_le_bytes().to_vec(),
        HapValue::Float32(v) => v.to_le_bytes().to_vec(),
        HapValue::String(s) => s.as_bytes().to_vec(),
        HapValue::Data(bytes) | HapValue::Tlv8(bytes) => bytes.clone(),
    }
}

/// Decodes a BLE wire value into the characteristic's format.
pub fn decode_value(format: Format, bytes: &[u8]) -> Option<HapValue> {
    match format {
        Format::Bool => match bytes {
            [0] => Some(HapValue::Bool(false)),
            [1] => Some(HapValue::Bool(true)),
            _ => None,
        },
        Format::UInt8 => match bytes {
            [v] => Some(HapValue::UInt8(*v)),
            _ => None,
        },
        Format::UInt16 => bytes
            .try_into()
            .ok()
            .map(|b: [u8; 2]| HapValue::UInt16(u16::from_le_bytes(b))),
        Format::UInt32 => bytes
            .try_into()
            .ok()
            .map(|b: [u8; 4]| HapValue::UInt32(u32::from_le_bytes(b))),
        Format::UInt64 => bytes
            .try_into()
            .ok()
            .map(|b: [u8; 8]| HapValue::UInt64(u64::from_le_bytes(b))),
        Format::Int32 => bytes
            .try_into()
            .ok()
            .map(|b: [u8; 4]| HapValue::Int32(i32::from_le_bytes(b))),
        Format::Float32 => bytes
            .try_into()
            .ok()
            .map(|b: [u8; 4]| HapValue::Float32(f32::from_le_bytes(b))),
        Format::String => std::str::from_utf8(bytes)
            .ok()
            .map(|s| HapValue::String(s.to_string())),
        Format::Data => Some(HapValue::Data(bytes.to_vec())),
        Format::Tlv8 => Some(HapValue::Tlv8(bytes.to_vec())),
    }
}

/// HAP BLE characteristic property mask for signature reads.
fn ble_properties_mask(properties: Properties) -> u16 {
    let mut mask = 0u16;
    if properties.contains(Properties::BLE_READABLE_WITHOUT_SECURITY) {
        mask |= 1 << 0;
    }
    if properties.contains(Properties::BLE_WRITABLE_WITHOUT_SECURITY) {
        mask |= 1 << 1;
    }
    if properties.contains(Properties::SUPPORTS_AUTHORIZATION_DATA) {
        mask |= 1 << 2;
    }
    if properties.contains(Properties::REQUIRES_TIMED_WRITE) {
        mask |= 1 << 3;
    }
    if properties.contains(Properties::READABLE) {
        mask |= 1 << 4;
    }
    if properties.contains(Properties::WRITABLE) {
        mask |= 1 << 5;
    }
    if properties.contains(Properties::HIDDEN) {
        mask |= 1 << 6;
    }
    if properties.contains(Properties::SUPPORTS_EVENTS) {
        mask |= 1 << 7;
    }
    if properties.contains(Properties::BLE_SUPPORTS_DISCONNECTED_NOTIFICATION) {
        mask |= 1 << 8;
    }
    if properties.contains(Properties::BLE_SUPPORTS_BROADCAST_NOTIFICATION) {
        mask |= 1 << 9;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_codec_round_trips_per_format() {
        let cases = [
            (Format::Bool, HapValue::Bool(true)),
            (Format::UInt8, HapValue::UInt8(7)),
            (Format::UInt16, HapValue::UInt16(0x1234)),
            (Format::UInt32, HapValue::UInt32(0xdead_beef)),
            (Format::UInt64, HapValue::UInt64(u64::MAX - 1)),
            (Format::Int32, HapValue::Int32(-40)),
            (Format::Float32, HapValue::Float32(21.5)),
            (Format::String, HapValue::String("Träger".into())),
            (Format::Data, HapValue::Data(vec![1, 2, 3])),
            (Format::Tlv8, HapValue::Tlv8(vec![0x01, 0x01, 0xff])),
        ];
        for (format, value) in cases {
            let encoded = encode_value(&value);
            assert_eq!(decode_value(format, &encoded), Some(value));
        }
    }

    #[test]
    fn bool_decoding_is_strict() {
        assert_eq!(decode_value(Format::Bool, &[2]), None);
        assert_eq!(decode_value(Format::Bool, &[0, 1]), None);
        assert_eq!(decode_value(Format::UInt16, &[1]), None);
    }

    #[test]
    fn properties_mask_covers_security_split() {
        let props = Properties::READABLE
            | Properties::WRITABLE
            | Properties::SUPPORTS_EVENTS
            | Properties::BLE_READABLE_WITHOUT_SECURITY;
        let mask = ble_properties_mask(props);
        assert_eq!(mask & (1 << 0), 1 << 0);
        assert_eq!(mask & (1 << 1), 0);
        assert_eq!(mask & (1 << 4), 1 << 4);
        assert_eq!(mask & (1 << 5), 1 << 5);
        assert_eq!(mask & (1 << 7), 1 << 7);
    }

    #[test]
    fn signature_body_carries_type_and_format() {
        let mut characteristic =
            Characteristic::new(0x31, types::ON, Format::Bool, "on");
        characteristic.properties = Properties::READABLE | Properties::WRITABLE;
        let body = characteristic_signature(
            0x30,
            &crate::accessory::service_types::LIGHT_BULB,
            &characteristic,
        );
        let mut slots = [
            TlvSlot::new(body_types::CHARACTERISTIC_TYPE),
            TlvSlot::new(body_types::SERVICE_IID),
            TlvSlot::new(body_types::SERVICE_TYPE),
            TlvSlot::new(body_types::PROPERTIES),
            TlvSlot::new(body_types::PRESENTATION_FORMAT),
        ];
        Reader::new(&body).extract(&mut slots).unwrap();
        assert_eq!(
            slots[0].value.as_deref(),
            Some(&types::ON.to_hap_bytes()[..])
        );
        assert_eq!(slots[1].value.as_deref(), Some(&[0x30, 0x00][..]));
        assert!(slots[2].value.is_some());
        assert!(slots[3].value.is_some());
        let presentation = slots[4].value.clone().unwrap();
        assert_eq!(presentation.len(), 7);
        assert_eq!(presentation[0], 0x01);
    }
}

/// Serializes the whole attribute tree of the primary accessory; the
/// response spans as many fragment reads as the MTU demands.
fn accessory_signature(core: &ServerCore<'_>) -> Vec<u8> {
    let primary = core.db.primary();
    let mut items = Vec::new();
    for (i, service) in primary.services.iter().enumerate() {
        if i > 0 {
            items.push(Tlv::new(crate::pairing::tlv_types::SEPARATOR, vec![]));
        }
        items.push(Tlv::new(
            body_types::SERVICE_IID,
            (service.iid as u16).to_le_bytes().to_vec(),
        ));
        items.push(Tlv::new(
            body_types::SERVICE_TYPE,
            service.service_type.to_hap_bytes().to_vec(),
        ));
        let mut properties = 0u16;
        if service.primary {
            properties |= 1 << 0;
        }
        if service.hidden {
            properties |= 1 << 1;
        }
        if service.supports_configuration {
            properties |= 1 << 2;
        }
        items.push(Tlv::new(
            body_types::SERVICE_PROPERTIES,
            properties.to_le_bytes().to_vec(),
        ));
        for characteristic in &service.characteristics {
            items.push(Tlv::new(crate::pairing::tlv_types::SEPARATOR, vec![]));
            items.push(Tlv::new(
                body_types::CHARACTERISTIC_IID,
                (characteristic.iid as u16).to_le_bytes().to_vec(),
            ));
            items.push(Tlv::new(
                body_types::CHARACTERISTIC_TYPE,
                characteristic.char_type.to_hap_bytes().to_vec(),
            ));
            items.push(Tlv::new(
                body_types::PROPERTIES,
                ble_properties_mask(characteristic.properties)
                    .to_le_bytes()
                    .to_vec(),
            ));
        }
    }
    tlv8::encode(&items)
}

/// Builds the signature-read body for a characteristic.
fn characteristic_signature(
    service_iid: u16,
    service_type: &uuid::Uuid,
    characteristic: &Characteristic,
) -> Vec<u8> {
    let mut items = vec![
        Tlv::new(
            body_types::CHARACTERISTIC_TYPE,
            characteristic.char_type.to_hap_bytes().to_vec(),
        ),
        Tlv::new(body_types::SERVICE_IID, service_iid.to_le_bytes().to_vec()),
        Tlv::new(body_types::SERVICE_TYPE, service_type.to_hap_bytes().to_vec()),
        Tlv::new(
            body_types::PROPERTIES,
            ble_properties_mask(characteristic.properties)
                .to_le_bytes()
                .to_vec(),
        ),
    ];
    if let Some(description) = &characteristic.manufacturer_description {
        items.push(Tlv::new(
            body_types::USER_DESCRIPTION,
            description.as_bytes().to_vec(),
        ));
    }

    // GATT presentation format: format code, exponent, unit, namespace,
    // description.
    let mut presentation = [0u8; 7];
    presentation[0] = characteristic.format.ble_code();
    presentation[2..4].copy_from_slice(&characteristic.unit.ble_code().to_le_bytes());
    presentation[4] = 0x01;
    items.push(Tlv::new(
        body_types::PRESENTATION_FORMAT,
        presentation.to_vec(),
    ));

    match &characteristic.constraints {
        Constraints::None | Constraints::String { .. } | Constraints::Data { .. } => {}
        Constraints::UInt {
            min,
            max,
            step,
            valid_values,
            valid_value_ranges,
        } => {
            let width = match characteristic.format {
                Format::UInt8 => 1,
                Format::UInt16 => 2,
                Format::UInt32 => 4,
                _ => 8,
            };
            let mut range = Vec::with_capacity(width * 2);
            range.extend_from_slice(&min.to_le_bytes()[..width]);
            range.extend_from_slice(&max.to_le_bytes()[..width]);
            items.push(Tlv::new(body_types::VALID_RANGE, range));
            items.push(Tlv::new(
                body_types::STEP_VALUE,
                step.to_le_bytes()[..width].to_vec(),
            ));
            if characteristic.char_type.is_apple_defined() {
                if let Some(values) = valid_values {
                    let bytes: Vec<u8> = values.iter().map(|v| *v as u8).collect();
                    items.push(Tlv::new(body_types::VALID_VALUES, bytes));
                }
                if let Some(ranges) = valid_value_ranges {
                    let mut bytes = Vec::with_capacity(ranges.len() * 2);
                    for (start, end) in ranges {
                        bytes.push(*start as u8);
                        bytes.push(*end as u8);
                    }
                    items.push(Tlv::new(body_types::VALID_VALUES_RANGE, bytes));
                }
            }
        }
        Constraints::Int { min, max, step, .. } => {
            let mut range = Vec::with_capacity(8);
            range.extend_from_slice(&min.to_le_bytes());
            range.extend_from_slice(&max.to_le_bytes());
            items.push(Tlv::new(body_types::VALID_RANGE, range));
            items.push(Tlv::new(body_types::STEP_VALUE, step.to_le_bytes().to_vec()));
        }
        Constraints::Float { min, max, step } => {
            if min.is_finite() && max.is_finite() {
                let mut range = Vec::with_capacity(8);
                range.extend_from_slice(&min.to_le_bytes());
                range.extend_from_slice(&max.to_le_bytes());
                items.push(Tlv::new(body_types::VALID_RANGE, range));
                items.push(Tlv::new(body_types::STEP_VALUE, step.to_le_bytes().to_vec()));
            }
        }
    }
    tlv8::encode(&items)
}
