// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! In-memory platform doubles.
//!
//! Every mock is a cheap handle over shared state, so a test can move one
//! clone into the server and keep another to inspect or drive it. The TCP
//! mock doubles as the remote end: `connect`/`client_send`/
//! `client_receive` play the controller side of a stream.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use uuid::Uuid;

use super::{
    BlePeripheralManager, Clock, ConnectionHandle, Domain, GattHandle, GattProperties,
    KeyValueStore, Rng, ServiceDiscovery, StreamEvents, TcpStreamHandle, TcpStreamManager,
};
use crate::{Error, Result};

/// Key-value store over a hash map.
#[derive(Clone, Default)]
pub struct MockKeyValueStore {
    inner: Rc<RefCell<HashMap<(u8, u8), Vec<u8>>>>,
}

impl MockKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries across all domains.
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }
}

impl KeyValueStore for MockKeyValueStore {
    fn get(&self, domain: Domain, key: u8) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.borrow().get(&(domain.0, key)).cloned())
    }

    fn set(&mut self, domain: Domain, key: u8, value: &[u8]) -> Result<()> {
        self.inner.borrow_mut().insert((domain.0, key), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, domain: Domain, key: u8) -> Result<()> {
        self.inner.borrow_mut().remove(&(domain.0, key));
        Ok(())
    }

    fn enumerate(&self, domain: Domain, callback: &mut dyn FnMut(u8) -> bool) -> Result<()> {
        let mut keys: Vec<u8> = self
            .inner
            .borrow()
            .keys()
            .filter(|(d, _)| *d == domain.0)
            .map(|(_, k)| *k)
            .collect();
        keys.sort_unstable();
        for key in keys {
            if !callback(key) {
                break;
            }
        }
        Ok(())
    }

    fn purge_domain(&mut self, domain: Domain) -> Result<()> {
        self.inner.borrow_mut().retain(|(d, _), _| *d != domain.0);
        Ok(())
    }
}

/// Manually advanced clock.
#[derive(Clone, Default)]
pub struct MockClock {
    now_ms: Rc<RefCell<u64>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        *self.now_ms.borrow_mut() += ms;
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        *self.now_ms.borrow()
    }
}

/// Deterministic xorshift generator. Not cryptographic; test use only.
#[derive(Clone)]
pub struct MockRng {
    state: Rc<RefCell<u64>>,
}

impl MockRng {
    pub fn with_seed(seed: u64) -> Self {
        MockRng {
            state: Rc::new(RefCell::new(seed | 1)),
        }
    }
}

impl Rng for MockRng {
    fn fill(&mut self, buf: &mut [u8]) {
        let mut state = self.state.borrow_mut();
        for chunk in buf.chunks_mut(8) {
            let mut x = *state;
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            *state = x;
            let word = x.wrapping_mul(0x2545_f491_4f6c_dd1d).to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}

#[derive(Default)]
struct MockStream {
    to_server: VecDeque<u8>,
    to_client: Vec<u8>,
    client_closed: bool,
    server_closed: bool,
    server_output_closed: bool,
    interests: StreamEvents,
}

#[derive(Default)]
struct TcpInner {
    listener_open: bool,
    pending_accepts: VecDeque<u64>,
    streams: HashMap<u64, MockStream>,
    next_id: u64,
}

/// In-memory stream manager; the clone kept by the test acts as every
/// connected controller.
#[derive(Clone, Default)]
pub struct MockTcpStreamManager {
    inner: Rc<RefCell<TcpInner>>,
}

impl MockTcpStreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a controller-side connection; the listener sees it on the
    /// next accept. The returned handle identifies the stream on both
    /// sides.
    pub fn connect(&self) -> TcpStreamHandle {
        let mut inner = self.inner.borrow_mut();
        assert!(inner.listener_open, "connecting without a listener");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.streams.insert(id, MockStream::default());
        inner.pending_accepts.push_back(id);
        TcpStreamHandle(id)
    }

    pub fn client_send(&self, stream: TcpStreamHandle, bytes: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        let s = inner.streams.get_mut(&stream.0).expect("unknown stream");
        s.to_server.extend(bytes);
    }

    /// Drains everything the server has written so far.
    pub fn client_receive(&self, stream: TcpStreamHandle) -> Vec<u8> {
        let mut inner = self.inner.borrow_mut();
        let s = inner.streams.get_mut(&stream.0).expect("unknown stream");
        std::mem::take(&mut s.to_client)
    }

    pub fn client_close(&self, stream: TcpStreamHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(s) = inner.streams.get_mut(&stream.0) {
            s.client_closed = true;
        }
    }

    /// Whether the server has closed the stream (the client read EOF).
    pub fn client_sees_eof(&self, stream: TcpStreamHandle) -> bool {
        let inner = self.inner.borrow();
        match inner.streams.get(&stream.0) {
            Some(s) => s.server_closed || s.server_output_closed,
            None => true,
        }
    }

    /// Streams with input pending for the server, for run-loop dispatch.
    pub fn streams_with_input(&self) -> Vec<TcpStreamHandle> {
        let inner = self.inner.borrow();
        let mut ids: Vec<u64> = inner
            .streams
            .iter()
            .filter(|(_, s)| {
                !s.server_closed && (!s.to_server.is_empty() || s.client_closed)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(TcpStreamHandle).collect()
    }

    pub fn has_pending_accepts(&self) -> bool {
        !self.inner.borrow().pending_accepts.is_empty()
    }

    /// The interests last registered for a stream.
    pub fn interests(&self, stream: TcpStreamHandle) -> StreamEvents {
        self.inner
            .borrow()
            .streams
            .get(&stream.0)
            .map(|s| s.interests)
            .unwrap_or_default()
    }
}

impl TcpStreamManager for MockTcpStreamManager {
    fn open_listener(&mut self) -> Result<()> {
        self.inner.borrow_mut().listener_open = true;
        Ok(())
    }

    fn listener_port(&self) -> u16 {
        5001
    }

    fn accept(&mut self) -> Result<TcpStreamHandle> {
        let mut inner = self.inner.borrow_mut();
        inner
            .pending_accepts
            .pop_front()
            .map(TcpStreamHandle)
            .ok_or(Error::Busy)
    }

    fn close_listener(&mut self) {
        self.inner.borrow_mut().listener_open = false;
    }

    fn read(&mut self, stream: TcpStreamHandle, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let s = inner.streams.get_mut(&stream.0).ok_or(Error::Unknown)?;
        if s.server_closed {
            return Err(Error::Unknown);
        }
        if s.to_server.is_empty() {
            return if s.client_closed { Ok(0) } else { Err(Error::Busy) };
        }
        let n = buf.len().min(s.to_server.len());
        for b in buf.iter_mut().take(n) {
            *b = s.to_server.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write(&mut self, stream: TcpStreamHandle, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let s = inner.streams.get_mut(&stream.0).ok_or(Error::Unknown)?;
        if s.server_closed || s.server_output_closed || s.client_closed {
            return Err(Error::Unknown);
        }
        s.to_client.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close_output(&mut self, stream: TcpStreamHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(s) = inner.streams.get_mut(&stream.0) {
            s.server_output_closed = true;
        }
    }

    fn close(&mut self, stream: TcpStreamHandle) {
        let mut inner = self.inner.borrow_mut();
        if let Some(s) = inner.streams.get_mut(&stream.0) {
            s.server_closed = true;
        }
    }

    fn update_interests(&mut self, stream: TcpStreamHandle, interests: StreamEvents) {
        let mut inner = self.inner.borrow_mut();
        if let Some(s) = inner.streams.get_mut(&stream.0) {
            s.interests = interests;
        }
    }
}

struct PublishedCharacteristic {
    characteristic_type: Uuid,
    properties: GattProperties,
    value_handle: GattHandle,
    ccc_handle: Option<GattHandle>,
}

#[derive(Default)]
struct BleInner {
    device_name: String,
    device_address: [u8; 6],
    services: Vec<(Uuid, bool)>,
    characteristics: Vec<PublishedCharacteristic>,
    descriptors: Vec<(Uuid, GattHandle, Vec<u8>)>,
    published: bool,
    advertising: Option<(u16, Vec<u8>, Vec<u8>)>,
    indications: Vec<(ConnectionHandle, GattHandle, Vec<u8>)>,
    cancelled: Vec<ConnectionHandle>,
    next_handle: u16,
}

/// Recording GATT peripheral.
#[derive(Clone, Default)]
pub struct MockBlePeripheralManager {
    inner: Rc<RefCell<BleInner>>,
}

impl MockBlePeripheralManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.borrow().advertising.is_some()
    }

    pub fn advertising_data(&self) -> Option<(u16, Vec<u8>)> {
        self.inner
            .borrow()
            .advertising
            .as_ref()
            .map(|(interval, data, _)| (*interval, data.clone()))
    }

    /// The value handle published for a characteristic type.
    pub fn value_handle(&self, characteristic_type: &Uuid) -> Option<GattHandle> {
        self.inner
            .borrow()
            .characteristics
            .iter()
            .find(|c| c.characteristic_type == *characteristic_type)
            .map(|c| c.value_handle)
    }

    pub fn take_indications(&self) -> Vec<(ConnectionHandle, GattHandle, Vec<u8>)> {
        std::mem::take(&mut self.inner.borrow_mut().indications)
    }

    pub fn cancelled_connections(&self) -> Vec<ConnectionHandle> {
        self.inner.borrow().cancelled.clone()
    }

    pub fn num_services(&self) -> usize {
        self.inner.borrow().services.len()
    }

    pub fn is_published(&self) -> bool {
        self.inner.borrow().published
    }

    pub fn device_name(&self) -> String {
        self.inner.borrow().device_name.clone()
    }

    pub fn device_address(&self) -> [u8; 6] {
        self.inner.borrow().device_address
    }

    pub fn num_descriptors(&self) -> usize {
        self.inner.borrow().descriptors.len()
    }

    pub fn characteristic_properties(&self, characteristic_type: &Uuid) -> Option<GattProperties> {
        self.inner
            .borrow()
            .characteristics
            .iter()
            .find(|c| c.characteristic_type == *characteristic_type)
            .map(|c| c.properties)
    }
}

impl BlePeripheralManager for MockBlePeripheralManager {
    fn set_device_address(&mut self, address: &[u8; 6]) {
        self.inner.borrow_mut().device_address = *address;
    }

    fn set_device_name(&mut self, name: &str) {
        self.inner.borrow_mut().device_name = name.to_string();
    }

    fn remove_all_services(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.services.clear();
        inner.characteristics.clear();
        inner.descriptors.clear();
        inner.published = false;
        inner.next_handle = 0;
    }

    fn add_service(&mut self, service_type: &Uuid, primary: bool) -> Result<()> {
        self.inner.borrow_mut().services.push((*service_type, primary));
        Ok(())
    }

    fn add_characteristic(
        &mut self,
        characteristic_type: &Uuid,
        properties: GattProperties,
    ) -> Result<(GattHandle, Option<GattHandle>)> {
        let mut inner = self.inner.borrow_mut();
        inner.next_handle += 1;
        let value_handle = GattHandle(inner.next_handle);
        let ccc_handle = if properties.contains(GattProperties::INDICATE) {
            inner.next_handle += 1;
            Some(GattHandle(inner.next_handle))
        } else {
            None
        };
        inner.characteristics.push(PublishedCharacteristic {
            characteristic_type: *characteristic_type,
            properties,
            value_handle,
            ccc_handle,
        });
        Ok((value_handle, ccc_handle))
    }

    fn add_descriptor(&mut self, descriptor_type: &Uuid, value: &[u8]) -> Result<GattHandle> {
        let mut inner = self.inner.borrow_mut();
        inner.next_handle += 1;
        let handle = GattHandle(inner.next_handle);
        inner.descriptors.push((*descriptor_type, handle, value.to_vec()));
        Ok(handle)
    }

    fn publish_services(&mut self) -> Result<()> {
        self.inner.borrow_mut().published = true;
        Ok(())
    }

    fn start_advertising(&mut self, interval_ms: u16, adv_data: &[u8], scan_response: &[u8]) {
        self.inner.borrow_mut().advertising =
            Some((interval_ms, adv_data.to_vec(), scan_response.to_vec()));
    }

    fn stop_advertising(&mut self) {
        self.inner.borrow_mut().advertising = None;
    }

    fn send_handle_value_indication(
        &mut self,
        connection: ConnectionHandle,
        handle: GattHandle,
        bytes: &[u8],
    ) -> Result<()> {
        self.inner
            .borrow_mut()
            .indications
            .push((connection, handle, bytes.to_vec()));
        Ok(())
    }

    fn cancel_central_connection(&mut self, connection: ConnectionHandle) {
        self.inner.borrow_mut().cancelled.push(connection);
    }
}

#[derive(Default)]
struct DiscoveryInner {
    name: String,
    protocol: String,
    port: u16,
    txt: Vec<(String, String)>,
    registered: bool,
    stopped: bool,
}

/// Recording service discovery.
#[derive(Clone, Default)]
pub struct MockServiceDiscovery {
    inner: Rc<RefCell<DiscoveryInner>>,
}

impl MockServiceDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self) -> bool {
        self.inner.borrow().registered
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.borrow().stopped
    }

    pub fn registered_service(&self) -> (String, String, u16) {
        let inner = self.inner.borrow();
        (inner.name.clone(), inner.protocol.clone(), inner.port)
    }

    pub fn txt_value(&self, key: &str) -> Option<String> {
        self.inner
            .borrow()
            .txt
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

impl ServiceDiscovery for MockServiceDiscovery {
    fn register(
        &mut self,
        name: &str,
        protocol: &str,
        port: u16,
        txt_records: &[(&str, String)],
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.name = name.to_string();
        inner.protocol = protocol.to_string();
        inner.port = port;
        inner.txt = txt_records
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        inner.registered = true;
        inner.stopped = false;
        Ok(())
    }

    fn update_txt_records(&mut self, txt_records: &[(&str, String)]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.txt = txt_records
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Ok(())
    }

    fn stop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.registered = false;
        inner.stopped = true;
    }
}
