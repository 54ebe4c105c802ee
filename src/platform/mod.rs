// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Capability traits through which the core reaches the outside world.
//!
//! Each trait mirrors one platform collaborator: persistent key-value
//! storage, the TCP stream manager, the BLE peripheral manager, mDNS
//! service discovery, the clock, and the random number generator. The
//! implementations in [`mock`] are in-memory doubles used by the test
//! suite and the demo binary; production deployments supply their own.
//!
//! All calls are non-blocking. Stream and GATT events are *pushed into*
//! the server by the external run loop; the traits only cover the
//! downward direction.

pub mod mock;

use uuid::Uuid;

use crate::Result;

/// A storage domain of the key-value store. Domains group related keys
/// and are purged as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Domain(pub u8);

/// Persistent key-value storage. Values are small opaque blobs; any
/// backend failure is normalized to `Unknown`.
pub trait KeyValueStore {
    fn get(&self, domain: Domain, key: u8) -> Result<Option<Vec<u8>>>;
    fn set(&mut self, domain: Domain, key: u8, value: &[u8]) -> Result<()>;
    fn remove(&mut self, domain: Domain, key: u8) -> Result<()>;
    /// Invokes `callback` for every key in the domain until it returns
    /// `false`.
    fn enumerate(&self, domain: Domain, callback: &mut dyn FnMut(u8) -> bool) -> Result<()>;
    fn purge_domain(&mut self, domain: Domain) -> Result<()>;
}

/// Monotonic time source.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Random number generator; expected to be cryptographically secure in
/// production.
pub trait Rng {
    fn fill(&mut self, buf: &mut [u8]);
}

/// Handle for one accepted TCP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpStreamHandle(pub u64);

/// Edge-triggered interest/readiness pair for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamEvents {
    pub has_bytes_available: bool,
    pub has_space_available: bool,
}

/// Non-blocking TCP streams plus one listener. `read` and `write` return
/// `Busy` when they would block.
pub trait TcpStreamManager {
    fn open_listener(&mut self) -> Result<()>;
    fn listener_port(&self) -> u16;
    fn accept(&mut self) -> Result<TcpStreamHandle>;
    fn close_listener(&mut self);

    fn read(&mut self, stream: TcpStreamHandle, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, stream: TcpStreamHandle, buf: &[u8]) -> Result<usize>;
    fn close_output(&mut self, stream: TcpStreamHandle);
    fn close(&mut self, stream: TcpStreamHandle);
    /// Records which readiness edges the owner wants delivered for the
    /// stream.
    fn update_interests(&mut self, stream: TcpStreamHandle, interests: StreamEvents);
}

bitflags::bitflags! {
    /// GATT attribute permissions for published characteristics and
    /// descriptors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GattProperties: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const NOTIFY = 1 << 2;
        const INDICATE = 1 << 3;
    }
}

/// Handle of a published GATT attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattHandle(pub u16);

/// Handle of a central connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u16);

/// The GATT peripheral: attribute publication, advertising, and
/// indications. Connect/disconnect/read/write/MTU upcalls are delivered
/// to the server by the run loop.
pub trait BlePeripheralManager {
    fn set_device_address(&mut self, address: &[u8; 6]);
    fn set_device_name(&mut self, name: &str);

    fn remove_all_services(&mut self);
    fn add_service(&mut self, service_type: &Uuid, primary: bool) -> Result<()>;
    /// Returns the value handle and, when `INDICATE` is requested, the
    /// client characteristic configuration descriptor handle.
    fn add_characteristic(
        &mut self,
        characteristic_type: &Uuid,
        properties: GattProperties,
    ) -> Result<(GattHandle, Option<GattHandle>)>;
    fn add_descriptor(&mut self, descriptor_type: &Uuid, value: &[u8]) -> Result<GattHandle>;
    fn publish_services(&mut self) -> Result<()>;

    fn start_advertising(&mut self, interval_ms: u16, adv_data: &[u8], scan_response: &[u8]);
    fn stop_advertising(&mut self);

    fn send_handle_value_indication(
        &mut self,
        connection: ConnectionHandle,
        handle: GattHandle,
        bytes: &[u8],
    ) -> Result<()>;
    fn cancel_central_connection(&mut self, connection: ConnectionHandle);
}

/// mDNS service discovery for the IP transport.
pub trait ServiceDiscovery {
    fn register(
        &mut self,
        name: &str,
        protocol: &str,
        port: u16,
        txt_records: &[(&str, String)],
    ) -> Result<()>;
    fn update_txt_records(&mut self, txt_records: &[(&str, String)]) -> Result<()>;
    fn stop(&mut self);
}

/// The set of capabilities handed to the server at construction. The TCP
/// and BLE sides are optional; at least one must be present for the
/// server to be reachable.
pub struct Platform {
    pub kv: Box<dyn KeyValueStore>,
    pub clock: Box<dyn Clock>,
    pub rng: Box<dyn Rng>,
    pub tcp: Option<Box<dyn TcpStreamManager>>,
    pub discovery: Option<Box<dyn ServiceDiscovery>>,
    pub ble: Option<Box<dyn BlePeripheralManager>>,
}
