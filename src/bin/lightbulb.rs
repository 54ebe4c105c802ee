// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! A light bulb accessory over the IP transport: the canonical demo
//! client of the accessory server. Runs until SIGINT/SIGTERM.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use rand::RngCore;

use hap::accessory::{
    accessory_information_service, pairing_service, protocol_information_service, Accessory,
    Category, Service,
};
use hap::accessory::service_types;
use hap::characteristic::{types, Callbacks, Characteristic, Format, HapValue, Properties};
use hap::platform::mock::MockKeyValueStore;
use hap::platform::{
    Clock, Platform, Rng, ServiceDiscovery, StreamEvents, TcpStreamHandle, TcpStreamManager,
};
use hap::server::{AccessoryServer, ServerConfig, ServerState};
use hap::{Error, Result};

const SETUP_CODE: &str = "111-22-333";

struct SystemClock {
    origin: Instant,
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

struct SystemRng;

impl Rng for SystemRng {
    fn fill(&mut self, buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }
}

#[derive(Default)]
struct TcpInner {
    listener: Option<TcpListener>,
    port: u16,
    streams: HashMap<u64, TcpStream>,
    next_id: u64,
}

/// Non-blocking TCP streams over std::net, polled by the run loop.
#[derive(Clone, Default)]
struct StdTcpStreamManager {
    inner: Rc<RefCell<TcpInner>>,
}

impl StdTcpStreamManager {
    fn stream_handles(&self) -> Vec<TcpStreamHandle> {
        self.inner
            .borrow()
            .streams
            .keys()
            .map(|id| TcpStreamHandle(*id))
            .collect()
    }
}

fn io_error(kind: std::io::ErrorKind) -> Error {
    if kind == std::io::ErrorKind::WouldBlock {
        Error::Busy
    } else {
        Error::Unknown
    }
}

impl TcpStreamManager for StdTcpStreamManager {
    fn open_listener(&mut self) -> Result<()> {
        let listener = TcpListener::bind("0.0.0.0:0").map_err(|_| Error::Unknown)?;
        listener.set_nonblocking(true).map_err(|_| Error::Unknown)?;
        let mut inner = self.inner.borrow_mut();
        inner.port = listener.local_addr().map_err(|_| Error::Unknown)?.port();
        inner.listener = Some(listener);
        Ok(())
    }

    fn listener_port(&self) -> u16 {
        self.inner.borrow().port
    }

    fn accept(&mut self) -> Result<TcpStreamHandle> {
        let mut inner = self.inner.borrow_mut();
        let listener = inner.listener.as_ref().ok_or(Error::InvalidState)?;
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true).map_err(|_| Error::Unknown)?;
                let id = inner.next_id;
                inner.next_id += 1;
                inner.streams.insert(id, stream);
                info!("Accepted connection from {}.", peer);
                Ok(TcpStreamHandle(id))
            }
            Err(e) => Err(io_error(e.kind())),
        }
    }

    fn close_listener(&mut self) {
        self.inner.borrow_mut().listener = None;
    }

    fn read(&mut self, stream: TcpStreamHandle, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let stream = inner.streams.get_mut(&stream.0).ok_or(Error::Unknown)?;
        stream.read(buf).map_err(|e| io_error(e.kind()))
    }

    fn write(&mut self, stream: TcpStreamHandle, buf: &[u8]) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let stream = inner.streams.get_mut(&stream.0).ok_or(Error::Unknown)?;
        stream.write(buf).map_err(|e| io_error(e.kind()))
    }

    fn close_output(&mut self, stream: TcpStreamHandle) {
        let inner = self.inner.borrow();
        if let Some(stream) = inner.streams.get(&stream.0) {
            let _ = stream.shutdown(std::net::Shutdown::Write);
        }
    }

    fn close(&mut self, stream: TcpStreamHandle) {
        self.inner.borrow_mut().streams.remove(&stream.0);
    }

    fn update_interests(&mut self, _stream: TcpStreamHandle, _interests: StreamEvents) {
        // The run loop polls every stream; interests need no bookkeeping.
    }
}

/// mDNS advertisement through the mdns-sd daemon.
struct MdnsServiceDiscovery {
    daemon: mdns_sd::ServiceDaemon,
    name: String,
    port: u16,
    registered: Option<String>,
}

impl MdnsServiceDiscovery {
    fn new() -> Result<Self> {
        Ok(MdnsServiceDiscovery {
            daemon: mdns_sd::ServiceDaemon::new().map_err(|_| Error::Unknown)?,
            name: String::new(),
            port: 0,
            registered: None,
        })
    }

    fn publish(&mut self, txt_records: &[(&str, String)]) -> Result<()> {
        let properties: HashMap<String, String> = txt_records
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let hostname = format!("{}.local.", self.name.replace(' ', "-"));
        let info = mdns_sd::ServiceInfo::new(
            "_hap._tcp.local.",
            &self.name,
            &hostname,
            "",
            self.port,
            properties,
        )
        .map_err(|_| Error::Unknown)?
        .enable_addr_auto();
        let fullname = info.get_fullname().to_string();
        self.daemon.register(info).map_err(|_| Error::Unknown)?;
        self.registered = Some(fullname);
        Ok(())
    }
}

impl ServiceDiscovery for MdnsServiceDiscovery {
    fn register(
        &mut self,
        name: &str,
        _protocol: &str,
        port: u16,
        txt_records: &[(&str, String)],
    ) -> Result<()> {
        self.name = name.to_string();
        self.port = port;
        self.publish(txt_records)
    }

    fn update_txt_records(&mut self, txt_records: &[(&str, String)]) -> Result<()> {
        if let Some(fullname) = self.registered.take() {
            let _ = self.daemon.unregister(&fullname);
        }
        self.publish(txt_records)
    }

    fn stop(&mut self) {
        if let Some(fullname) = self.registered.take() {
            let _ = self.daemon.unregister(&fullname);
        }
        let _ = self.daemon.shutdown();
    }
}

/// The light bulb state shared between the two characteristics.
#[derive(Default)]
struct LightBulbState {
    on: bool,
    brightness: i32,
}

fn light_bulb_accessory(state: Rc<RefCell<LightBulbState>>) -> Accessory {
    let mut service = Service::new(0x30, service_types::LIGHT_BULB, "light-bulb");
    service.primary = true;
    service.name = Some("Light Bulb".to_string());

    let mut on = Characteristic::new(0x31, types::ON, Format::Bool, "on");
    on.properties = Properties::READABLE | Properties::WRITABLE | Properties::SUPPORTS_EVENTS;
    let read_state = state.clone();
    let write_state = state.clone();
    on.callbacks = Callbacks {
        read: Some(Box::new(move |_| Ok(HapValue::Bool(read_state.borrow().on)))),
        write: Some(Box::new(move |_, value| {
            if let HapValue::Bool(v) = value {
                write_state.borrow_mut().on = *v;
                info!("Light bulb is now {}.", if *v { "on" } else { "off" });
            }
            Ok(())
        })),
        ..Callbacks::default()
    };
    service.characteristics.push(on);

    let mut brightness = Characteristic::new(0x32, types::BRIGHTNESS, Format::Int32, "brightness");
    brightness.properties =
        Properties::READABLE | Properties::WRITABLE | Properties::SUPPORTS_EVENTS;
    brightness.unit = hap::characteristic::Unit::Percentage;
    brightness.constraints = hap::characteristic::Constraints::Int {
        min: 0,
        max: 100,
        step: 1,
        valid_values: None,
        valid_value_ranges: None,
    };
    let read_state = state.clone();
    let write_state = state;
    brightness.callbacks = Callbacks {
        read: Some(Box::new(move |_| {
            Ok(HapValue::Int32(read_state.borrow().brightness))
        })),
        write: Some(Box::new(move |_, value| {
            if let HapValue::Int32(v) = value {
                write_state.borrow_mut().brightness = *v;
                info!("Brightness is now {}%.", v);
            }
            Ok(())
        })),
        ..Callbacks::default()
    };
    service.characteristics.push(brightness);

    Accessory {
        aid: 1,
        category: Category::Lighting,
        name: "Acme Light Bulb".into(),
        manufacturer: "Acme".into(),
        model: "LightBulb1,1".into(),
        serial_number: "099DB48E9E28".into(),
        firmware_version: "1".into(),
        hardware_version: Some("1".into()),
        services: vec![
            accessory_information_service(1),
            protocol_information_service(0x10),
            pairing_service(0x20),
            service,
        ],
        identify: Some(Box::new(|| {
            info!("Identify routine: blink!");
            Ok(())
        })),
    }
}

fn main() {
    pretty_env_logger::init();

    let state = Rc::new(RefCell::new(LightBulbState {
        on: false,
        brightness: 100,
    }));
    let accessory = light_bulb_accessory(state);
    let accessories = vec![accessory];

    let tcp = StdTcpStreamManager::default();
    let discovery = match MdnsServiceDiscovery::new() {
        Ok(discovery) => discovery,
        Err(_) => {
            eprintln!("Failed to start the mDNS daemon.");
            std::process::exit(1);
        }
    };
    let platform = Platform {
        kv: Box::new(MockKeyValueStore::new()),
        clock: Box::new(SystemClock {
            origin: Instant::now(),
        }),
        rng: Box::new(SystemRng),
        tcp: Some(Box::new(tcp.clone())),
        discovery: Some(Box::new(discovery)),
        ble: None,
    };

    let mut config = ServerConfig::new(SETUP_CODE);
    config.setup_id = Some("ACME".to_string());
    let mut server = match AccessoryServer::new(&accessories, config, platform) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to create the accessory server: {}.", e);
            std::process::exit(1);
        }
    };
    server.set_state_handler(Box::new(|state| {
        let label = match state {
            ServerState::Idle => "Idle",
            ServerState::Running => "Running",
            ServerState::Stopping => "Stopping",
        };
        info!("Accessory server state: {}.", label);
    }));

    if let Err(e) = server.start() {
        eprintln!("Failed to start the accessory server: {}.", e);
        std::process::exit(1);
    }
    info!("Pair with setup code {}.", SETUP_CODE);

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    if ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)).is_err() {
        warn!("Could not install the signal handler; use SIGKILL to stop.");
    }

    while running.load(Ordering::SeqCst) {
        server.ip_listener_event();
        for stream in tcp.stream_handles() {
            server.ip_stream_event(stream);
        }
        server.on_timer_tick();
        std::thread::sleep(Duration::from_millis(10));
    }

    server.stop();
}
