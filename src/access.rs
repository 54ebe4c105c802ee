// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The attribute access engine: read, write, subscribe, and unsubscribe
//! against the attribute database, with the policy gates applied in a
//! fixed order and short-circuiting on the first failure.

use log::debug;

use crate::accessory::Database;
use crate::characteristic::{
    types, HapValue, Properties, ReadContext, SubscriptionContext, WriteContext,
};
use crate::session::{Session, TimedWrite, TransportType};
use crate::Error;

/// Upper bound for a timed-write window.
pub const MAX_TIMED_WRITE_TTL_MS: u64 = 5_000;

/// Why an access operation was refused. Transports map these onto their
/// own status vocabularies, which distinguish more cases than the core
/// error set does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// No characteristic with this `(aid, iid)`.
    NotFound,
    NotReadable,
    NotWritable,
    NotifyUnsupported,
    /// The admin gate rejected the request.
    NotAllowed,
    /// The write callback rejected the authorization data.
    InsufficientAuthorization,
    /// The value fails format or constraint validation.
    InvalidValue,
    /// Carried through from the user callback or the timed-write gate.
    Core(Error),
}

impl From<Error> for AccessError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotAuthorized => AccessError::InsufficientAuthorization,
            Error::InvalidData => AccessError::InvalidValue,
            other => AccessError::Core(other),
        }
    }
}

/// How a read was triggered: an addressed read names the characteristic,
/// an enumeration read walks the whole graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    Addressed,
    Enumeration,
}

/// Reads a characteristic value. Bounded and synchronous; control-point
/// and event-only characteristics yield `Null` without reaching the
/// handler.
pub fn read(
    db: Database<'_>,
    session: &Session,
    aid: u64,
    iid: u64,
    kind: ReadKind,
) -> Result<HapValue, AccessError> {
    let (accessory, _, characteristic) =
        db.characteristic(aid, iid).ok_or(AccessError::NotFound)?;

    if !characteristic.properties.contains(Properties::READABLE) {
        return Err(AccessError::NotReadable);
    }
    if characteristic.properties.read_requires_admin() && !session.is_admin() {
        return Err(AccessError::NotAllowed);
    }
    // Input events only ever flow through notifications.
    if characteristic.char_type == types::PROGRAMMABLE_SWITCH_EVENT {
        return Ok(HapValue::Null);
    }
    if kind == ReadKind::Enumeration
        && characteristic.properties.contains(Properties::IP_CONTROL_POINT)
    {
        return Ok(HapValue::Null);
    }

    let callback = characteristic
        .callbacks
        .read
        .as_ref()
        .ok_or(AccessError::Core(Error::Unknown))?;
    let value = callback(&ReadContext {
        accessory,
        iid,
        transport: session.transport,
    })
    .map_err(AccessError::from)?;
    Ok(value)
}

/// The outcome of a successful write.
pub struct WriteOutcome {
    /// Filled when the characteristic declares write-response: the value
    /// read back on the same session immediately after the write.
    pub response_value: Option<HapValue>,
}

/// Writes a characteristic value, consuming the session's timed-write
/// window when one applies.
#[allow(clippy::too_many_arguments)]
pub fn write(
    db: Database<'_>,
    session: &mut Session,
    aid: u64,
    iid: u64,
    value: &HapValue,
    authorization_data: Option<&[u8]>,
    pid: Option<u64>,
    now_ms: u64,
) -> Result<WriteOutcome, AccessError> {
    let (accessory, _, characteristic) =
        db.characteristic(aid, iid).ok_or(AccessError::NotFound)?;

    if !characteristic.properties.contains(Properties::WRITABLE) {
        return Err(AccessError::NotWritable);
    }
    if characteristic.properties.write_requires_admin() && !session.is_admin() {
        return Err(AccessError::NotAllowed);
    }

    // Timed-write gate: a required or supplied PID must match an
    // unexpired window prepared on this session. The window is one-shot.
    if session.transport == TransportType::Ip {
        let requires = characteristic
            .properties
            .contains(Properties::REQUIRES_TIMED_WRITE);
        match (pid, session.timed_write) {
            (None, _) if requires => {
                debug!("Write without PID to a timed-write characteristic.");
                return Err(AccessError::Core(Error::InvalidState));
            }
            (None, _) => {}
            (Some(pid), Some(window)) if window.pid == pid && now_ms < window.expires_ms => {
                session.timed_write = None;
            }
            (Some(_), _) => {
                debug!("Timed write with missing, stale, or foreign PID.");
                session.timed_write = None;
                return Err(AccessError::Core(Error::InvalidState));
            }
        }
    }

    characteristic
        .validate_value(value)
        .map_err(|_| AccessError::InvalidValue)?;

    let callback = characteristic
        .callbacks
        .write
        .as_ref()
        .ok_or(AccessError::Core(Error::Unknown))?;
    callback(
        &WriteContext {
            accessory,
            iid,
            transport: session.transport,
            authorization_data,
            timed: pid.is_some(),
        },
        value,
    )
    .map_err(AccessError::from)?;

    let response_value = if session.transport == TransportType::Ip
        && characteristic
            .properties
            .contains(Properties::IP_SUPPORTS_WRITE_RESPONSE)
    {
        let read_back = characteristic
            .callbacks
            .read
            .as_ref()
            .ok_or(AccessError::Core(Error::Unknown))?;
        Some(
            read_back(&ReadContext {
                accessory,
                iid,
                transport: session.transport,
            })
            .map_err(AccessError::from)?,
        )
    } else {
        None
    };

    Ok(WriteOutcome { response_value })
}

/// Opens a timed-write window on the session. The TTL is clamped to the
/// protocol maximum.
pub fn prepare_timed_write(session: &mut Session, pid: u64, ttl_ms: u64, now_ms: u64) {
    let ttl_ms = ttl_ms.min(MAX_TIMED_WRITE_TTL_MS);
    session.timed_write = Some(TimedWrite {
        pid,
        expires_ms: now_ms + ttl_ms,
    });
}

/// Adds the characteristic to the session's subscription set. Idempotent;
/// the user callback fires only on an actual transition.
pub fn subscribe(
    db: Database<'_>,
    session: &mut Session,
    aid: u64,
    iid: u64,
) -> Result<(), AccessError> {
    let (_, _, characteristic) = db.characteristic(aid, iid).ok_or(AccessError::NotFound)?;
    if !characteristic
        .properties
        .contains(Properties::SUPPORTS_EVENTS)
    {
        return Err(AccessError::NotifyUnsupported);
    }
    if session.subscriptions.insert((aid, iid)) {
        if let Some(callback) = characteristic.callbacks.subscribe.as_ref() {
            callback(&SubscriptionContext {
                aid,
                iid,
                transport: session.transport,
            });
        }
    }
    Ok(())
}

/// Removes the characteristic from the session's subscription set.
pub fn unsubscribe(
    db: Database<'_>,
    session: &mut Session,
    aid: u64,
    iid: u64,
) -> Result<(), AccessError> {
    let (_, _, characteristic) = db.characteristic(aid, iid).ok_or(AccessError::NotFound)?;
    if !characteristic
        .properties
        .contains(Properties::SUPPORTS_EVENTS)
    {
        return Err(AccessError::NotifyUnsupported);
    }
    if session.subscriptions.remove(&(aid, iid)) {
        if let Some(callback) = characteristic.callbacks.unsubscribe.as_ref() {
            callback(&SubscriptionContext {
                aid,
                iid,
                transport: session.transport,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::{
        accessory_information_service, pairing_service, protocol_information_service, Accessory,
        Category, Service,
    };
    use crate::accessory::service_types;
    use crate::characteristic::{Callbacks, Characteristic, Format};
    use crate::pairing::ControllerId;
    use crate::session::{SecuredChannel, SessionPool};
    use std::cell::Cell;
    use std::rc::Rc;

    fn secured_session(pool: &mut SessionPool, admin: bool) -> crate::session::SessionHandle {
        let handle = pool.allocate(TransportType::Ip, 0).unwrap();
        let session = pool.get_mut(handle).unwrap();
        session.secured = Some(SecuredChannel::new(
            ControllerId::try_from(&b"ctl"[..]).unwrap(),
            admin,
            [1; 32],
            [2; 32],
        ));
        handle
    }

    struct Fixture {
        accessories: Vec<Accessory>,
        writes: Rc<Cell<u32>>,
        on_state: Rc<Cell<bool>>,
    }

    const LIGHT_ON_IID: u64 = 0x31;
    const SECRET_IID: u64 = 0x32;
    const TIMED_IID: u64 = 0x33;
    const RESPONSE_IID: u64 = 0x34;

    fn fixture() -> Fixture {
        let writes = Rc::new(Cell::new(0));
        let on_state = Rc::new(Cell::new(false));

        let mut service = Service::new(0x30, service_types::LIGHT_BULB, "light-bulb");
        service.primary = true;

        let mut on = Characteristic::new(LIGHT_ON_IID, types::ON, Format::Bool, "on");
        on.properties = Properties::READABLE | Properties::WRITABLE | Properties::SUPPORTS_EVENTS;
        let state = on_state.clone();
        let write_count = writes.clone();
        let state_for_read = on_state.clone();
        on.callbacks = Callbacks {
            read: Some(Box::new(move |_| Ok(HapValue::Bool(state_for_read.get())))),
            write: Some(Box::new(move |_, value| {
                write_count.set(write_count.get() + 1);
                if let HapValue::Bool(v) = value {
                    state.set(*v);
                }
                Ok(())
            })),
            ..Callbacks::default()
        };
        service.characteristics.push(on);

        let mut secret =
            Characteristic::new(SECRET_IID, crate::hapuuid::uuid_from_u16(0x220), Format::UInt8, "secret");
        secret.properties =
            Properties::READABLE | Properties::WRITABLE | Properties::REQUIRES_ADMIN;
        secret.callbacks = Callbacks {
            read: Some(Box::new(|_| Ok(HapValue::UInt8(1)))),
            write: Some(Box::new(|_, _| Ok(()))),
            ..Callbacks::default()
        };
        service.characteristics.push(secret);

        let mut timed =
            Characteristic::new(TIMED_IID, crate::hapuuid::uuid_from_u16(0x221), Format::UInt8, "timed");
        timed.properties =
            Properties::READABLE | Properties::WRITABLE | Properties::REQUIRES_TIMED_WRITE;
        timed.callbacks = Callbacks {
            read: Some(Box::new(|_| Ok(HapValue::UInt8(0)))),
            write: Some(Box::new(|_, _| Ok(()))),
            ..Callbacks::default()
        };
        service.characteristics.push(timed);

        let mut with_response = Characteristic::new(
            RESPONSE_IID,
            crate::hapuuid::uuid_from_u16(0x222),
            Format::UInt8,
            "write-response",
        );
        with_response.properties = Properties::READABLE
            | Properties::WRITABLE
            | Properties::IP_SUPPORTS_WRITE_RESPONSE;
        with_response.callbacks = Callbacks {
            read: Some(Box::new(|_| Ok(HapValue::UInt8(42)))),
            write: Some(Box::new(|_, _| Ok(()))),
            ..Callbacks::default()
        };
        service.characteristics.push(with_response);

        let accessory = Accessory {
            aid: 1,
            category: Category::Lighting,
            name: "Acme Light".into(),
            manufacturer: "Acme".into(),
            model: "L1".into(),
            serial_number: "0001".into(),
            firmware_version: "1".into(),
            hardware_version: None,
            services: vec![
                accessory_information_service(1),
                protocol_information_service(0x10),
                pairing_service(0x20),
                service,
            ],
            identify: None,
        };
        Fixture {
            accessories: vec![accessory],
            writes,
            on_state,
        }
    }

    #[test]
    fn read_and_write_round_trip() {
        let fixture = fixture();
        let db = Database::new(&fixture.accessories);
        let mut pool = SessionPool::new(2);
        let handle = secured_session(&mut pool, false);
        let session = pool.get_mut(handle).unwrap();

        assert_eq!(
            read(db, session, 1, LIGHT_ON_IID, ReadKind::Addressed).unwrap(),
            HapValue::Bool(false)
        );
        write(db, session, 1, LIGHT_ON_IID, &HapValue::Bool(true), None, None, 0).unwrap();
        assert_eq!(fixture.writes.get(), 1);
        assert!(fixture.on_state.get());
        assert_eq!(
            read(db, session, 1, LIGHT_ON_IID, ReadKind::Addressed).unwrap(),
            HapValue::Bool(true)
        );
    }

    #[test]
    fn missing_characteristic_is_not_found() {
        let fixture = fixture();
        let db = Database::new(&fixture.accessories);
        let mut pool = SessionPool::new(1);
        let handle = secured_session(&mut pool, false);
        let session = pool.get_mut(handle).unwrap();
        assert_eq!(
            read(db, session, 1, 0x999, ReadKind::Addressed),
            Err(AccessError::NotFound)
        );
        assert_eq!(
            read(db, session, 9, LIGHT_ON_IID, ReadKind::Addressed),
            Err(AccessError::NotFound)
        );
    }

    #[test]
    fn admin_gate_applies_to_both_directions() {
        let fixture = fixture();
        let db = Database::new(&fixture.accessories);
        let mut pool = SessionPool::new(2);
        let member = secured_session(&mut pool, false);
        let session = pool.get_mut(member).unwrap();
        assert_eq!(
            read(db, session, 1, SECRET_IID, ReadKind::Addressed),
            Err(AccessError::NotAllowed)
        );
        assert_eq!(
            write(db, session, 1, SECRET_IID, &HapValue::UInt8(1), None, None, 0).map(|_| ()),
            Err(AccessError::NotAllowed)
        );

        let admin = secured_session(&mut pool, true);
        let session = pool.get_mut(admin).unwrap();
        assert!(read(db, session, 1, SECRET_IID, ReadKind::Addressed).is_ok());
        assert!(write(db, session, 1, SECRET_IID, &HapValue::UInt8(1), None, None, 0).is_ok());
    }

    #[test]
    fn write_to_read_only_is_rejected_before_callbacks() {
        let fixture = fixture();
        let db = Database::new(&fixture.accessories);
        let mut pool = SessionPool::new(1);
        let handle = secured_session(&mut pool, true);
        let session = pool.get_mut(handle).unwrap();
        // The version characteristic of protocol information is
        // read-only.
        let err = write(db, session, 1, 0x12, &HapValue::String("2".into()), None, None, 0)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, AccessError::NotWritable);
    }

    #[test]
    fn constraint_violation_is_invalid_value() {
        let fixture = fixture();
        let db = Database::new(&fixture.accessories);
        let mut pool = SessionPool::new(1);
        let handle = secured_session(&mut pool, false);
        let session = pool.get_mut(handle).unwrap();
        let err = write(db, session, 1, LIGHT_ON_IID, &HapValue::UInt8(1), None, None, 0)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, AccessError::InvalidValue);
    }

    #[test]
    fn timed_write_window_happy_path_and_expiry() {
        let fixture = fixture();
        let db = Database::new(&fixture.accessories);
        let mut pool = SessionPool::new(1);
        let handle = secured_session(&mut pool, false);
        let session = pool.get_mut(handle).unwrap();

        // Without a prepare the write is rejected.
        let err = write(db, session, 1, TIMED_IID, &HapValue::UInt8(1), None, Some(7), 0)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, AccessError::Core(Error::InvalidState));

        prepare_timed_write(session, 7, 2_000, 0);
        assert!(
            write(db, session, 1, TIMED_IID, &HapValue::UInt8(1), None, Some(7), 1_000).is_ok()
        );
        // The window is one-shot.
        let err = write(db, session, 1, TIMED_IID, &HapValue::UInt8(1), None, Some(7), 1_001)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, AccessError::Core(Error::InvalidState));

        // An expired window is useless.
        prepare_timed_write(session, 9, 100, 10_000);
        let err = write(db, session, 1, TIMED_IID, &HapValue::UInt8(1), None, Some(9), 10_200)
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, AccessError::Core(Error::InvalidState));
    }

    #[test]
    fn ttl_is_clamped() {
        let mut pool = SessionPool::new(1);
        let handle = pool.allocate(TransportType::Ip, 0).unwrap();
        let session = pool.get_mut(handle).unwrap();
        prepare_timed_write(session, 1, 60_000, 0);
        assert_eq!(
            session.timed_write.unwrap().expires_ms,
            MAX_TIMED_WRITE_TTL_MS
        );
    }

    #[test]
    fn write_response_reads_back() {
        let fixture = fixture();
        let db = Database::new(&fixture.accessories);
        let mut pool = SessionPool::new(1);
        let handle = secured_session(&mut pool, false);
        let session = pool.get_mut(handle).unwrap();
        let outcome =
            write(db, session, 1, RESPONSE_IID, &HapValue::UInt8(3), None, None, 0).unwrap();
        assert_eq!(outcome.response_value, Some(HapValue::UInt8(42)));

        let outcome =
            write(db, session, 1, LIGHT_ON_IID, &HapValue::Bool(true), None, None, 0).unwrap();
        assert_eq!(outcome.response_value, None);
    }

    #[test]
    fn subscribe_requires_event_support_and_is_idempotent() {
        let fixture = fixture();
        let db = Database::new(&fixture.accessories);
        let mut pool = SessionPool::new(1);
        let handle = secured_session(&mut pool, false);
        let session = pool.get_mut(handle).unwrap();

        assert_eq!(
            subscribe(db, session, 1, SECRET_IID),
            Err(AccessError::NotifyUnsupported)
        );

        subscribe(db, session, 1, LIGHT_ON_IID).unwrap();
        subscribe(db, session, 1, LIGHT_ON_IID).unwrap();
        assert_eq!(session.subscriptions.len(), 1);
        unsubscribe(db, session, 1, LIGHT_ON_IID).unwrap();
        unsubscribe(db, session, 1, LIGHT_ON_IID).unwrap();
        assert!(session.subscriptions.is_empty());
    }

    #[test]
    fn control_point_reads_are_null_only_during_enumeration() {
        let fixture = fixture();
        let db = Database::new(&fixture.accessories);
        let mut pool = SessionPool::new(1);
        let handle = secured_session(&mut pool, false);
        let session = pool.get_mut(handle).unwrap();
        // The protocol information service signature characteristic is a
        // control point.
        assert_eq!(
            read(db, session, 1, 0x11, ReadKind::Enumeration).unwrap(),
            HapValue::Null
        );
        assert_eq!(
            read(db, session, 1, 0x11, ReadKind::Addressed).unwrap(),
            HapValue::Data(Vec::new())
        );
    }
}
