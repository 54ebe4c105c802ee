// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Event notifications: raises mark subscribed sessions dirty, and each
//! transport drains its sessions on its own schedule — the IP loop as
//! coalesced EVENT frames, the BLE link as GATT indications or
//! notification advertisements.

use std::collections::BTreeSet;

use log::trace;

use crate::session::{Session, SessionHandle, SessionPool};

/// A session receives at most one event frame per interval; raises inside
/// the window coalesce into the next frame.
pub const COALESCE_INTERVAL_MS: u64 = 100;

/// Marks the characteristic dirty on every session subscribed to it.
/// Returns the sessions touched.
pub fn raise(pool: &mut SessionPool, aid: u64, iid: u64) -> Vec<SessionHandle> {
    let mut touched = Vec::new();
    for handle in pool.handles() {
        if let Some(session) = pool.get_mut(handle) {
            if session.subscriptions.contains(&(aid, iid)) {
                session.pending_events.insert((aid, iid));
                touched.push(handle);
            }
        }
    }
    trace!(
        "Raised event for {}.{} on {} session(s).",
        aid,
        iid,
        touched.len()
    );
    touched
}

/// Marks the characteristic dirty on one specific session, regardless of
/// other subscribers.
pub fn raise_on_session(pool: &mut SessionPool, handle: SessionHandle, aid: u64, iid: u64) -> bool {
    match pool.get_mut(handle) {
        Some(session) if session.subscriptions.contains(&(aid, iid)) => {
            session.pending_events.insert((aid, iid));
            true
        }
        _ => false,
    }
}

/// Takes the session's pending events if its coalescing window has
/// elapsed. The caller delivers them in one frame.
pub fn take_due_events(session: &mut Session, now_ms: u64) -> Option<BTreeSet<(u64, u64)>> {
    if session.pending_events.is_empty() {
        return None;
    }
    if now_ms.saturating_sub(session.last_event_flush_ms) < COALESCE_INTERVAL_MS {
        return None;
    }
    session.last_event_flush_ms = now_ms;
    Some(std::mem::take(&mut session.pending_events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TransportType;

    fn pool_with_subscribers() -> (SessionPool, SessionHandle, SessionHandle) {
        let mut pool = SessionPool::new(3);
        let a = pool.allocate(TransportType::Ip, 0).unwrap();
        let b = pool.allocate(TransportType::Ip, 0).unwrap();
        pool.get_mut(a).unwrap().subscriptions.insert((1, 0x33));
        pool.get_mut(b).unwrap().subscriptions.insert((1, 0x33));
        pool.get_mut(b).unwrap().subscriptions.insert((1, 0x44));
        (pool, a, b)
    }

    #[test]
    fn raise_reaches_all_subscribers() {
        let (mut pool, a, b) = pool_with_subscribers();
        let touched = raise(&mut pool, 1, 0x33);
        assert_eq!(touched, vec![a, b]);
        assert!(pool.get(a).unwrap().pending_events.contains(&(1, 0x33)));
        assert!(pool.get(b).unwrap().pending_events.contains(&(1, 0x33)));
    }

    #[test]
    fn raise_skips_non_subscribers() {
        let (mut pool, a, b) = pool_with_subscribers();
        let touched = raise(&mut pool, 1, 0x44);
        assert_eq!(touched, vec![b]);
        assert!(pool.get(a).unwrap().pending_events.is_empty());
    }

    #[test]
    fn targeted_raise_hits_one_session() {
        let (mut pool, a, b) = pool_with_subscribers();
        assert!(raise_on_session(&mut pool, a, 1, 0x33));
        assert!(pool.get(b).unwrap().pending_events.is_empty());
        // A session without the subscription is not raised.
        assert!(!raise_on_session(&mut pool, a, 1, 0x44));
    }

    #[test]
    fn events_coalesce_within_the_window() {
        let (mut pool, a, _) = pool_with_subscribers();
        raise(&mut pool, 1, 0x33);
        let session = pool.get_mut(a).unwrap();
        session.last_event_flush_ms = 1_000;

        // Too soon after the previous flush.
        assert!(take_due_events(session, 1_050).is_none());

        // A second raise while waiting lands in the same frame.
        session.pending_events.insert((1, 0x44));
        let due = take_due_events(session, 1_100).unwrap();
        assert_eq!(due.len(), 2);
        assert!(session.pending_events.is_empty());
        assert_eq!(session.last_event_flush_ms, 1_100);

        // Nothing pending, nothing due.
        assert!(take_due_events(session, 2_000).is_none());
    }
}
