// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The IP session loop: accepts streams from the TCP stream manager,
//! frames and (once verified) decrypts requests, dispatches the HAP
//! endpoints, and delivers coalesced EVENT frames on the same
//! connections.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::access::{self, AccessError, ReadKind};
use crate::characteristic::{Format, HapValue};
use crate::event;
use crate::ip::http::{self, HttpMethod, HttpRequest};
use crate::ip::serializer::{stage_value, AccessorySerializer};
use crate::pairing::admin::{self, AdminContext, AdminEffect};
use crate::pairing::setup::SetupContext;
use crate::pairing::verify::{PairVerify, VerifyContext};
use crate::pairing::ControllerId;
use crate::platform::{ServiceDiscovery, StreamEvents, TcpStreamHandle, TcpStreamManager};
use crate::server::ServerCore;
use crate::session::{SecuredChannel, SessionHandle, TransportType};
use crate::{Error, Result};

/// HAP status codes carried per element in characteristics responses.
mod status {
    pub const SUCCESS: i32 = 0;
    pub const INSUFFICIENT_PRIVILEGES: i32 = -70401;
    pub const UNABLE: i32 = -70402;
    pub const BUSY: i32 = -70403;
    pub const READ_ONLY: i32 = -70404;
    pub const WRITE_ONLY: i32 = -70405;
    pub const NOTIFICATION_UNSUPPORTED: i32 = -70406;
    pub const OUT_OF_RESOURCES: i32 = -70407;
    pub const NOT_FOUND: i32 = -70409;
    pub const INVALID_VALUE: i32 = -70410;
    pub const INSUFFICIENT_AUTHORIZATION: i32 = -70411;
}

fn status_of(error: AccessError) -> i32 {
    match error {
        AccessError::NotFound => status::NOT_FOUND,
        AccessError::NotReadable => status::WRITE_ONLY,
        AccessError::NotWritable => status::READ_ONLY,
        AccessError::NotifyUnsupported => status::NOTIFICATION_UNSUPPORTED,
        AccessError::NotAllowed => status::INSUFFICIENT_PRIVILEGES,
        AccessError::InsufficientAuthorization => status::INSUFFICIENT_AUTHORIZATION,
        AccessError::InvalidValue => status::INVALID_VALUE,
        AccessError::Core(Error::Busy) => status::BUSY,
        AccessError::Core(Error::OutOfResources) => status::OUT_OF_RESOURCES,
        AccessError::Core(_) => status::UNABLE,
    }
}

struct StreamState {
    session: SessionHandle,
    /// Raw socket bytes not yet deframed.
    inbound: Vec<u8>,
    /// Parsed-but-unconsumed plaintext request bytes.
    plaintext: Vec<u8>,
    /// Framed (and, once secured, encrypted) bytes awaiting the socket.
    outbound: Vec<u8>,
    verify: PairVerify,
    close_after_flush: bool,
}

/// The IP transport: one listener, up to pool-size concurrent streams,
/// mDNS advertisement.
pub struct IpTransport {
    tcp: Box<dyn TcpStreamManager>,
    discovery: Option<Box<dyn ServiceDiscovery>>,
    streams: HashMap<TcpStreamHandle, StreamState>,
}

impl IpTransport {
    pub fn new(
        tcp: Box<dyn TcpStreamManager>,
        discovery: Option<Box<dyn ServiceDiscovery>>,
    ) -> Self {
        IpTransport {
            tcp,
            discovery,
            streams: HashMap::new(),
        }
    }

    /// Opens the listener and registers the mDNS service.
    pub fn start(&mut self, core: &mut ServerCore<'_>) -> Result<()> {
        self.tcp.open_listener()?;
        let port = self.tcp.listener_port();
        let name = core.db.primary().name.clone();
        let txt = txt_records(core);
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.register(&name, "_hap._tcp", port, &txt)?;
        }
        info!("IP transport listening on port {}.", port);
        Ok(())
    }

    pub fn stop(&mut self, core: &mut ServerCore<'_>) {
        for (handle, state) in self.streams.drain() {
            core.sessions.free(state.session);
            self.tcp.close(handle);
        }
        if let Some(discovery) = self.discovery.as_mut() {
            discovery.stop();
        }
        self.tcp.close_listener();
    }

    /// Re-publishes the TXT records; called after pairing mutations.
    pub fn update_advertisement(&mut self, core: &mut ServerCore<'_>) {
        let txt = txt_records(core);
        if let Some(discovery) = self.discovery.as_mut() {
            if discovery.update_txt_records(&txt).is_err() {
                warn!("Failed to update mDNS TXT records.");
            }
        }
    }

    /// Accepts as many pending connections as the session pool admits.
    pub fn on_listener_event(&mut self, core: &mut ServerCore<'_>) {
        loop {
            let stream = match self.tcp.accept() {
                Ok(stream) => stream,
                Err(_) => return,
            };
            let now = core.now_ms();
            let session = match core.sessions.allocate(TransportType::Ip, now) {
                Ok(session) => session,
                Err(_) => {
                    // Recycle the oldest unsecured stream, else refuse.
                    match self.oldest_unsecured_stream(core) {
                        Some(victim) => {
                            debug!("Admission: recycling idle unsecured stream.");
                            self.teardown_stream(core, victim);
                            match core.sessions.allocate(TransportType::Ip, now) {
                                Ok(session) => session,
                                Err(_) => {
                                    self.tcp.close(stream);
                                    continue;
                                }
                            }
                        }
                        None => {
                            warn!("Admission: no session slot for new stream; refusing.");
                            self.tcp.close(stream);
                            continue;
                        }
                    }
                }
            };
            self.streams.insert(
                stream,
                StreamState {
                    session,
                    inbound: Vec::new(),
                    plaintext: Vec::new(),
                    outbound: Vec::new(),
                    verify: PairVerify::new(),
                    close_after_flush: false,
                },
            );
            self.tcp.update_interests(
                stream,
                StreamEvents {
                    has_bytes_available: true,
                    has_space_available: false,
                },
            );
        }
    }

    fn oldest_unsecured_stream(&self, core: &ServerCore<'_>) -> Option<TcpStreamHandle> {
        self.streams
            .iter()
            .filter(|(_, state)| {
                core.sessions
                    .get(state.session)
                    .map(|s| !s.is_secured())
                    .unwrap_or(true)
            })
            .map(|(handle, _)| *handle)
            .min_by_key(|handle| handle.0)
    }

    fn teardown_stream(&mut self, core: &mut ServerCore<'_>, stream: TcpStreamHandle) {
        if let Some(state) = self.streams.remove(&stream) {
            core.pair_setup.owner_disconnected(stream.0);
            core.sessions.free(state.session);
        }
        self.tcp.close(stream);
    }

    /// Invalidates every stream bound to the controller; used after
    /// remove-pairing.
    pub fn invalidate_controller(&mut self, core: &mut ServerCore<'_>, controller: &ControllerId) {
        let victims: Vec<TcpStreamHandle> = self
            .streams
            .iter()
            .filter(|(_, state)| {
                core.sessions
                    .get(state.session)
                    .and_then(|s| s.controller())
                    == Some(controller)
            })
            .map(|(handle, _)| *handle)
            .collect();
        for stream in victims {
            debug!("Invalidating stream {:?} after pairing removal.", stream);
            self.teardown_stream(core, stream);
        }
    }

    /// Invalidates every secured stream; used when the accessory returns
    /// to unpaired state.
    pub fn invalidate_all_secured(&mut self, core: &mut ServerCore<'_>) {
        let victims: Vec<TcpStreamHandle> = self
            .streams
            .iter()
            .filter(|(_, state)| {
                core.sessions
                    .get(state.session)
                    .map(|s| s.is_secured())
                    .unwrap_or(false)
            })
            .map(|(handle, _)| *handle)
            .collect();
        for stream in victims {
            self.teardown_stream(core, stream);
        }
    }

    /// Handles readability (and EOF) on one stream.
    pub fn on_stream_event(&mut self, core: &mut ServerCore<'_>, stream: TcpStreamHandle) {
        let mut buf = [0u8; 1024];
        loop {
            match self.tcp.read(stream, &mut buf) {
                Ok(0) => {
                    debug!("Stream {:?} reached EOF; closing.", stream);
                    self.teardown_stream(core, stream);
                    return;
                }
                Ok(n) => {
                    if let Some(state) = self.streams.get_mut(&stream) {
                        state.inbound.extend_from_slice(&buf[..n]);
                    } else {
                        return;
                    }
                }
                Err(Error::Busy) => break,
                Err(_) => {
                    self.teardown_stream(core, stream);
                    return;
                }
            }
        }
        if self.deframe(core, stream).is_err() {
            // Transport decryption failure is fatal to the session.
            warn!("Stream {:?} failed frame decryption; invalidating.", stream);
            self.teardown_stream(core, stream);
            return;
        }
        self.process_requests(core, stream);
        self.flush(core, stream);
    }

    /// Moves inbound bytes into the plaintext buffer, opening secured
    /// frames when the session has keys.
    fn deframe(&mut self, core: &mut ServerCore<'_>, stream: TcpStreamHandle) -> Result<()> {
        let state = match self.streams.get_mut(&stream) {
            Some(state) => state,
            None => return Ok(()),
        };
        let session = core.sessions.get_mut(state.session).ok_or(Error::Unknown)?;
        match session.secured.as_mut() {
            None => {
                state.plaintext.append(&mut state.inbound);
                Ok(())
            }
            Some(channel) => {
                let mut consumed = 0;
                while let Some((plaintext, n)) = channel.open_frame(&state.inbound[consumed..])? {
                    state.plaintext.extend_from_slice(&plaintext);
                    consumed += n;
                }
                state.inbound.drain(..consumed);
                Ok(())
            }
        }
    }

    fn process_requests(&mut self, core: &mut ServerCore<'_>, stream: TcpStreamHandle) {
        loop {
            let request = {
                let state = match self.streams.get_mut(&stream) {
                    Some(state) => state,
                    None => return,
                };
                match http::parse_request(&state.plaintext) {
                    Ok(Some((request, consumed))) => {
                        state.plaintext.drain(..consumed);
                        request
                    }
                    Ok(None) => return,
                    Err(_) => {
                        warn!("Stream {:?} sent a malformed request; closing.", stream);
                        self.teardown_stream(core, stream);
                        return;
                    }
                }
            };
            if !self.dispatch(core, stream, request) {
                return;
            }
        }
    }

    /// Dispatches one request; returns false when the stream went away.
    fn dispatch(
        &mut self,
        core: &mut ServerCore<'_>,
        stream: TcpStreamHandle,
        request: HttpRequest,
    ) -> bool {
        debug!("{:?} {} on stream {:?}.", request.method, request.path, stream);
        let outcome = match (request.method, request.path.as_str()) {
            (HttpMethod::Post, "/pair-setup") => self.post_pair_setup(core, stream, &request),
            (HttpMethod::Post, "/pair-verify") => self.post_pair_verify(core, stream, &request),
            (HttpMethod::Post, "/pairings") => self.post_pairings(core, stream, &request),
            (HttpMethod::Get, "/accessories") => self.get_accessories(core, stream),
            (HttpMethod::Get, "/characteristics") => {
                self.get_characteristics(core, stream, &request)
            }
            (HttpMethod::Put, "/characteristics") => {
                self.put_characteristics(core, stream, &request)
            }
            (HttpMethod::Put, "/prepare") => self.put_prepare(core, stream, &request),
            (HttpMethod::Post, "/identify") => self.post_identify(core, stream),
            _ => Ok(http::response(404, "Not Found", None, &[])),
        };
        match outcome {
            Ok(response) => {
                self.queue_response(core, stream, &response);
                self.streams.contains_key(&stream)
            }
            Err(_) => {
                self.teardown_stream(core, stream);
                false
            }
        }
    }

    fn queue_response(&mut self, core: &mut ServerCore<'_>, stream: TcpStreamHandle, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let state = match self.streams.get_mut(&stream) {
            Some(state) => state,
            None => return,
        };
        let session = match core.sessions.get_mut(state.session) {
            Some(session) => session,
            None => return,
        };
        match session.secured.as_mut() {
            Some(channel) => state.outbound.extend_from_slice(&channel.seal_frames(bytes)),
            None => state.outbound.extend_from_slice(bytes),
        }
    }

    fn flush(&mut self, core: &mut ServerCore<'_>, stream: TcpStreamHandle) {
        let state = match self.streams.get_mut(&stream) {
            Some(state) => state,
            None => return,
        };
        while !state.outbound.is_empty() {
            match self.tcp.write(stream, &state.outbound) {
                Ok(0) | Err(Error::Busy) => break,
                Ok(n) => {
                    state.outbound.drain(..n);
                }
                Err(_) => {
                    self.teardown_stream(core, stream);
                    return;
                }
            }
        }
        let done = state.outbound.is_empty();
        if done && state.close_after_flush {
            self.teardown_stream(core, stream);
        }
    }

    /// Delivers due coalesced events and expires stale pairing procedures.
    pub fn on_timer_tick(&mut self, core: &mut ServerCore<'_>) {
        let now = core.now_ms();
        core.pair_setup.expire(now);
        let streams: Vec<TcpStreamHandle> = self.streams.keys().copied().collect();
        for stream in streams {
            let (session_handle, secured) = match self.streams.get(&stream) {
                Some(state) => (
                    state.session,
                    core.sessions
                        .get(state.session)
                        .map(|s| s.is_secured())
                        .unwrap_or(false),
                ),
                None => continue,
            };
            if !secured {
                continue;
            }
            let due = match core.sessions.get_mut(session_handle) {
                Some(session) => event::take_due_events(session, now),
                None => None,
            };
            if let Some(events) = due {
                let body = self.characteristics_body(core, session_handle, &events);
                let frame = http::event_message(&body);
                self.queue_response(core, stream, &frame);
                self.flush(core, stream);
            }
        }
    }

    /// Builds `{"characteristics":[{aid,iid,value}...]}` for the ids, in
    /// the same shape a read response uses.
    fn characteristics_body(
        &self,
        core: &ServerCore<'_>,
        session: SessionHandle,
        ids: &std::collections::BTreeSet<(u64, u64)>,
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"{\"characteristics\":[");
        for (i, (aid, iid)) in ids.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(b"{\"aid\":");
            body.extend_from_slice(aid.to_string().as_bytes());
            body.extend_from_slice(b",\"iid\":");
            body.extend_from_slice(iid.to_string().as_bytes());
            body.extend_from_slice(b",\"value\":");
            let value = core
                .sessions
                .get(session)
                .ok_or(AccessError::Core(Error::Unknown))
                .and_then(|s| access::read(core.db, s, *aid, *iid, ReadKind::Addressed));
            let format = core
                .db
                .characteristic(*aid, *iid)
                .map(|(_, _, c)| c.format)
                .unwrap_or(Format::Bool);
            stage_value(&mut body, format, value.ok());
            body.push(b'}');
        }
        body.extend_from_slice(b"]}");
        body
    }

    fn post_pair_setup(
        &mut self,
        core: &mut ServerCore<'_>,
        stream: TcpStreamHandle,
        request: &HttpRequest,
    ) -> Result<Vec<u8>> {
        let now = core.now_ms();
        let mut ctx = SetupContext {
            kv: core.kv.as_mut(),
            rng: core.rng.as_mut(),
            identity: &core.identity,
            store: &core.store,
            setup: &core.setup,
        };
        let response = core.pair_setup.handle(&mut ctx, stream.0, &request.body, now)?;
        if response.completed {
            core.bump_gsn();
            self.update_advertisement(core);
        }
        Ok(http::response(
            200,
            "OK",
            Some(http::CONTENT_TYPE_TLV8),
            &response.body,
        ))
    }

    fn post_pair_verify(
        &mut self,
        core: &mut ServerCore<'_>,
        stream: TcpStreamHandle,
        request: &HttpRequest,
    ) -> Result<Vec<u8>> {
        let now = core.now_ms();
        let state = self.streams.get_mut(&stream).ok_or(Error::Unknown)?;
        let session_handle = state.session;
        if core
            .sessions
            .get(session_handle)
            .map(|s| s.is_secured())
            .unwrap_or(false)
        {
            // A verified session must not run Pair-Verify again.
            return Err(Error::InvalidState);
        }
        let mut ctx = VerifyContext {
            kv: core.kv.as_ref(),
            rng: core.rng.as_mut(),
            identity: &core.identity,
            store: &core.store,
            resume: &mut core.resume,
            now_ms: now,
        };
        let response = state.verify.handle(&mut ctx, &request.body)?;
        let http_response = http::response(
            200,
            "OK",
            Some(http::CONTENT_TYPE_TLV8),
            &response.body,
        );
        if let Some(keys) = response.installed {
            // The response itself goes out unencrypted; everything after
            // it is framed with the new keys.
            let session = core
                .sessions
                .get_mut(session_handle)
                .ok_or(Error::Unknown)?;
            info!("Session secured for controller {:?}.", keys.controller);
            session.secured = Some(SecuredChannel::new(
                keys.controller,
                keys.controller_is_admin,
                keys.encrypt_key,
                keys.decrypt_key,
            ));
            // Queue plaintext now, before the channel exists for sealing.
            let state = self.streams.get_mut(&stream).ok_or(Error::Unknown)?;
            state.outbound.extend_from_slice(&http_response);
            return Ok(Vec::new());
        }
        Ok(http_response)
    }

    fn post_pairings(
        &mut self,
        core: &mut ServerCore<'_>,
        stream: TcpStreamHandle,
        request: &HttpRequest,
    ) -> Result<Vec<u8>> {
        let state = self.streams.get(&stream).ok_or(Error::Unknown)?;
        let session_handle = state.session;
        let session = core.sessions.get(session_handle).ok_or(Error::Unknown)?;
        if !session.is_secured() {
            return Ok(connection_authorization_required());
        }
        let is_admin = session.is_admin();
        let own_controller = session.controller().copied();

        let mut ctx = AdminContext {
            kv: core.kv.as_mut(),
            store: &core.store,
        };
        let response = admin::handle(&mut ctx, is_admin, &request.body)?;
        let http_response = http::response(
            200,
            "OK",
            Some(http::CONTENT_TYPE_TLV8),
            &response.body,
        );

        match response.effect {
            AdminEffect::None => Ok(http_response),
            AdminEffect::Mutated => {
                core.bump_gsn();
                self.update_advertisement(core);
                Ok(http_response)
            }
            AdminEffect::RemovedController(controller) => {
                core.bump_gsn();
                core.resume.purge_controller(&controller);
                self.update_advertisement(core);
                if own_controller.as_ref() == Some(&controller) {
                    // Finish the response, then drop the session.
                    self.queue_response(core, stream, &http_response);
                    if let Some(state) = self.streams.get_mut(&stream) {
                        state.close_after_flush = true;
                    }
                    self.invalidate_other_streams_of(core, &controller, stream);
                    return Ok(Vec::new());
                }
                self.invalidate_controller(core, &controller);
                Ok(http_response)
            }
            AdminEffect::Unpaired => {
                core.bump_gsn();
                core.resume.clear();
                self.update_advertisement(core);
                // Every secured session dies, this one after its response.
                self.queue_response(core, stream, &http_response);
                if let Some(state) = self.streams.get_mut(&stream) {
                    state.close_after_flush = true;
                }
                let survivors: Vec<TcpStreamHandle> = self
                    .streams
                    .keys()
                    .copied()
                    .filter(|h| *h != stream)
                    .collect();
                for victim in survivors {
                    let secured = self
                        .streams
                        .get(&victim)
                        .and_then(|s| core.sessions.get(s.session))
                        .map(|s| s.is_secured())
                        .unwrap_or(false);
                    if secured {
                        self.teardown_stream(core, victim);
                    }
                }
                info!("Accessory is unpaired; pair-setup re-enabled.");
                Ok(Vec::new())
            }
        }
    }

    fn invalidate_other_streams_of(
        &mut self,
        core: &mut ServerCore<'_>,
        controller: &ControllerId,
        keep: TcpStreamHandle,
    ) {
        let victims: Vec<TcpStreamHandle> = self
            .streams
            .iter()
            .filter(|(handle, state)| {
                **handle != keep
                    && core
                        .sessions
                        .get(state.session)
                        .and_then(|s| s.controller())
                        == Some(controller)
            })
            .map(|(handle, _)| *handle)
            .collect();
        for victim in victims {
            self.teardown_stream(core, victim);
        }
    }

    fn get_accessories(
        &mut self,
        core: &mut ServerCore<'_>,
        stream: TcpStreamHandle,
    ) -> Result<Vec<u8>> {
        let state = self.streams.get(&stream).ok_or(Error::Unknown)?;
        let session = core.sessions.get(state.session).ok_or(Error::Unknown)?;
        if !session.is_secured() {
            return Ok(connection_authorization_required());
        }
        let body = AccessorySerializer::serialize_all(core.db, session);
        Ok(http::response(
            200,
            "OK",
            Some(http::CONTENT_TYPE_JSON),
            &body,
        ))
    }

    fn get_characteristics(
        &mut self,
        core: &mut ServerCore<'_>,
        stream: TcpStreamHandle,
        request: &HttpRequest,
    ) -> Result<Vec<u8>> {
        let state = self.streams.get(&stream).ok_or(Error::Unknown)?;
        let session_handle = state.session;
        let session = core.sessions.get(session_handle).ok_or(Error::Unknown)?;
        if !session.is_secured() {
            return Ok(connection_authorization_required());
        }

        let ids = match request
            .query
            .as_deref()
            .and_then(|q| parse_id_query(q))
        {
            Some(ids) if !ids.is_empty() => ids,
            _ => {
                return Ok(http::response(
                    400,
                    "Bad Request",
                    Some(http::CONTENT_TYPE_JSON),
                    b"{\"status\":-70410}",
                ))
            }
        };

        let mut elements: Vec<(u64, u64, std::result::Result<HapValue, AccessError>)> = Vec::new();
        for (aid, iid) in ids {
            let value = access::read(core.db, session, aid, iid, ReadKind::Addressed);
            elements.push((aid, iid, value));
        }
        let any_error = elements.iter().any(|(_, _, v)| v.is_err());

        let mut body = Vec::new();
        body.extend_from_slice(b"{\"characteristics\":[");
        for (i, (aid, iid, value)) in elements.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(b"{\"aid\":");
            body.extend_from_slice(aid.to_string().as_bytes());
            body.extend_from_slice(b",\"iid\":");
            body.extend_from_slice(iid.to_string().as_bytes());
            match value {
                Ok(v) => {
                    body.extend_from_slice(b",\"value\":");
                    let format = core
                        .db
                        .characteristic(*aid, *iid)
                        .map(|(_, _, c)| c.format)
                        .unwrap_or(Format::Bool);
                    stage_value(&mut body, format, Some(v.clone()));
                    if any_error {
                        body.extend_from_slice(b",\"status\":0");
                    }
                }
                Err(e) => {
                    body.extend_from_slice(b",\"status\":");
                    body.extend_from_slice(status_of(*e).to_string().as_bytes());
                }
            }
            body.push(b'}');
        }
        body.extend_from_slice(b"]}");

        if any_error {
            Ok(http::response(
                207,
                "Multi-Status",
                Some(http::CONTENT_TYPE_JSON),
                &body,
            ))
        } else {
            Ok(http::response(
                200,
                "OK",
                Some(http::CONTENT_TYPE_JSON),
                &body,
            ))
        }
    }

    fn put_characteristics(
        &mut self,
        core: &mut ServerCore<'_>,
        stream: TcpStreamHandle,
        request: &HttpRequest,
    ) -> Result<Vec<u8>> {
        let state = self.streams.get(&stream).ok_or(Error::Unknown)?;
        let session_handle = state.session;
        if !core
            .sessions
            .get(session_handle)
            .map(|s| s.is_secured())
            .unwrap_or(false)
        {
            return Ok(connection_authorization_required());
        }

        let parsed: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Ok(http::response(
                    400,
                    "Bad Request",
                    Some(http::CONTENT_TYPE_JSON),
                    b"{\"status\":-70410}",
                ))
            }
        };
        let pid = parsed["pid"].as_u64();
        let elements = match parsed["characteristics"].as_array() {
            Some(elements) => elements.clone(),
            None => {
                return Ok(http::response(
                    400,
                    "Bad Request",
                    Some(http::CONTENT_TYPE_JSON),
                    b"{\"status\":-70410}",
                ))
            }
        };

        let now = core.now_ms();
        // (aid, iid, status, write-response value)
        let mut results: Vec<(u64, u64, i32, Option<(Format, HapValue)>)> = Vec::new();
        for element in &elements {
            let (aid, iid) = match (element["aid"].as_u64(), element["iid"].as_u64()) {
                (Some(aid), Some(iid)) => (aid, iid),
                _ => {
                    results.push((0, 0, status::INVALID_VALUE, None));
                    continue;
                }
            };
            let result = self.apply_write_element(core, session_handle, aid, iid, element, pid, now);
            results.push(match result {
                Ok(response_value) => (aid, iid, status::SUCCESS, response_value),
                Err(e) => (aid, iid, status_of(e), None),
            });
        }

        let all_ok = results.iter().all(|(_, _, s, v)| *s == 0 && v.is_none());
        if all_ok {
            return Ok(http::response_no_content());
        }

        let mut body = Vec::new();
        body.extend_from_slice(b"{\"characteristics\":[");
        for (i, (aid, iid, element_status, response_value)) in results.iter().enumerate() {
            if i > 0 {
                body.push(b',');
            }
            body.extend_from_slice(b"{\"aid\":");
            body.extend_from_slice(aid.to_string().as_bytes());
            body.extend_from_slice(b",\"iid\":");
            body.extend_from_slice(iid.to_string().as_bytes());
            body.extend_from_slice(b",\"status\":");
            body.extend_from_slice(element_status.to_string().as_bytes());
            if let Some((format, value)) = response_value {
                body.extend_from_slice(b",\"value\":");
                stage_value(&mut body, *format, Some(value.clone()));
            }
            body.push(b'}');
        }
        body.extend_from_slice(b"]}");
        Ok(http::response(
            207,
            "Multi-Status",
            Some(http::CONTENT_TYPE_JSON),
            &body,
        ))
    }

    /// Applies one element of a write batch: a value write, a
    /// subscription change, or both.
    fn apply_write_element(
        &mut self,
        core: &mut ServerCore<'_>,
        session_handle: SessionHandle,
        aid: u64,
        iid: u64,
        element: &serde_json::Value,
        pid: Option<u64>,
        now: u64,
    ) -> std::result::Result<Option<(Format, HapValue)>, AccessError> {
        let mut response_value = None;

        if !element["value"].is_null() {
            let format = core
                .db
                .characteristic(aid, iid)
                .map(|(_, _, c)| c.format)
                .ok_or(AccessError::NotFound)?;
            let value =
                json_to_value(&element["value"], format).ok_or(AccessError::InvalidValue)?;
            let auth_data = match element["authData"].as_str() {
                Some(encoded) => {
                    use base64::Engine;
                    Some(
                        base64::engine::general_purpose::STANDARD
                            .decode(encoded)
                            .map_err(|_| AccessError::InvalidValue)?,
                    )
                }
                None => None,
            };
            let session = core
                .sessions
                .get_mut(session_handle)
                .ok_or(AccessError::Core(Error::Unknown))?;
            let outcome = access::write(
                core.db,
                session,
                aid,
                iid,
                &value,
                auth_data.as_deref(),
                pid,
                now,
            )?;
            if let Some(read_back) = outcome.response_value {
                response_value = Some((format, read_back));
            }
        }

        if let Some(ev) = element["ev"].as_bool() {
            let session = core
                .sessions
                .get_mut(session_handle)
                .ok_or(AccessError::Core(Error::Unknown))?;
            if ev {
                access::subscribe(core.db, session, aid, iid)?;
            } else {
                access::unsubscribe(core.db, session, aid, iid)?;
            }
        }

        Ok(response_value)
    }

    fn put_prepare(
        &mut self,
        core: &mut ServerCore<'_>,
        stream: TcpStreamHandle,
        request: &HttpRequest,
    ) -> Result<Vec<u8>> {
        let state = self.streams.get(&stream).ok_or(Error::Unknown)?;
        let session_handle = state.session;
        if !core
            .sessions
            .get(session_handle)
            .map(|s| s.is_secured())
            .unwrap_or(false)
        {
            return Ok(connection_authorization_required());
        }
        let parsed: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Ok(http::response(
                    400,
                    "Bad Request",
                    Some(http::CONTENT_TYPE_JSON),
                    b"{\"status\":-70410}",
                ))
            }
        };
        match (parsed["ttl"].as_u64(), parsed["pid"].as_u64()) {
            (Some(ttl), Some(pid)) => {
                let now = core.now_ms();
                let session = core
                    .sessions
                    .get_mut(session_handle)
                    .ok_or(Error::Unknown)?;
                access::prepare_timed_write(session, pid, ttl, now);
                Ok(http::response(
                    200,
                    "OK",
                    Some(http::CONTENT_TYPE_JSON),
                    b"{\"status\":0}",
                ))
            }
            _ => Ok(http::response(
                200,
                "OK",
                Some(http::CONTENT_TYPE_JSON),
                b"{\"status\":-70410}",
            )),
        }
    }

    fn post_identify(
        &mut self,
        core: &mut ServerCore<'_>,
        _stream: TcpStreamHandle,
    ) -> Result<Vec<u8>> {
        if core.is_paired() {
            // Identify over the bare endpoint is for unpaired setup only.
            return Ok(http::response(
                400,
                "Bad Request",
                Some(http::CONTENT_TYPE_JSON),
                b"{\"status\":-70401}",
            ));
        }
        let primary = core.db.primary();
        match &primary.identify {
            Some(identify) => match identify() {
                Ok(()) => Ok(http::response_no_content()),
                Err(_) => Ok(http::response(
                    500,
                    "Internal Server Error",
                    Some(http::CONTENT_TYPE_JSON),
                    b"{\"status\":-70402}",
                )),
            },
            None => Ok(http::response_no_content()),
        }
    }
}

fn connection_authorization_required() -> Vec<u8> {
    http::response(
        470,
        "Connection Authorization Required",
        Some(http::CONTENT_TYPE_JSON),
        b"{\"status\":-70401}",
    )
}

/// Parses `id=1.2,3.4` into `(aid, iid)` pairs.
fn parse_id_query(query: &str) -> Option<Vec<(u64, u64)>> {
    let ids = query
        .split('&')
        .find_map(|kv| kv.strip_prefix("id="))?;
    let mut out = Vec::new();
    for pair in ids.split(',') {
        let (aid, iid) = pair.split_once('.')?;
        out.push((aid.parse().ok()?, iid.parse().ok()?));
    }
    Some(out)
}

/// Converts a JSON write value into a typed value, honoring the
/// characteristic's declared format.
fn json_to_value(value: &serde_json::Value, format: Format) -> Option<HapValue> {
    use base64::Engine;
    match format {
        Format::Bool => match value {
            serde_json::Value::Bool(b) => Some(HapValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(0) => Some(HapValue::Bool(false)),
                Some(1) => Some(HapValue::Bool(true)),
                _ => None,
            },
            _ => None,
        },
        Format::UInt8 => value.as_u64().and_then(|v| u8::try_from(v).ok()).map(HapValue::UInt8),
        Format::UInt16 => value
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .map(HapValue::UInt16),
        Format::UInt32 => value
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(HapValue::UInt32),
        Format::UInt64 => value.as_u64().map(HapValue::UInt64),
        Format::Int32 => value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(HapValue::Int32),
        Format::Float32 => value.as_f64().map(|v| HapValue::Float32(v as f32)),
        Format::String => value.as_str().map(|s| HapValue::String(s.to_string())),
        Format::Data => value
            .as_str()
            .and_then(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
            .map(HapValue::Data),
        Format::Tlv8 => value
            .as_str()
            .and_then(|s| base64::engine::general_purpose::STANDARD.decode(s).ok())
            .map(HapValue::Tlv8),
    }
}

/// The `_hap._tcp` TXT record set.
pub fn txt_records(core: &ServerCore<'_>) -> Vec<(&'static str, String)> {
    let primary = core.db.primary();
    let mut sf = 0u8;
    if !core.is_paired() {
        sf |= 1;
    }
    let mut records: Vec<(&'static str, String)> = vec![
        ("c#", core.config_number().to_string()),
        ("ff", "0".to_string()),
        ("id", core.identity.id_string()),
        ("md", primary.model.clone()),
        ("pv", "1.1".to_string()),
        ("s#", "1".to_string()),
        ("sf", sf.to_string()),
        ("ci", (primary.category as u16).to_string()),
    ];
    if let Some(hash) = core.setup_hash() {
        use base64::Engine;
        records.push(("sh", base64::engine::general_purpose::STANDARD.encode(hash)));
    }
    records
}
