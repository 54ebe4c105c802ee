// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Pairing administration: add, remove, and list pairings. Every
//! operation requires an admin session. Session invalidation is returned
//! as an effect so the transport can finish the response first.

use log::{debug, info, warn};

use crate::pairing::{
    tlv_types, ControllerId, Method, Pairing, PairingError, PairingStore,
};
use crate::platform::KeyValueStore;
use crate::tlv8::{self, Reader, Tlv, TlvSlot};
use crate::{Error, Result};

pub struct AdminContext<'a> {
    pub kv: &'a mut dyn KeyValueStore,
    pub store: &'a PairingStore,
}

/// What the caller must do after sending the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminEffect {
    None,
    /// A pairing changed; advertise the new state.
    Mutated,
    /// Invalidate every session of this controller once the response is
    /// out.
    RemovedController(ControllerId),
    /// The last admin went away: all pairings are purged, all secured
    /// sessions die, and the accessory advertises as unpaired.
    Unpaired,
}

pub struct AdminResponse {
    pub body: Vec<u8>,
    pub effect: AdminEffect,
}

/// Handles one pairings TLV from an already-verified session.
pub fn handle(
    ctx: &mut AdminContext<'_>,
    requester_is_admin: bool,
    body: &[u8],
) -> Result<AdminResponse> {
    let mut slots = [
        TlvSlot::new(tlv_types::STATE),
        TlvSlot::new(tlv_types::METHOD),
        TlvSlot::new(tlv_types::IDENTIFIER),
        TlvSlot::new(tlv_types::PUBLIC_KEY),
        TlvSlot::new(tlv_types::PERMISSIONS),
    ];
    Reader::new(body).extract(&mut slots)?;
    let [state, method, identifier, public_key, permissions] = slots;

    if state.value.as_deref() != Some(&[0x01]) {
        return Err(Error::InvalidData);
    }
    let method = match method.value.as_deref() {
        Some([m]) => Method::try_from(*m)?,
        _ => return Err(Error::InvalidData),
    };

    if !requester_is_admin {
        warn!("Pairings operation {:?} from non-admin controller.", method);
        return Ok(error_response(PairingError::Authentication));
    }

    match method {
        Method::AddPairing => add_pairing(
            ctx,
            identifier.value.as_deref(),
            public_key.value.as_deref(),
            permissions.value.as_deref(),
        ),
        Method::RemovePairing => remove_pairing(ctx, identifier.value.as_deref()),
        Method::ListPairings => list_pairings(ctx),
        _ => Err(Error::InvalidData),
    }
}

fn add_pairing(
    ctx: &mut AdminContext<'_>,
    identifier: Option<&[u8]>,
    public_key: Option<&[u8]>,
    permissions: Option<&[u8]>,
) -> Result<AdminResponse> {
    let (identifier, public_key, permissions) = match (identifier, public_key, permissions) {
        (Some(i), Some(k), Some([p])) if k.len() == 32 => (i, k, *p),
        _ => return Err(Error::InvalidData),
    };
    let id = ControllerId::try_from(identifier)?;
    let public_key: [u8; 32] = public_key.try_into().map_err(|_| Error::InvalidData)?;
    let new = Pairing {
        id,
        public_key,
        permissions,
    };

    if let Some((_, existing)) = ctx.store.find(ctx.kv, &id)? {
        if existing.public_key != public_key && existing.is_admin() != new.is_admin() {
            warn!("Add-pairing with conflicting key and permissions for {:?}.", id);
            return Ok(error_response(PairingError::Unknown));
        }
        ctx.store.insert(ctx.kv, &new)?;
        debug!("Add-pairing updated {:?}.", id);
        return Ok(AdminResponse {
            body: success_body(),
            effect: AdminEffect::Mutated,
        });
    }

    match ctx.store.insert(ctx.kv, &new) {
        Ok(_) => {
            info!("Added pairing {:?} (admin: {}).", id, new.is_admin());
            Ok(AdminResponse {
                body: success_body(),
                effect: AdminEffect::Mutated,
            })
        }
        Err(Error::OutOfResources) => Ok(error_response(PairingError::MaxPeers)),
        Err(e) => Err(e),
    }
}

fn remove_pairing(
    ctx: &mut AdminContext<'_>,
    identifier: Option<&[u8]>,
) -> Result<AdminResponse> {
    let identifier = identifier.ok_or(Error::InvalidData)?;
    let id = ControllerId::try_from(identifier)?;

    // Removing an unknown pairing succeeds; the outcome is the same.
    let removed = ctx.store.remove(ctx.kv, &id)?;
    if !removed {
        return Ok(AdminResponse {
            body: success_body(),
            effect: AdminEffect::None,
        });
    }

    if !ctx.store.has_admin(ctx.kv)? {
        info!("Removed the last admin pairing; purging all pairings.");
        ctx.store.purge(ctx.kv)?;
        return Ok(AdminResponse {
            body: success_body(),
            effect: AdminEffect::Unpaired,
        });
    }
    info!("Removed pairing {:?}.", id);
    Ok(AdminResponse {
        body: success_body(),
        effect: AdminEffect::RemovedController(id),
    })
}

fn list_pairings(ctx: &mut AdminContext<'_>) -> Result<AdminResponse> {
    let pairings = ctx.store.list(ctx.kv)?;
    let mut items = vec![Tlv::new(tlv_types::STATE, vec![0x02])];
    for (i, pairing) in pairings.iter().enumerate() {
        if i > 0 {
            items.push(Tlv::new(tlv_types::SEPARATOR, vec![]));
        }
        items.push(Tlv::new(
            tlv_types::IDENTIFIER,
            pairing.id.as_bytes().to_vec(),
        ));
        items.push(Tlv::new(tlv_types::PUBLIC_KEY, pairing.public_key.to_vec()));
        items.push(Tlv::new(tlv_types::PERMISSIONS, vec![pairing.permissions]));
    }
    Ok(AdminResponse {
        body: tlv8::encode(&items),
        effect: AdminEffect::None,
    })
}

fn success_body() -> Vec<u8> {
    tlv8::encode(&[Tlv::new(tlv_types::STATE, vec![0x02])])
}

fn error_response(error: PairingError) -> AdminResponse {
    AdminResponse {
        body: tlv8::encode(&[
            Tlv::new(tlv_types::STATE, vec![0x02]),
            Tlv::new(tlv_types::ERROR, vec![error as u8]),
        ]),
        effect: AdminEffect::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PERMISSION_ADMIN;
    use crate::platform::mock::MockKeyValueStore;
    use crate::tlv8::encode;

    fn request(method: Method, extra: &[Tlv]) -> Vec<u8> {
        let mut items = vec![
            Tlv::new(tlv_types::STATE, vec![0x01]),
            Tlv::new(tlv_types::METHOD, vec![method as u8]),
        ];
        items.extend_from_slice(extra);
        encode(&items)
    }

    fn seeded() -> (MockKeyValueStore, PairingStore) {
        let mut kv = MockKeyValueStore::new();
        let store = PairingStore::new(4);
        store
            .insert(
                &mut kv,
                &Pairing {
                    id: ControllerId::try_from(&b"admin-1"[..]).unwrap(),
                    public_key: [1; 32],
                    permissions: PERMISSION_ADMIN,
                },
            )
            .unwrap();
        (kv, store)
    }

    fn run(
        kv: &mut MockKeyValueStore,
        store: &PairingStore,
        admin: bool,
        body: &[u8],
    ) -> AdminResponse {
        let mut ctx = AdminContext { kv, store };
        handle(&mut ctx, admin, body).unwrap()
    }

    fn error_of(response: &AdminResponse) -> Option<u8> {
        let mut slots = [TlvSlot::new(tlv_types::ERROR)];
        Reader::new(&response.body).extract(&mut slots).unwrap();
        slots[0].value.as_ref().map(|v| v[0])
    }

    #[test]
    fn non_admin_is_rejected() {
        let (mut kv, store) = seeded();
        let body = request(Method::ListPairings, &[]);
        let response = run(&mut kv, &store, false, &body);
        assert_eq!(error_of(&response), Some(PairingError::Authentication as u8));
    }

    #[test]
    fn add_then_list() {
        let (mut kv, store) = seeded();
        let body = request(
            Method::AddPairing,
            &[
                Tlv::new(tlv_types::IDENTIFIER, b"guest".to_vec()),
                Tlv::new(tlv_types::PUBLIC_KEY, vec![7; 32]),
                Tlv::new(tlv_types::PERMISSIONS, vec![0]),
            ],
        );
        let response = run(&mut kv, &store, true, &body);
        assert_eq!(error_of(&response), None);
        assert_eq!(response.effect, AdminEffect::Mutated);

        let list = run(&mut kv, &store, true, &request(Method::ListPairings, &[]));
        let mut reader = Reader::new(&list.body);
        let mut identifiers = Vec::new();
        while let Some(tlv) = reader.next().unwrap() {
            if tlv.tlv_type == tlv_types::IDENTIFIER {
                identifiers.push(tlv.value);
            }
        }
        assert_eq!(identifiers, vec![b"admin-1".to_vec(), b"guest".to_vec()]);
    }

    #[test]
    fn add_conflicting_key_with_different_permissions_fails() {
        let (mut kv, store) = seeded();
        let body = request(
            Method::AddPairing,
            &[
                Tlv::new(tlv_types::IDENTIFIER, b"admin-1".to_vec()),
                Tlv::new(tlv_types::PUBLIC_KEY, vec![0xff; 32]),
                Tlv::new(tlv_types::PERMISSIONS, vec![0]),
            ],
        );
        let response = run(&mut kv, &store, true, &body);
        assert_eq!(error_of(&response), Some(PairingError::Unknown as u8));
        // The stored record is untouched.
        let (_, pairing) = store
            .find(&kv, &ControllerId::try_from(&b"admin-1"[..]).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(pairing.public_key, [1; 32]);
    }

    #[test]
    fn capacity_maps_to_max_peers() {
        let (mut kv, store) = seeded();
        for tag in [&b"b"[..], &b"c"[..], &b"d"[..]] {
            let body = request(
                Method::AddPairing,
                &[
                    Tlv::new(tlv_types::IDENTIFIER, tag.to_vec()),
                    Tlv::new(tlv_types::PUBLIC_KEY, vec![2; 32]),
                    Tlv::new(tlv_types::PERMISSIONS, vec![0]),
                ],
            );
            let response = run(&mut kv, &store, true, &body);
            assert_eq!(error_of(&response), None);
        }
        let body = request(
            Method::AddPairing,
            &[
                Tlv::new(tlv_types::IDENTIFIER, b"overflow".to_vec()),
                Tlv::new(tlv_types::PUBLIC_KEY, vec![2; 32]),
                Tlv::new(tlv_types::PERMISSIONS, vec![0]),
            ],
        );
        let response = run(&mut kv, &store, true, &body);
        assert_eq!(error_of(&response), Some(PairingError::MaxPeers as u8));
    }

    #[test]
    fn remove_peer_keeps_admin() {
        let (mut kv, store) = seeded();
        let add = request(
            Method::AddPairing,
            &[
                Tlv::new(tlv_types::IDENTIFIER, b"guest".to_vec()),
                Tlv::new(tlv_types::PUBLIC_KEY, vec![7; 32]),
                Tlv::new(tlv_types::PERMISSIONS, vec![0]),
            ],
        );
        run(&mut kv, &store, true, &add);

        let remove = request(
            Method::RemovePairing,
            &[Tlv::new(tlv_types::IDENTIFIER, b"guest".to_vec())],
        );
        let response = run(&mut kv, &store, true, &remove);
        assert_eq!(
            response.effect,
            AdminEffect::RemovedController(ControllerId::try_from(&b"guest"[..]).unwrap())
        );
        assert_eq!(store.count(&kv).unwrap(), 1);
    }

    #[test]
    fn removing_last_admin_unpairs() {
        let (mut kv, store) = seeded();
        let add = request(
            Method::AddPairing,
            &[
                Tlv::new(tlv_types::IDENTIFIER, b"guest".to_vec()),
                Tlv::new(tlv_types::PUBLIC_KEY, vec![7; 32]),
                Tlv::new(tlv_types::PERMISSIONS, vec![0]),
            ],
        );
        run(&mut kv, &store, true, &add);

        let remove = request(
            Method::RemovePairing,
            &[Tlv::new(tlv_types::IDENTIFIER, b"admin-1".to_vec())],
        );
        let response = run(&mut kv, &store, true, &remove);
        assert_eq!(response.effect, AdminEffect::Unpaired);
        // Every pairing is gone, not just the admin.
        assert_eq!(store.count(&kv).unwrap(), 0);
    }

    #[test]
    fn remove_unknown_succeeds_without_effect() {
        let (mut kv, store) = seeded();
        let remove = request(
            Method::RemovePairing,
            &[Tlv::new(tlv_types::IDENTIFIER, b"nobody".to_vec())],
        );
        let response = run(&mut kv, &store, true, &remove);
        assert_eq!(error_of(&response), None);
        assert_eq!(response.effect, AdminEffect::None);
    }
}
