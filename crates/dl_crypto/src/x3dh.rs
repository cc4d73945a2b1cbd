//! X3DH (Extended Triple Diffie-Hellman) — asynchronous, one-round key
//! agreement between two identities, one of whom (the responder) may be
//! offline at the time of initiation.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519): <https://datatracker.ietf.org/doc/html/rfc7748>
//!   - RFC 5869 (HKDF):  <https://datatracker.ietf.org/doc/html/rfc5869>
//!
//! Wire contract (fixed, not an implementation detail):
//!   DH1 = DH(IK_A, SPK_B)     — mutual authentication
//!   DH2 = DH(EK_A, IK_B)      — forward secrecy
//!   DH3 = DH(EK_A, SPK_B)     — replay protection
//!   DH4 = DH(EK_A, OPK_B)     — one-time forward secrecy, only if an OPK was offered
//!   sharedSecret = HKDF-SHA256(ikm = DH1‖DH2‖DH3[‖DH4], salt = 0, info = "WHATSAPP-CLONE-X3DH", L = 32)
//!
//! Unlike a common shortcut, `IK` here is an independently-derived X25519
//! keypair (see `identity::IdentityKeyPair`), not an Ed25519 key
//! reinterpreted as a Montgomery point — so the signing key that
//! authenticates the signed prekey and the DH key that feeds X3DH are
//! cryptographically unrelated beyond sharing a seed.
//!
//! A one-time prekey, when the bundle offers one, is always folded into
//! the shared secret on both sides (DH4). Earlier revisions of this
//! protocol stack shipped with OPK usage disabled on the initiator side
//! ("one-time prekeys cause sync issues") — that was a bug, not a
//! feature: it silently dropped an entire forward-secrecy contribution
//! and is not reproduced here.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{error::CryptoError, identity::IdentityKeyPair, kdf};

// ── Prekey bundle (pure value type; wire encoding lives in dl_proto) ─────────

/// Everything an initiator needs from the responder's published bundle.
#[derive(Debug, Clone)]
pub struct PrekeyBundle {
    /// IK_B — responder's X25519 identity public key.
    pub identity_key: X25519Public,
    /// SK_B — responder's Ed25519 signing public key, used only to verify
    /// `signed_prekey_sig`.
    pub signing_key: [u8; 32],
    /// SPK_B — responder's current signed prekey public key.
    pub signed_prekey: X25519Public,
    pub signed_prekey_sig: [u8; 64],
    pub signed_prekey_id: u32,
    /// OPK_B — optional one-time prekey. Absent is a valid, accepted state.
    pub one_time_prekey: Option<X25519Public>,
    pub one_time_prekey_id: Option<u32>,
}

/// Generate a signed prekey: an X25519 keypair with the public half signed
/// by the identity's Ed25519 signing key.
pub fn generate_signed_prekey(
    identity: &IdentityKeyPair,
) -> Result<(StaticSecret, X25519Public, [u8; 64]), CryptoError> {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = X25519Public::from(&secret);
    let sig = identity.sign(public.as_bytes())?;
    Ok((secret, public, sig))
}

/// Generate a batch of one-time prekeys (X25519).
pub fn generate_one_time_prekeys(count: usize) -> Vec<(StaticSecret, X25519Public)> {
    (0..count)
        .map(|_| {
            let s = StaticSecret::random_from_rng(rand::rngs::OsRng);
            let p = X25519Public::from(&s);
            (s, p)
        })
        .collect()
}

// ── Init header (carried on the wire only on the initiator's first message) ──

/// Sent alongside the first ciphertext so the responder can derive the same
/// shared secret. Also doubles as the `X3DHSendHint` persisted on the
/// initiator's `SessionRecord` until the first message is actually sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct X3DHHeader {
    #[serde(with = "crate::ratchet::pub_key_serde")]
    pub sender_identity_pub: X25519Public,
    #[serde(with = "crate::ratchet::pub_key_serde")]
    pub sender_ephemeral_pub: X25519Public,
    pub used_signed_prekey_id: u32,
    pub used_one_time_prekey_id: Option<u32>,
}

pub struct X3DHResult {
    /// Feeds into `RatchetEngine::init_sender` as the initial root input.
    pub shared_key: [u8; 32],
    pub header: X3DHHeader,
}

fn concat_dh(parts: &[&[u8; 32]]) -> Vec<u8> {
    let mut ikm = Vec::with_capacity(parts.len() * 32);
    for p in parts {
        ikm.extend_from_slice(*p);
    }
    ikm
}

// ── Initiator ─────────────────────────────────────────────────────────────────

/// Run the initiator half of X3DH against a fetched bundle.
///
/// 1. Verify `signed_prekey_sig` over `signed_prekey` with `signing_key` —
///    failure is fatal (`BadBundle`); no DH output is computed past this
///    point.
/// 2. Generate a fresh random ephemeral keypair.
/// 3. Compute DH1..DH3(/DH4) and derive the shared secret.
pub fn initiate(
    my_identity: &IdentityKeyPair,
    bundle: &PrekeyBundle,
) -> Result<X3DHResult, CryptoError> {
    IdentityKeyPair::verify(&bundle.signing_key, bundle.signed_prekey.as_bytes(), &bundle.signed_prekey_sig)
        .map_err(|_| CryptoError::BadBundle("signed prekey signature verification failed".into()))?;

    let ephemeral_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral_secret);

    let dh1 = my_identity.dh(&bundle.signed_prekey)?;
    let dh2 = ephemeral_secret.diffie_hellman(&bundle.identity_key).to_bytes();
    let dh3 = ephemeral_secret.diffie_hellman(&bundle.signed_prekey).to_bytes();

    let mut ikm = match bundle.one_time_prekey {
        Some(opk) => {
            let dh4 = ephemeral_secret.diffie_hellman(&opk).to_bytes();
            concat_dh(&[&dh1, &dh2, &dh3, &dh4])
        }
        None => concat_dh(&[&dh1, &dh2, &dh3]),
    };

    let shared_key = kdf::x3dh_shared_secret(&ikm)?;
    ikm.zeroize();

    Ok(X3DHResult {
        shared_key,
        header: X3DHHeader {
            sender_identity_pub: my_identity.x25519_public()?,
            sender_ephemeral_pub: ephemeral_public,
            used_signed_prekey_id: bundle.signed_prekey_id,
            used_one_time_prekey_id: bundle.one_time_prekey_id,
        },
    })
}

// ── Responder ─────────────────────────────────────────────────────────────────

/// Reconstruct the shared secret on the responder side from an
/// `X3DHHeader` received on the first message.
///
/// `my_opk_secret` must be `Some` exactly when `header.used_one_time_prekey_id`
/// is `Some` — a mismatch indicates a malformed or tampered header.
pub fn respond(
    my_identity: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    header: &X3DHHeader,
) -> Result<[u8; 32], CryptoError> {
    if header.used_one_time_prekey_id.is_some() != my_opk_secret.is_some() {
        return Err(CryptoError::BadBundle(
            "one-time prekey presence mismatch between header and supplied secret".into(),
        ));
    }

    let dh1 = my_spk_secret.diffie_hellman(&header.sender_identity_pub).to_bytes();
    let dh2 = my_identity.dh(&header.sender_ephemeral_pub)?;
    let dh3 = my_spk_secret.diffie_hellman(&header.sender_ephemeral_pub).to_bytes();

    let mut ikm = match my_opk_secret {
        Some(opk_secret) => {
            let dh4 = opk_secret.diffie_hellman(&header.sender_ephemeral_pub).to_bytes();
            concat_dh(&[&dh1, &dh2, &dh3, &dh4])
        }
        None => concat_dh(&[&dh1, &dh2, &dh3]),
    };

    let shared_key = kdf::x3dh_shared_secret(&ikm)?;
    ikm.zeroize();
    Ok(shared_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bob_bundle(
        bob_ik: &IdentityKeyPair,
        spk_pub: X25519Public,
        spk_sig: [u8; 64],
        opk: Option<(&StaticSecret, X25519Public)>,
    ) -> PrekeyBundle {
        PrekeyBundle {
            identity_key: bob_ik.x25519_public().unwrap(),
            signing_key: bob_ik.signing_public().unwrap().0,
            signed_prekey: spk_pub,
            signed_prekey_sig: spk_sig,
            signed_prekey_id: 1,
            one_time_prekey: opk.map(|(_, p)| p),
            one_time_prekey_id: opk.map(|_| 7),
        }
    }

    #[test]
    fn x3dh_roundtrip_without_opk() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();

        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik).unwrap();
        let bundle = bob_bundle(&bob_ik, bob_spk_pub, bob_spk_sig, None);

        let result = initiate(&alice_ik, &bundle).unwrap();
        let bob_sk = respond(&bob_ik, &bob_spk_secret, None, &result.header).unwrap();

        assert_eq!(result.shared_key, bob_sk, "Alice and Bob must derive the same shared secret");
        assert_eq!(result.header.used_one_time_prekey_id, None);
    }

    #[test]
    fn x3dh_roundtrip_with_opk() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();

        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik).unwrap();
        let opks = generate_one_time_prekeys(1);
        let (ref bob_opk_secret, bob_opk_pub) = opks[0];

        let bundle = bob_bundle(
            &bob_ik,
            bob_spk_pub,
            bob_spk_sig,
            Some((bob_opk_secret, bob_opk_pub)),
        );

        let result = initiate(&alice_ik, &bundle).unwrap();
        let bob_sk = respond(&bob_ik, &bob_spk_secret, Some(bob_opk_secret), &result.header).unwrap();

        assert_eq!(result.shared_key, bob_sk);
        assert_eq!(result.header.used_one_time_prekey_id, Some(7));
    }

    #[test]
    fn rejects_invalid_spk_signature() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let evil_ik = IdentityKeyPair::generate().unwrap();

        let (bob_spk_secret, bob_spk_pub, _good_sig) = generate_signed_prekey(&bob_ik).unwrap();
        let evil_sig = evil_ik.sign(bob_spk_pub.as_bytes()).unwrap();

        let bundle = bob_bundle(&bob_ik, bob_spk_pub, evil_sig, None);

        let err = initiate(&alice_ik, &bundle);
        assert!(err.is_err(), "must reject a signed prekey signed by the wrong identity");
        assert!(matches!(err.unwrap_err(), CryptoError::BadBundle(_)));
    }

    #[test]
    fn opk_presence_mismatch_is_rejected() {
        let alice_ik = IdentityKeyPair::generate().unwrap();
        let bob_ik = IdentityKeyPair::generate().unwrap();
        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = generate_signed_prekey(&bob_ik).unwrap();
        let opks = generate_one_time_prekeys(1);
        let (ref bob_opk_secret, bob_opk_pub) = opks[0];

        let bundle = bob_bundle(
            &bob_ik,
            bob_spk_pub,
            bob_spk_sig,
            Some((bob_opk_secret, bob_opk_pub)),
        );
        let result = initiate(&alice_ik, &bundle).unwrap();

        // Header says an OPK was used, but the responder doesn't supply its secret.
        let err = respond(&bob_ik, &bob_spk_secret, None, &result.header);
        assert!(err.is_err());
    }
}
