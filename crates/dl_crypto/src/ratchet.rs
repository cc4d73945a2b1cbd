//! Double Ratchet: a DH ratchet (post-compromise security) layered over two
//! symmetric-key chains (forward secrecy), advancing on every message and on
//! every observed change of the peer's ratchet public key.
//!
//! Reference: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   RK  — root key, updated on every DH ratchet step
//!   CKs — sending chain key, updated per message sent
//!   CKr — receiving chain key, updated per message received
//!   MK  — message key, derived from a chain key, used once, then deleted
//!
//! `MaxSkip` (1000) bounds the number of skipped-message keys cached per
//! receiving chain; exceeding it fails the receive with `TooManySkipped`
//! rather than growing the cache unboundedly.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::kdf::{chain_step, root_kdf};

pub const MAX_SKIP: u64 = 1000;

// ── Ratchet header (included in every message, unencrypted) ──────────────────

/// Sent alongside every ciphertext so the recipient can advance their
/// ratchet. Field names and wire layout are the wire contract, not an
/// implementation detail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatchetHeader {
    #[serde(rename = "ratchetPub")]
    pub ratchet_pub: String,
    #[serde(rename = "previousChainLength")]
    pub previous_chain_length: u32,
    #[serde(rename = "messageNumber")]
    pub message_number: u32,
}

pub fn encode_pub(k: &X25519Public) -> String {
    URL_SAFE_NO_PAD.encode(k.as_bytes())
}

/// Decode a ratchet public key as carried in `RatchetHeader::ratchet_pub`.
/// Exposed so callers can derive a `RatchetSession::init_receiver`'s
/// `remote_ratchet_pub_from_first_message` argument from a header field.
pub fn decode_pub(s: &str) -> Result<X25519Public, CryptoError> {
    let bytes = URL_SAFE_NO_PAD.decode(s).map_err(CryptoError::Base64Decode)?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("bad ratchet public key length".into()))?;
    Ok(X25519Public::from(arr))
}

// ── Session state ────────────────────────────────────────────────────────────

/// Complete Double Ratchet state for one peer session. Persisted
/// (encrypted) in `KeyStorage` after every successful send/receive, never
/// before.
#[derive(Serialize, Deserialize)]
pub struct RatchetSession {
    pub session_id: String,
    pub peer_user_id: String,

    root_key: [u8; 32],

    /// Our current DH ratchet keypair. `None` only for a freshly
    /// initialized receiver that has not yet sent its first message.
    dh_send_secret: Option<[u8; 32]>,
    #[serde(with = "option_pub_key_serde")]
    dh_send_pub: Option<X25519Public>,
    /// Sending chain key. `None` whenever `dh_send_secret` is `None`.
    send_ck: Option<[u8; 32]>,
    pub send_n: u64,

    /// Peer's last known DH ratchet public key. `None` only before the
    /// first message has been sent or received in either direction.
    #[serde(with = "option_pub_key_serde")]
    dh_recv_pub: Option<X25519Public>,
    /// Receiving chain key. `None` for a freshly initialized sender that
    /// has not yet received a reply.
    recv_ck: Option<[u8; 32]>,
    pub recv_n: u64,
    pub prev_send_n: u64,

    /// Keyed by `"<b64-ratchetPub>:<msgNum>"`, serialized as an ordered
    /// list of pairs (see `skipped_keys_serde`) rather than a map so the
    /// wire format is a plain JSON array.
    #[serde(with = "skipped_keys_serde")]
    skipped_keys: HashMap<String, [u8; 32]>,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(s) = self.dh_send_secret.as_mut() {
            s.zeroize();
        }
        if let Some(ck) = self.send_ck.as_mut() {
            ck.zeroize();
        }
        if let Some(ck) = self.recv_ck.as_mut() {
            ck.zeroize();
        }
        for mk in self.skipped_keys.values_mut() {
            mk.zeroize();
        }
    }
}

impl RatchetSession {
    /// `initializeSender` — run as the X3DH initiator, immediately after
    /// deriving the shared secret. Runs the initial root-KDF, generates our
    /// first ratchet keypair, and performs one DH ratchet step against the
    /// peer's signed-prekey public (used as the first `remoteRatchetPub`).
    pub fn init_sender(
        session_id: String,
        peer_user_id: String,
        shared_secret: [u8; 32],
        remote_ratchet_pub: &X25519Public,
    ) -> Result<Self, CryptoError> {
        let (root0, _discarded_chain) = root_kdf(&[0u8; 32], &shared_secret)?;

        let dh_send_secret = StaticSecret::random_from_rng(OsRng);
        let dh_send_pub = X25519Public::from(&dh_send_secret);
        let dh_out = dh_send_secret.diffie_hellman(remote_ratchet_pub).to_bytes();
        let (root1, send_ck) = root_kdf(&root0, &dh_out)?;

        Ok(Self {
            session_id,
            peer_user_id,
            root_key: root1,
            dh_send_secret: Some(dh_send_secret.to_bytes()),
            dh_send_pub: Some(dh_send_pub),
            send_ck: Some(send_ck),
            send_n: 0,
            dh_recv_pub: Some(*remote_ratchet_pub),
            recv_ck: None,
            recv_n: 0,
            prev_send_n: 0,
            skipped_keys: HashMap::new(),
        })
    }

    /// `initializeReceiver` — run as the X3DH responder. Runs the same
    /// initial root-KDF, but the resulting chain key becomes the
    /// *receiving* chain key (not discarded), since the responder has no
    /// ratchet keypair of its own yet. That keypair is generated lazily on
    /// the first send.
    pub fn init_receiver(
        session_id: String,
        peer_user_id: String,
        shared_secret: [u8; 32],
        remote_ratchet_pub_from_first_message: &X25519Public,
    ) -> Result<Self, CryptoError> {
        let (root0, recv_ck0) = root_kdf(&[0u8; 32], &shared_secret)?;

        Ok(Self {
            session_id,
            peer_user_id,
            root_key: root0,
            dh_send_secret: None,
            dh_send_pub: None,
            send_ck: None,
            send_n: 0,
            dh_recv_pub: Some(*remote_ratchet_pub_from_first_message),
            recv_ck: Some(recv_ck0),
            recv_n: 0,
            prev_send_n: 0,
            skipped_keys: HashMap::new(),
        })
    }

    // ── Send ─────────────────────────────────────────────────────────────

    /// Encrypt a message. Returns `(header, message_key)`; the caller uses
    /// `message_key` with `aead::encrypt` and sends `header` alongside the
    /// ciphertext unencrypted.
    pub fn encrypt_step(&mut self) -> Result<(RatchetHeader, [u8; 32]), CryptoError> {
        if self.send_ck.is_none() {
            let remote = self
                .dh_recv_pub
                .ok_or_else(|| CryptoError::RatchetStep("no remote ratchet key to ratchet against".into()))?;
            let new_secret = StaticSecret::random_from_rng(OsRng);
            let new_pub = X25519Public::from(&new_secret);
            let dh_out = new_secret.diffie_hellman(&remote).to_bytes();
            let (new_root, new_send_ck) = root_kdf(&self.root_key, &dh_out)?;
            self.root_key = new_root;
            self.dh_send_secret = Some(new_secret.to_bytes());
            self.dh_send_pub = Some(new_pub);
            self.send_ck = Some(new_send_ck);
            self.prev_send_n = self.send_n;
            self.send_n = 0;
        }

        let ck = self.send_ck.expect("send_ck set above");
        let (new_ck, mk) = chain_step(&ck)?;
        self.send_ck = Some(new_ck);

        let header = RatchetHeader {
            ratchet_pub: encode_pub(&self.dh_send_pub.expect("dh_send_pub set above")),
            previous_chain_length: self.prev_send_n as u32,
            message_number: self.send_n as u32,
        };
        self.send_n += 1;
        Ok((header, mk))
    }

    // ── Receive ──────────────────────────────────────────────────────────

    /// Derive the message key for a received message. Does not mutate
    /// `self` until every fallible step has succeeded — a failed decrypt
    /// upstream must see a `self` unchanged from before the call only if
    /// the caller discards the returned error without committing; callers
    /// are expected to persist `self` only after the AEAD open using this
    /// key also succeeds.
    pub fn decrypt_step(&mut self, header: &RatchetHeader) -> Result<[u8; 32], CryptoError> {
        let peer_dh = decode_pub(&header.ratchet_pub)?;
        let n = header.message_number as u64;
        let pn = header.previous_chain_length as u64;

        let skip_key = format!("{}:{}", header.ratchet_pub, n);
        if let Some(mk) = self.skipped_keys.remove(&skip_key) {
            return Ok(mk);
        }

        let need_dh_ratchet = match self.dh_recv_pub {
            Some(current) => current.as_bytes() != peer_dh.as_bytes(),
            None => true,
        };

        if need_dh_ratchet {
            if self.recv_ck.is_some() {
                self.skip_message_keys(pn)?;
            }

            self.dh_recv_pub = Some(peer_dh);

            let recv_secret = StaticSecret::from(
                self.dh_send_secret
                    .ok_or_else(|| CryptoError::RatchetStep("no local ratchet secret to DH against".into()))?,
            );
            let dh_recv_out = recv_secret.diffie_hellman(&peer_dh).to_bytes();
            let (root1, new_recv_ck) = root_kdf(&self.root_key, &dh_recv_out)?;
            self.root_key = root1;
            self.recv_ck = Some(new_recv_ck);
            self.recv_n = 0;

            // Eagerly regenerate our sending ratchet too (spec step: "Then
            // generate a new sending ratchet keypair and derive a fresh
            // sendingChainKey by ratcheting the root again").
            self.prev_send_n = self.send_n;
            self.send_n = 0;
            let new_send_secret = StaticSecret::random_from_rng(OsRng);
            let new_send_pub = X25519Public::from(&new_send_secret);
            let dh_send_out = new_send_secret.diffie_hellman(&peer_dh).to_bytes();
            let (root2, new_send_ck) = root_kdf(&self.root_key, &dh_send_out)?;
            self.root_key = root2;
            self.send_ck = Some(new_send_ck);
            self.dh_send_pub = Some(new_send_pub);
            self.dh_send_secret = Some(new_send_secret.to_bytes());
        }

        self.skip_message_keys(n)?;

        let ck = self.recv_ck.expect("receiving chain established above");
        let (new_ck, mk) = chain_step(&ck)?;
        self.recv_ck = Some(new_ck);
        self.recv_n += 1;

        Ok(mk)
    }

    /// Derive and cache message keys for positions `[recv_n, until)` on the
    /// current receiving chain. Fails with `TooManySkipped` if the gap
    /// exceeds `MAX_SKIP`.
    fn skip_message_keys(&mut self, until: u64) -> Result<(), CryptoError> {
        if until <= self.recv_n {
            return Ok(());
        }
        let skip_count = until - self.recv_n;
        if skip_count > MAX_SKIP {
            return Err(CryptoError::TooManySkipped { attempted: skip_count, max: MAX_SKIP });
        }

        let dh_pub_b64 = self.dh_recv_pub.map(|k| encode_pub(&k)).unwrap_or_default();
        let mut ck = self.recv_ck.unwrap_or([0u8; 32]);

        while self.recv_n < until {
            let (new_ck, mk) = chain_step(&ck)?;
            ck = new_ck;
            self.skipped_keys.insert(format!("{dh_pub_b64}:{}", self.recv_n), mk);
            self.recv_n += 1;
        }
        self.recv_ck = Some(ck);

        while self.skipped_keys.len() > (2 * MAX_SKIP) as usize {
            if let Some(key) = self.skipped_keys.keys().next().cloned() {
                if let Some(mut mk) = self.skipped_keys.remove(&key) {
                    mk.zeroize();
                }
            }
        }

        Ok(())
    }

    /// Our current DH ratchet public key, if we have generated one.
    pub fn our_ratchet_pub(&self) -> Option<X25519Public> {
        self.dh_send_pub
    }
}

// ── Serde helpers ──────────────────────────────────────────────────────────

pub(crate) mod pub_key_serde {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey as X25519Public;

    pub fn serialize<S>(key: &X25519Public, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<X25519Public, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
        Ok(X25519Public::from(arr))
    }
}

mod option_pub_key_serde {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey as X25519Public;

    pub fn serialize<S>(key: &Option<X25519Public>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match key {
            Some(k) => serializer.serialize_some(&URL_SAFE_NO_PAD.encode(k.as_bytes())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<X25519Public>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            None => Ok(None),
            Some(s) => {
                let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
                Ok(Some(X25519Public::from(arr)))
            }
        }
    }
}

/// Serializes `skipped_keys` as an ordered list of
/// `["<b64-ratchetPub>:<msgNum>", "<b64-mk>"]` pairs, per the wire
/// contract, instead of relying on serde_json's map representation.
mod skipped_keys_serde {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S>(map: &HashMap<String, [u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let pairs: Vec<(String, String)> = map
            .iter()
            .map(|(k, v)| (k.clone(), URL_SAFE_NO_PAD.encode(v)))
            .collect();
        pairs.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, [u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pairs: Vec<(String, String)> = Vec::deserialize(deserializer)?;
        pairs
            .into_iter()
            .map(|(k, v)| {
                let bytes = URL_SAFE_NO_PAD.decode(&v).map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32-byte message key"))?;
                Ok((k, arr))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_sessions() -> (RatchetSession, RatchetSession) {
        let shared_secret = [42u8; 32];
        let bob_spk = StaticSecret::random_from_rng(OsRng);
        let bob_spk_pub = X25519Public::from(&bob_spk);

        let alice = RatchetSession::init_sender(
            "sess-1".into(),
            "bob".into(),
            shared_secret,
            &bob_spk_pub,
        )
        .unwrap();

        let bob = RatchetSession::init_receiver(
            "sess-1".into(),
            "alice".into(),
            shared_secret,
            &alice.dh_send_pub.unwrap(),
        )
        .unwrap();

        (alice, bob)
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let (mut alice, mut bob) = paired_sessions();

        for i in 0..3 {
            let (header, mk_alice) = alice.encrypt_step().unwrap();
            let mk_bob = bob.decrypt_step(&header).unwrap();
            assert_eq!(mk_alice, mk_bob, "message {i}: keys must match");
        }

        for i in 0..2 {
            let (header, mk_bob) = bob.encrypt_step().unwrap();
            let mk_alice = alice.decrypt_step(&header).unwrap();
            assert_eq!(mk_bob, mk_alice, "bob message {i}: keys must match");
        }

        let (header, mk_a) = alice.encrypt_step().unwrap();
        let mk_b = bob.decrypt_step(&header).unwrap();
        assert_eq!(mk_a, mk_b);
    }

    #[test]
    fn out_of_order_messages() {
        let (mut alice, mut bob) = paired_sessions();

        let (h0, mk0) = alice.encrypt_step().unwrap();
        let (h1, mk1) = alice.encrypt_step().unwrap();
        let (h2, mk2) = alice.encrypt_step().unwrap();

        let mk2_bob = bob.decrypt_step(&h2).unwrap();
        assert_eq!(mk2, mk2_bob);

        let mk0_bob = bob.decrypt_step(&h0).unwrap();
        assert_eq!(mk0, mk0_bob);

        let mk1_bob = bob.decrypt_step(&h1).unwrap();
        assert_eq!(mk1, mk1_bob);

        assert!(bob.skipped_keys.is_empty(), "no skipped entries should remain after m1 arrives");
    }

    #[test]
    fn bidirectional_symmetry_after_alternating_roles() {
        let (mut alice, mut bob) = paired_sessions();

        let (h, mk) = alice.encrypt_step().unwrap();
        assert_eq!(mk, bob.decrypt_step(&h).unwrap());

        let (h, mk) = bob.encrypt_step().unwrap();
        assert_eq!(mk, alice.decrypt_step(&h).unwrap());

        let (h, mk) = alice.encrypt_step().unwrap();
        assert_eq!(mk, bob.decrypt_step(&h).unwrap());

        let (h, mk) = bob.encrypt_step().unwrap();
        assert_eq!(mk, alice.decrypt_step(&h).unwrap());
    }

    #[test]
    fn exactly_max_skip_succeeds_and_one_more_fails() {
        let (mut alice, mut bob) = paired_sessions();

        let mut headers = Vec::new();
        for _ in 0..=MAX_SKIP {
            headers.push(alice.encrypt_step().unwrap().0);
        }

        // Deliver the last one first: skips exactly MAX_SKIP messages.
        let last = headers.pop().unwrap();
        assert!(bob.decrypt_step(&last).is_ok());

        // Bob's chain is now exhausted; a message one further ahead skips
        // MAX_SKIP + 1 entries and must fail.
        let (mut alice2, mut bob2) = paired_sessions();
        for _ in 0..=(MAX_SKIP + 1) {
            let _ = alice2.encrypt_step().unwrap();
        }
        let (too_far_header, _) = alice2.encrypt_step().unwrap();
        let err = bob2.decrypt_step(&too_far_header);
        assert!(matches!(err, Err(CryptoError::TooManySkipped { .. })));
    }
}
