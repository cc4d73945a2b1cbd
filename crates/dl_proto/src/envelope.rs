//! Wire envelope — what is attached to a transmitted message.
//!
//! The cryptographic wire contract is exactly `header` + `ciphertext` +
//! optional `x3dh` (present only on the first envelope an initiator sends
//! in a session). Everything else on `Envelope` is addressing metadata a
//! transport needs to route the envelope to the right peer — the
//! transport itself (WebSocket broker, polling relay, etc.) is out of
//! scope here; this crate only defines the shapes that cross that
//! boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dl_crypto::ratchet::RatchetHeader;
use dl_crypto::x3dh::X3DHHeader;

/// On-wire envelope produced by `SessionManager::encrypt_message` and
/// consumed by `SessionManager::decrypt_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Random UUID, for transport-level ack/dedup — no cryptographic role.
    pub envelope_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub sent_at: DateTime<Utc>,
    pub session_id: String,

    /// Double Ratchet header: `{ ratchetPub, previousChainLength, messageNumber }`.
    pub header: RatchetHeader,

    /// `nonce24 || AEAD(nonce, messageKey, plaintext)`, base64url-encoded.
    pub ciphertext: String,

    /// Present only on the first envelope an initiator sends in a session;
    /// cleared from the `SessionRecord`'s send hint immediately after.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x3dh: Option<X3DHHeader>,
}
