//! Key material, addresses, assets and shielded notes.
//!
//! The cryptographic operations here are pure and stateless: key derivation,
//! note commitment and nullifier computation, and the note encryption
//! envelope used for keyed trial decryption. All derivations are
//! domain-separated BLAKE3; the wallet engine only ever invokes them, it
//! never inspects their internals.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Derives a 32-byte value from `data` in the given domain.
fn derive(domain: &str, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

macro_rules! hash_newtype {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub [u8; 32]);

        impl $name {
            #[allow(dead_code)]
            pub(crate) const MIN: $name = $name([0x00; 32]);
            #[allow(dead_code)]
            pub(crate) const MAX: $name = $name([0xff; 32]);

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                $name(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

hash_newtype!(
    /// Hash identifying a block.
    BlockHash
);
hash_newtype!(
    /// Hash identifying a transaction.
    TransactionHash
);
hash_newtype!(
    /// The commitment to a note, used as the note's identity and as the leaf
    /// stored in the global note commitment tree.
    NoteHash
);
hash_newtype!(
    /// A deterministic, view-key-unlinkable tag revealed when spending a
    /// note. Collision with the chain's nullifier set means the note has
    /// been spent.
    Nullifier
);
hash_newtype!(
    /// Identifier of an asset, derived from its creator and description.
    AssetId
);
hash_newtype!(
    /// A shielded public address notes can be sent to.
    PublicAddress
);

impl AssetId {
    /// The chain's native asset.
    pub const NATIVE: AssetId = AssetId([0x00; 32]);

    /// Recomputes the identifier an asset created by `creator` with the given
    /// description would have.
    pub fn from_parts(creator: &PublicAddress, name: &str, metadata: &str) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key("shielded-wallet.asset.v1");
        hasher.update(creator.as_bytes());
        hasher.update(&(name.len() as u32).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update(metadata.as_bytes());
        AssetId(*hasher.finalize().as_bytes())
    }
}

/// An asset minted on the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub name: String,
    pub metadata: String,
    pub creator: PublicAddress,
}

impl Asset {
    pub fn new(creator: PublicAddress, name: impl Into<String>, metadata: impl Into<String>) -> Self {
        let name = name.into();
        let metadata = metadata.into();
        let id = AssetId::from_parts(&creator, &name, &metadata);
        Asset {
            id,
            name,
            metadata,
            creator,
        }
    }
}

/// The root spend authority for an account. The view keys and the public
/// address all derive from it.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingKey([u8; 32]);

impl SpendingKey {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        SpendingKey(bytes)
    }

    pub fn incoming_view_key(&self) -> IncomingViewKey {
        IncomingViewKey(derive("shielded-wallet.key.incoming-view.v1", &self.0))
    }

    pub fn outgoing_view_key(&self) -> OutgoingViewKey {
        OutgoingViewKey(derive("shielded-wallet.key.outgoing-view.v1", &self.0))
    }

    pub fn public_address(&self) -> PublicAddress {
        self.incoming_view_key().public_address()
    }
}

impl fmt::Debug for SpendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SpendingKey(..)")
    }
}

/// Grants the ability to detect and decrypt notes addressed to the account.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingViewKey([u8; 32]);

impl IncomingViewKey {
    pub fn public_address(&self) -> PublicAddress {
        PublicAddress(derive("shielded-wallet.key.public-address.v1", &self.0))
    }
}

impl fmt::Debug for IncomingViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IncomingViewKey(..)")
    }
}

/// Grants the ability to decrypt the spender copies of notes the account
/// sent to others.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingViewKey([u8; 32]);

impl fmt::Debug for OutgoingViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutgoingViewKey(..)")
    }
}

/// A shielded UTXO output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub owner: PublicAddress,
    pub value: u64,
    pub memo: String,
    pub asset_id: AssetId,
    pub sender: PublicAddress,
    randomness: [u8; 32],
}

impl Note {
    pub fn new<R: RngCore>(
        owner: PublicAddress,
        value: u64,
        memo: impl Into<String>,
        asset_id: AssetId,
        sender: PublicAddress,
        rng: &mut R,
    ) -> Self {
        let mut randomness = [0u8; 32];
        rng.fill_bytes(&mut randomness);
        Note {
            owner,
            value,
            memo: memo.into(),
            asset_id,
            sender,
            randomness,
        }
    }

    /// The note's commitment, its identity within the wallet and the leaf
    /// value appended to the global note commitment tree.
    pub fn hash(&self) -> NoteHash {
        let mut hasher = blake3::Hasher::new_derive_key("shielded-wallet.note.commitment.v1");
        hasher.update(self.owner.as_bytes());
        hasher.update(&self.value.to_le_bytes());
        hasher.update(self.asset_id.as_bytes());
        hasher.update(self.sender.as_bytes());
        hasher.update(&self.randomness);
        hasher.update(self.memo.as_bytes());
        NoteHash(*hasher.finalize().as_bytes())
    }

    /// The nullifier revealed when this note is spent. Only derivable with
    /// the spending key and the note's position in the commitment tree.
    pub fn nullifier(&self, spending_key: &SpendingKey, position: u64) -> Nullifier {
        let mut hasher = blake3::Hasher::new_derive_key("shielded-wallet.note.nullifier.v1");
        hasher.update(&spending_key.0);
        hasher.update(self.hash().as_bytes());
        hasher.update(&position.to_le_bytes());
        Nullifier(*hasher.finalize().as_bytes())
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 * 4 + 8 + 4 + self.memo.len());
        out.extend_from_slice(self.owner.as_bytes());
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(self.asset_id.as_bytes());
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(&self.randomness);
        out.extend_from_slice(&(self.memo.len() as u32).to_le_bytes());
        out.extend_from_slice(self.memo.as_bytes());
        out
    }

    fn deserialize(bytes: &[u8]) -> Option<Note> {
        fn word<'a>(cursor: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
            if cursor.len() < n {
                return None;
            }
            let (head, tail) = cursor.split_at(n);
            *cursor = tail;
            Some(head)
        }

        let mut cursor = bytes;
        let owner = PublicAddress(word(&mut cursor, 32)?.try_into().ok()?);
        let value = u64::from_le_bytes(word(&mut cursor, 8)?.try_into().ok()?);
        let asset_id = AssetId(word(&mut cursor, 32)?.try_into().ok()?);
        let sender = PublicAddress(word(&mut cursor, 32)?.try_into().ok()?);
        let randomness: [u8; 32] = word(&mut cursor, 32)?.try_into().ok()?;
        let memo_len = u32::from_le_bytes(word(&mut cursor, 4)?.try_into().ok()?) as usize;
        let memo = String::from_utf8(word(&mut cursor, memo_len)?.to_vec()).ok()?;
        if !cursor.is_empty() {
            return None;
        }
        Some(Note {
            owner,
            value,
            memo,
            asset_id,
            sender,
            randomness,
        })
    }
}

/// The encrypted form of a [`Note`] as it appears in a transaction.
///
/// The plaintext is sealed twice: once under a key only holders of the
/// owner's incoming view key can reconstruct, and once under the sender's
/// outgoing view key so the sender can recognize their own outputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedNote {
    commitment: NoteHash,
    owner_ciphertext: Vec<u8>,
    owner_tag: [u8; 32],
    spender_ciphertext: Vec<u8>,
    spender_tag: [u8; 32],
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> (Vec<u8>, [u8; 32]) {
    let mut ciphertext = vec![0u8; plaintext.len()];
    blake3::Hasher::new_keyed(key)
        .update(b"shielded-wallet.note.keystream.v1")
        .finalize_xof()
        .fill(&mut ciphertext);
    for (c, p) in ciphertext.iter_mut().zip(plaintext) {
        *c ^= p;
    }
    let tag = *blake3::keyed_hash(key, &ciphertext).as_bytes();
    (ciphertext, tag)
}

fn open(key: &[u8; 32], ciphertext: &[u8], tag: &[u8; 32]) -> Option<Vec<u8>> {
    if blake3::keyed_hash(key, ciphertext).as_bytes() != tag {
        return None;
    }
    let mut plaintext = vec![0u8; ciphertext.len()];
    blake3::Hasher::new_keyed(key)
        .update(b"shielded-wallet.note.keystream.v1")
        .finalize_xof()
        .fill(&mut plaintext);
    for (p, c) in plaintext.iter_mut().zip(ciphertext) {
        *p ^= c;
    }
    Some(plaintext)
}

fn owner_key(address: &PublicAddress) -> [u8; 32] {
    derive("shielded-wallet.note.owner-key.v1", address.as_bytes())
}

fn spender_key(ovk: &OutgoingViewKey) -> [u8; 32] {
    derive("shielded-wallet.note.spender-key.v1", &ovk.0)
}

impl EncryptedNote {
    pub fn encrypt(note: &Note, sender_ovk: &OutgoingViewKey) -> Self {
        let plaintext = note.serialize();
        let (owner_ciphertext, owner_tag) = seal(&owner_key(&note.owner), &plaintext);
        let (spender_ciphertext, spender_tag) = seal(&spender_key(sender_ovk), &plaintext);
        EncryptedNote {
            commitment: note.hash(),
            owner_ciphertext,
            owner_tag,
            spender_ciphertext,
            spender_tag,
        }
    }

    pub fn commitment(&self) -> NoteHash {
        self.commitment
    }

    /// Trial decryption with the recipient's incoming view key.
    pub fn decrypt_for_owner(&self, ivk: &IncomingViewKey) -> Option<Note> {
        let key = owner_key(&ivk.public_address());
        let plaintext = open(&key, &self.owner_ciphertext, &self.owner_tag)?;
        Note::deserialize(&plaintext).filter(|note| note.owner == ivk.public_address())
    }

    /// Trial decryption of the spender copy with the sender's outgoing view
    /// key.
    pub fn decrypt_for_spender(&self, ovk: &OutgoingViewKey) -> Option<Note> {
        let plaintext = open(&spender_key(ovk), &self.spender_ciphertext, &self.spender_tag)?;
        Note::deserialize(&plaintext)
    }
}
