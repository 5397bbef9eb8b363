//! Content id hashing and the object encryption envelope.
//!
//! Every object stored in the repository starts with a one byte envelope tag
//! naming the key mode it was written with. `detect` dispatches on that tag
//! given any sample object, which is how the checker recovers the key for a
//! repository it knows nothing else about.

use std::path::Path;

use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::{Blake2b, Blake2bMac, Digest};
use bytes::Bytes;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{ChunkId, Error};

/// Envelope tag for objects written with a secret key.
pub const TAG_SECRET: u8 = 0x00;
/// Envelope tag for objects written without encryption.
pub const TAG_PLAINTEXT: u8 = 0x02;

const NONCE_LEN: usize = 24;
const COMPRESSION_LEVEL: i32 = 3;

/// Key used for id hashing and the encryption envelope of a repository.
pub enum Key {
    /// No encryption, unkeyed content hashing. Objects are still compressed.
    Plaintext,
    /// Keyed content hashing and authenticated encryption.
    Secret(SecretKey),
}

pub struct SecretKey {
    id_key: [u8; 32],
    enc_key: [u8; 32],
    chunk_seed: u32,
}

#[derive(Serialize, Deserialize)]
struct KeyfileData {
    version: u32,
    #[serde(with = "serde_bytes")]
    id_key: Vec<u8>,
    #[serde(with = "serde_bytes")]
    enc_key: Vec<u8>,
    chunk_seed: u32,
}

impl Key {
    /// Generate a fresh secret key.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut id_key = [0u8; 32];
        let mut enc_key = [0u8; 32];
        let mut seed = [0u8; 4];
        rng.fill_bytes(&mut id_key);
        rng.fill_bytes(&mut enc_key);
        rng.fill_bytes(&mut seed);
        Self::Secret(SecretKey {
            id_key,
            enc_key,
            chunk_seed: u32::from_le_bytes(seed),
        })
    }

    /// Dispatch on the envelope tag of any repository object.
    ///
    /// A secret envelope requires the keyfile stored next to the repository.
    pub fn detect(keyfile: &Path, sample: &[u8]) -> Result<Self, Error> {
        match sample.first().copied() {
            Some(TAG_PLAINTEXT) => Ok(Self::Plaintext),
            Some(TAG_SECRET) => Self::load(keyfile),
            Some(tag) => Err(Error::UnknownKeyType(tag)),
            None => Err(Error::Crypto),
        }
    }

    /// Load a secret key from its keyfile.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)?;
        let keyfile: KeyfileData = rmp_serde::from_slice(&data)?;
        if keyfile.version != 1 {
            return Err(Error::UnknownKeyType(TAG_SECRET));
        }
        if keyfile.id_key.len() != 32 || keyfile.enc_key.len() != 32 {
            return Err(Error::Crypto);
        }
        let mut id_key = [0u8; 32];
        let mut enc_key = [0u8; 32];
        id_key.copy_from_slice(&keyfile.id_key);
        enc_key.copy_from_slice(&keyfile.enc_key);
        Ok(Self::Secret(SecretKey {
            id_key,
            enc_key,
            chunk_seed: keyfile.chunk_seed,
        }))
    }

    /// Write the key material to a keyfile. No-op for a plaintext key.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let Self::Secret(key) = self else {
            return Ok(());
        };
        let keyfile = KeyfileData {
            version: 1,
            id_key: key.id_key.to_vec(),
            enc_key: key.enc_key.to_vec(),
            chunk_seed: key.chunk_seed,
        };
        std::fs::write(path, rmp_serde::to_vec(&keyfile)?)?;
        Ok(())
    }

    /// Seed mixed into the rolling hash table of the chunker.
    pub fn chunk_seed(&self) -> u32 {
        match self {
            Self::Plaintext => 0,
            Self::Secret(key) => key.chunk_seed,
        }
    }

    /// Content id of the given plaintext. Keyed under a secret key.
    pub fn id_hash(&self, data: &[u8]) -> ChunkId {
        match self {
            Self::Plaintext => {
                let digest = Blake2b::<U32>::new().chain_update(data).finalize();
                ChunkId::from_slice(&digest)
            }
            Self::Secret(key) => {
                let mac = <Blake2bMac<U32> as Mac>::new_from_slice(&key.id_key)
                    .expect("id key length")
                    .chain_update(data)
                    .finalize()
                    .into_bytes();
                ChunkId::from_slice(&mac)
            }
        }
    }

    /// Compress and seal a plaintext into its storage envelope.
    pub fn encrypt(&self, data: &[u8]) -> Result<Bytes, Error> {
        let compressed = zstd::encode_all(data, COMPRESSION_LEVEL)?;
        match self {
            Self::Plaintext => {
                let mut out = Vec::with_capacity(1 + compressed.len());
                out.push(TAG_PLAINTEXT);
                out.extend_from_slice(&compressed);
                Ok(out.into())
            }
            Self::Secret(key) => {
                let cipher = XChaCha20Poly1305::new((&key.enc_key).into());
                let mut nonce = [0u8; NONCE_LEN];
                rand::rng().fill_bytes(&mut nonce);
                let sealed = cipher.encrypt(XNonce::from_slice(&nonce), &compressed[..])?;
                let mut out = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
                out.push(TAG_SECRET);
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&sealed);
                Ok(out.into())
            }
        }
    }

    /// Open a storage envelope and verify its content against the expected
    /// id. The manifest is stored at a fixed id which is not a content hash,
    /// so its id is not passed in for verification.
    pub fn decrypt(&self, id: Option<&ChunkId>, data: &[u8]) -> Result<Bytes, Error> {
        let plain = match (self, data.split_first()) {
            (Self::Plaintext, Some((&TAG_PLAINTEXT, payload))) => zstd::decode_all(payload)?,
            (Self::Secret(key), Some((&TAG_SECRET, payload))) => {
                if payload.len() < NONCE_LEN {
                    return Err(Error::Crypto);
                }
                let (nonce, sealed) = payload.split_at(NONCE_LEN);
                let cipher = XChaCha20Poly1305::new((&key.enc_key).into());
                let compressed = cipher.decrypt(XNonce::from_slice(nonce), sealed)?;
                zstd::decode_all(&compressed[..])?
            }
            _ => return Err(Error::Crypto),
        };
        if let Some(id) = id {
            if self.id_hash(&plain) != *id {
                return Err(Error::Crypto);
            }
        }
        Ok(plain.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = Key::generate();
        let data = b"some plaintext data".as_slice();
        let id = key.id_hash(data);
        let sealed = key.encrypt(data).unwrap();
        assert_eq!(sealed[0], TAG_SECRET);
        let plain = key.decrypt(Some(&id), &sealed).unwrap();
        assert_eq!(&plain[..], data);
    }

    #[test]
    fn plaintext_round_trip() {
        let key = Key::Plaintext;
        let data = b"other data".as_slice();
        let sealed = key.encrypt(data).unwrap();
        assert_eq!(sealed[0], TAG_PLAINTEXT);
        let plain = key.decrypt(Some(&key.id_hash(data)), &sealed).unwrap();
        assert_eq!(&plain[..], data);
    }

    #[test]
    fn tampering_is_detected() {
        let key = Key::generate();
        let data = b"precious".as_slice();
        let id = key.id_hash(data);
        let sealed = key.encrypt(data).unwrap();
        let mut broken = sealed.to_vec();
        let last = broken.len() - 1;
        broken[last] ^= 0x01;
        assert!(matches!(
            key.decrypt(Some(&id), &broken),
            Err(Error::Crypto)
        ));
    }

    #[test]
    fn wrong_id_is_detected() {
        let key = Key::generate();
        let sealed = key.encrypt(b"payload").unwrap();
        let wrong = key.id_hash(b"other payload");
        assert!(matches!(
            key.decrypt(Some(&wrong), &sealed),
            Err(Error::Crypto)
        ));
        assert!(key.decrypt(None, &sealed).is_ok());
    }

    #[test]
    fn keyed_id_hash_differs_between_keys() {
        let key1 = Key::generate();
        let key2 = Key::generate();
        assert_ne!(key1.id_hash(b"data"), key2.id_hash(b"data"));
    }

    #[test]
    fn keyfile_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        let key = Key::generate();
        key.save(&path).unwrap();
        let loaded = Key::load(&path).unwrap();
        assert_eq!(key.chunk_seed(), loaded.chunk_seed());
        assert_eq!(key.id_hash(b"data"), loaded.id_hash(b"data"));
        let sealed = key.encrypt(b"data").unwrap();
        assert_eq!(&loaded.decrypt(None, &sealed).unwrap()[..], b"data");
    }

    #[test]
    fn detect_dispatches_on_envelope_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        let key = Key::generate();
        key.save(&path).unwrap();
        let sealed = key.encrypt(b"sample").unwrap();
        let detected = Key::detect(&path, &sealed).unwrap();
        assert!(matches!(detected, Key::Secret(_)));

        let plain = Key::Plaintext.encrypt(b"sample").unwrap();
        let detected = Key::detect(&path, &plain).unwrap();
        assert!(matches!(detected, Key::Plaintext));

        assert!(matches!(
            Key::detect(&path, &[0x77, 1, 2]),
            Err(Error::UnknownKeyType(0x77))
        ));
    }
}
