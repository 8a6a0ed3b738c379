//! Field-level encryption for sensitive identity values.
//!
//! # Formats
//!
//! Two encodings are understood, modeled explicitly by [`EncodedField`]:
//!
//! * **Current** -- `hex(iv):hex(ciphertext)`. A fresh 16-byte IV is drawn for
//!   every call, so encrypting the same value twice yields different strings.
//!   The AES-256 key is derived from the configured passphrase with
//!   HKDF-SHA256.
//!
//! * **Legacy** -- `hex(ciphertext)` with no IV. Values written before IVs
//!   were stored. Both the key and the IV come from a fixed SHA-256 derivation
//!   of the passphrase. These are only ever decrypted; new values always use
//!   the current format.
//!
//! Both formats use AES-256-CBC with PKCS#7 padding.
//!
//! Equality lookups use [`FieldCipher::hash`], an HMAC-SHA256 keyed with a
//! separate HKDF-derived key, so identifiers can be matched without storing
//! plaintext.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{KycError, KycResult};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Placeholder shown instead of a value that cannot be decrypted.
pub const ENCRYPTED_PLACEHOLDER: &str = "[ENCRYPTED]";

const IV_SIZE: usize = 16;
const BLOCK_SIZE: usize = 16;
const KEY_SALT: &[u8] = b"kycverify:field-cipher:v1";
const LABEL_ENCRYPTION_KEY: &[u8] = b"field-encryption";
const LABEL_HASH_KEY: &[u8] = b"field-hash";
const LABEL_LEGACY_IV: &[u8] = b"kycverify:legacy-iv";

/// A decoded ciphertext, tagged by the format it was written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedField {
    /// `iv:ciphertext`, the format written today.
    Current {
        /// Initialization vector.
        iv: [u8; IV_SIZE],
        /// AES-256-CBC ciphertext.
        ciphertext: Vec<u8>,
    },
    /// Bare ciphertext written before IVs were stored.
    Legacy {
        /// AES-256-CBC ciphertext.
        ciphertext: Vec<u8>,
    },
}

impl EncodedField {
    /// Parses an encoded string into its format variant.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::Decryption`] if the string matches neither format.
    pub fn parse(encoded: &str) -> KycResult<Self> {
        let encoded = encoded.trim();
        if let Some((iv_hex, ct_hex)) = encoded.split_once(':') {
            let iv_bytes = hex::decode(iv_hex)
                .map_err(|e| KycError::Decryption(format!("invalid iv encoding: {e}")))?;
            let iv: [u8; IV_SIZE] = iv_bytes.try_into().map_err(|bytes: Vec<u8>| {
                KycError::Decryption(format!(
                    "iv length mismatch: expected {IV_SIZE}, got {}",
                    bytes.len()
                ))
            })?;
            let ciphertext = decode_ciphertext(ct_hex)?;
            return Ok(Self::Current { iv, ciphertext });
        }
        let ciphertext = decode_ciphertext(encoded)?;
        Ok(Self::Legacy { ciphertext })
    }

    /// Renders the value back into its string form.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Current { iv, ciphertext } => {
                format!("{}:{}", hex::encode(iv), hex::encode(ciphertext))
            }
            Self::Legacy { ciphertext } => hex::encode(ciphertext),
        }
    }
}

fn decode_ciphertext(ct_hex: &str) -> KycResult<Vec<u8>> {
    let ciphertext = hex::decode(ct_hex)
        .map_err(|e| KycError::Decryption(format!("invalid ciphertext encoding: {e}")))?;
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(KycError::Decryption(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            ciphertext.len()
        )));
    }
    Ok(ciphertext)
}

/// Heuristic check for values that are already encrypted.
///
/// Matches `hex:hex` with a 16-byte IV, or a pure hex string of at least two
/// blocks (the legacy format). Typical names, PANs and Aadhaar numbers never
/// match.
#[must_use]
pub fn looks_encrypted(text: &str) -> bool {
    let is_hex = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit());
    let text = text.trim();
    if let Some((iv, ct)) = text.split_once(':') {
        return iv.len() == IV_SIZE * 2
            && is_hex(iv)
            && is_hex(ct)
            && ct.len() % (BLOCK_SIZE * 2) == 0;
    }
    text.len() >= BLOCK_SIZE * 2 && text.len() % (BLOCK_SIZE * 2) == 0 && is_hex(text)
}

/// Symmetric cipher for individual string fields.
///
/// Holds only derived key material; the passphrase itself is not retained.
pub struct FieldCipher {
    encryption_key: Zeroizing<[u8; 32]>,
    hash_mac: HmacSha256,
    legacy_key: Zeroizing<[u8; 32]>,
    legacy_iv: [u8; IV_SIZE],
}

impl FieldCipher {
    /// Derives the cipher keys from a passphrase.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::Configuration`] if the passphrase is empty.
    pub fn new(passphrase: &SecretString) -> KycResult<Self> {
        let passphrase = passphrase.expose_secret().as_bytes();
        if passphrase.is_empty() {
            return Err(KycError::Configuration(
                "field cipher passphrase is not configured".to_string(),
            ));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(KEY_SALT), passphrase);
        let mut encryption_key = Zeroizing::new([0u8; 32]);
        hkdf.expand(LABEL_ENCRYPTION_KEY, &mut *encryption_key)
            .map_err(|e| KycError::Configuration(format!("key derivation failed: {e}")))?;
        let mut hash_key = Zeroizing::new([0u8; 32]);
        hkdf.expand(LABEL_HASH_KEY, &mut *hash_key)
            .map_err(|e| KycError::Configuration(format!("key derivation failed: {e}")))?;
        let hash_mac = <HmacSha256 as Mac>::new_from_slice(&*hash_key)
            .map_err(|e| KycError::Configuration(format!("hash key rejected: {e}")))?;

        let mut legacy_key = Zeroizing::new([0u8; 32]);
        legacy_key.copy_from_slice(&Sha256::digest(passphrase));
        let mut legacy_iv_hasher = Sha256::new();
        legacy_iv_hasher.update(LABEL_LEGACY_IV);
        legacy_iv_hasher.update(passphrase);
        let mut legacy_iv = [0u8; IV_SIZE];
        legacy_iv.copy_from_slice(&legacy_iv_hasher.finalize()[..IV_SIZE]);

        Ok(Self {
            encryption_key,
            hash_mac,
            legacy_key,
            legacy_iv,
        })
    }

    /// Encrypts a value into the current `iv:ciphertext` format.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::InvalidInput`] if `plaintext` is empty.
    pub fn encrypt(&self, plaintext: &str) -> KycResult<String> {
        if plaintext.is_empty() {
            return Err(KycError::invalid_input("plaintext", "cannot encrypt an empty value"));
        }
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = Aes256CbcEnc::new(&(*self.encryption_key).into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        Ok(EncodedField::Current { iv, ciphertext }.encode())
    }

    /// Encrypts `text` unless it already looks encrypted.
    ///
    /// # Errors
    ///
    /// See [`FieldCipher::encrypt`].
    pub fn encrypt_if_needed(&self, text: &str) -> KycResult<String> {
        if looks_encrypted(text) {
            return Ok(text.to_string());
        }
        self.encrypt(text)
    }

    /// Encrypts a value in the legacy no-IV format.
    ///
    /// Only used to produce fixtures for values written by older deployments.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::InvalidInput`] if `plaintext` is empty.
    pub fn encrypt_legacy(&self, plaintext: &str) -> KycResult<String> {
        if plaintext.is_empty() {
            return Err(KycError::invalid_input("plaintext", "cannot encrypt an empty value"));
        }
        let ciphertext = Aes256CbcEnc::new(&(*self.legacy_key).into(), &self.legacy_iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        Ok(EncodedField::Legacy { ciphertext }.encode())
    }

    /// Decrypts a value written in either format.
    ///
    /// # Errors
    ///
    /// Returns [`KycError::Decryption`] on malformed input or a key mismatch.
    pub fn decrypt(&self, encoded: &str) -> KycResult<String> {
        let plaintext = match EncodedField::parse(encoded)? {
            EncodedField::Current { iv, ciphertext } => {
                Aes256CbcDec::new(&(*self.encryption_key).into(), &iv.into())
                    .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            }
            EncodedField::Legacy { ciphertext } => {
                Aes256CbcDec::new(&(*self.legacy_key).into(), &self.legacy_iv.into())
                    .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            }
        }
        .map_err(|_| KycError::Decryption("bad padding (wrong key?)".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| KycError::Decryption("plaintext is not valid utf-8".to_string()))
    }

    /// Decrypts for display, substituting [`ENCRYPTED_PLACEHOLDER`] on failure.
    #[must_use]
    pub fn decrypt_for_display(&self, encoded: &str) -> String {
        match self.decrypt(encoded) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                tracing::warn!(error = %err, "field could not be decrypted for display");
                ENCRYPTED_PLACEHOLDER.to_string()
            }
        }
    }

    /// One-way keyed digest of `text`, hex encoded.
    #[must_use]
    pub fn hash(&self, text: &str) -> String {
        hex::encode(self.mac(text))
    }

    /// Checks `text` against a digest produced by [`FieldCipher::hash`].
    #[must_use]
    pub fn compare_hash(&self, text: &str, hash: &str) -> bool {
        let Ok(expected) = hex::decode(hash.trim()) else {
            return false;
        };
        self.mac(text).as_slice().ct_eq(&expected).into()
    }

    fn mac(&self, text: &str) -> [u8; 32] {
        let mut mac = self.hash_mac.clone();
        mac.update(text.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}
