//! Archive encryption at rest
//!
//! The key is derived with PBKDF2-HMAC-SHA256 from a passphrase obtained
//! through [`CredentialLookup`]. Archives are sealed with XChaCha20-Poly1305
//! in STREAM mode so arbitrarily large files are processed in fixed-size
//! frames, each authenticated, with the final frame flagged to detect
//! truncation.
//!
//! File layout: `HSBKENC1` magic, 19-byte stream nonce, then frames of
//! `FRAME_SIZE + 16` bytes, the last one shorter.

use crate::config::{EncryptionConfig, MIN_KDF_ITERATIONS};
use crate::credentials::CredentialLookup;
use crate::{Error, Result};
use chacha20poly1305::aead::rand_core::RngCore;
use chacha20poly1305::aead::stream::{DecryptorBE32, EncryptorBE32};
use chacha20poly1305::aead::{KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305};
use sha2::Sha256;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub const MAGIC: &[u8; 8] = b"HSBKENC1";
pub const STREAM_NONCE_SIZE: usize = 19;
pub const FRAME_SIZE: usize = 64 * 1024;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;

/// Derive the archive key from a passphrase
pub fn derive_key(secret: &str, salt: &[u8], iterations: u32) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if iterations < MIN_KDF_ITERATIONS {
        return Err(Error::Encryption {
            reason: format!(
                "PBKDF2 needs at least {} iterations, got {}",
                MIN_KDF_ITERATIONS, iterations
            ),
        });
    }
    if salt.is_empty() {
        return Err(Error::Encryption {
            reason: "empty KDF salt".to_string(),
        });
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, iterations, key.as_mut_slice());
    Ok(key)
}

/// Encrypts and decrypts backup archives
pub struct EncryptionManager {
    key: Option<Zeroizing<[u8; KEY_SIZE]>>,
}

impl fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("available", &self.key.is_some())
            .finish()
    }
}

impl EncryptionManager {
    /// Manager with a key derived from `secret`
    pub fn with_secret(secret: &str, salt: &[u8], iterations: u32) -> Result<Self> {
        Ok(Self {
            key: Some(derive_key(secret, salt, iterations)?),
        })
    }

    /// Manager with no key; every archive stays unencrypted
    pub fn unavailable() -> Self {
        Self { key: None }
    }

    /// Resolve the passphrase through `lookup`. A missing secret or disabled
    /// encryption yields an unavailable manager, not an error.
    pub fn from_lookup(lookup: &dyn CredentialLookup, config: &EncryptionConfig) -> Result<Self> {
        if !config.enabled {
            debug!("Encryption disabled in configuration");
            return Ok(Self::unavailable());
        }

        match lookup.get_secret(&config.credential_service) {
            Some(secret) => {
                Self::with_secret(&secret, config.salt.as_bytes(), config.kdf_iterations)
            }
            None => {
                warn!(
                    service = %config.credential_service,
                    "No encryption secret available, archives will not be encrypted"
                );
                Ok(Self::unavailable())
            }
        }
    }

    pub fn is_encryption_available(&self) -> bool {
        self.key.is_some()
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305> {
        let key = self.key.as_ref().ok_or_else(|| Error::Encryption {
            reason: "encryption key not available".to_string(),
        })?;
        Ok(XChaCha20Poly1305::new(Key::from_slice(key.as_slice())))
    }

    /// Encrypt everything from `reader` into `writer`
    pub fn encrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let cipher = self.cipher()?;

        let mut nonce = [0u8; STREAM_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        writer.write_all(MAGIC)?;
        writer.write_all(&nonce)?;

        let mut encryptor = EncryptorBE32::from_aead(cipher, nonce.as_slice().into());
        let mut buffer = vec![0u8; FRAME_SIZE];
        let mut plaintext_len = 0u64;

        loop {
            let read = read_full(&mut reader, &mut buffer)?;
            plaintext_len += read as u64;

            if read == FRAME_SIZE {
                let frame = encryptor
                    .encrypt_next(buffer.as_slice())
                    .map_err(|_| encryption_failed())?;
                writer.write_all(&frame)?;
            } else {
                let frame = encryptor
                    .encrypt_last(&buffer[..read])
                    .map_err(|_| encryption_failed())?;
                writer.write_all(&frame)?;
                break;
            }
        }

        writer.flush()?;
        Ok(plaintext_len)
    }

    /// Decrypt everything from `reader` into `writer`. Output written before
    /// an integrity failure must be discarded by the caller.
    pub fn decrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let cipher = self.cipher()?;

        let mut header = [0u8; MAGIC.len() + STREAM_NONCE_SIZE];
        if read_full(&mut reader, &mut header)? != header.len() || &header[..MAGIC.len()] != MAGIC {
            return Err(Error::IntegrityError {
                reason: "missing or invalid encryption header".to_string(),
            });
        }

        let nonce = &header[MAGIC.len()..];
        let mut decryptor = DecryptorBE32::from_aead(cipher, nonce.into());
        let mut buffer = vec![0u8; FRAME_SIZE + TAG_SIZE];
        let mut plaintext_len = 0u64;

        loop {
            let read = read_full(&mut reader, &mut buffer)?;

            if read == buffer.len() {
                let frame = decryptor
                    .decrypt_next(buffer.as_slice())
                    .map_err(|_| integrity_failed())?;
                plaintext_len += frame.len() as u64;
                writer.write_all(&frame)?;
            } else if read < TAG_SIZE {
                return Err(Error::IntegrityError {
                    reason: "ciphertext truncated".to_string(),
                });
            } else {
                let frame = decryptor
                    .decrypt_last(&buffer[..read])
                    .map_err(|_| integrity_failed())?;
                plaintext_len += frame.len() as u64;
                writer.write_all(&frame)?;
                break;
            }
        }

        writer.flush()?;
        Ok(plaintext_len)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() + 64);
        self.encrypt_stream(Cursor::new(plaintext), &mut out)?;
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(ciphertext.len());
        self.decrypt_stream(Cursor::new(ciphertext), &mut out)?;
        Ok(out)
    }

    /// Encrypt `src` into `dst`; `dst` only appears once complete
    pub fn encrypt_file(&self, src: &Path, dst: &Path) -> Result<u64> {
        let reader = BufReader::new(File::open(src)?);
        write_atomically(dst, |writer| self.encrypt_stream(reader, writer))
    }

    /// Decrypt `src` into `dst`; on any failure `dst` is not created
    pub fn decrypt_file(&self, src: &Path, dst: &Path) -> Result<u64> {
        let reader = BufReader::new(File::open(src)?);
        write_atomically(dst, |writer| self.decrypt_stream(reader, writer))
    }
}

fn encryption_failed() -> Error {
    Error::Encryption {
        reason: "encryption failed".to_string(),
    }
}

fn integrity_failed() -> Error {
    Error::IntegrityError {
        reason: "authentication failed: wrong key or corrupted data".to_string(),
    }
}

fn partial_path(dst: &Path) -> PathBuf {
    let mut name = dst.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}

fn write_atomically<F>(dst: &Path, write: F) -> Result<u64>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<u64>,
{
    let tmp = partial_path(dst);
    let result = File::create(&tmp)
        .map_err(Error::from)
        .and_then(|file| {
            let mut writer = BufWriter::new(file);
            let n = write(&mut writer)?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
            Ok(n)
        })
        .and_then(|n| {
            fs::rename(&tmp, dst)?;
            Ok(n)
        });

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
