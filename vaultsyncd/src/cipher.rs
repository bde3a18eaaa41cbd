use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use vaultsync_core::RemoteItem;

/// Key-encoding scheme markers. Both are recognized on read; only the
/// current one is produced on write.
pub const MAGIC_KEY_PREFIX_V1: &str = "vs1.";
pub const MAGIC_KEY_PREFIX_V2: &str = "vs2.";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption error")]
    Encryption,
    #[error("decryption error")]
    Decryption,
    #[error("remote key does not use a known encryption scheme: {0}")]
    UnknownScheme(String),
}

pub struct PathCipher {
    key: [u8; 32],
}

impl PathCipher {
    pub fn new(password: &str) -> Self {
        Self {
            key: derive_key(password.as_bytes()),
        }
    }

    /// Encrypts a logical path into an opaque remote key, current scheme.
    pub fn encrypt_key(&self, path: &str) -> Result<String, CipherError> {
        let framed = self.seal(path.as_bytes())?;
        Ok(format!(
            "{MAGIC_KEY_PREFIX_V2}{}",
            URL_SAFE_NO_PAD.encode(framed)
        ))
    }

    /// Decrypts a remote key back into a logical path. Accepts both the
    /// legacy and the current encoding scheme.
    pub fn decrypt_key(&self, remote_key: &str) -> Result<String, CipherError> {
        let framed = if let Some(rest) = remote_key.strip_prefix(MAGIC_KEY_PREFIX_V2) {
            URL_SAFE_NO_PAD
                .decode(rest)
                .map_err(|_| CipherError::Decryption)?
        } else if let Some(rest) = remote_key.strip_prefix(MAGIC_KEY_PREFIX_V1) {
            STANDARD
                .decode(rest)
                .map_err(|_| CipherError::Decryption)?
        } else {
            return Err(CipherError::UnknownScheme(remote_key.to_string()));
        };
        let plain = self.open(&framed)?;
        String::from_utf8(plain).map_err(|_| CipherError::Decryption)
    }

    pub fn encrypt_content(&self, content: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.seal(content)
    }

    pub fn decrypt_content(&self, content: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.open(content)
    }

    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| CipherError::Encryption)?;
        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    fn open(&self, framed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if framed.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Decryption);
        }
        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decryption)
    }
}

/// Content size after encryption: nonce plus AEAD tag overhead.
pub fn encrypted_size(plain_size: i64) -> i64 {
    plain_size + (NONCE_LEN + TAG_LEN) as i64
}

pub fn is_encrypted_key(remote_key: &str) -> bool {
    remote_key.starts_with(MAGIC_KEY_PREFIX_V1) || remote_key.starts_with(MAGIC_KEY_PREFIX_V2)
}

/// Decryption with a wrong password can still produce bytes that decode as
/// UTF-8 on some platforms; a decrypted path must additionally look like
/// printable text.
pub fn is_valid_text(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c == '\n' || c == '\t' || (!c.is_control() && c != '\u{fffd}'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordCheckReason {
    EmptyRemote,
    PasswordMatched,
    PasswordNotMatched,
    InvalidTextAfterDecryption,
    RemoteEncryptedLocalNoPassword,
    RemoteNotEncryptedLocalHasPassword,
    NoPasswordBothSides,
}

#[derive(Debug, Clone, Copy)]
pub struct PasswordCheck {
    pub ok: bool,
    pub reason: PasswordCheckReason,
}

/// Pre-flight password validation: try to decrypt a sample remote key and
/// confirm the result is plausible text. Runs before any plan is built so a
/// mismatch never turns into per-file errors.
pub fn check_password(remote: &[RemoteItem], password: &str) -> PasswordCheck {
    let Some(sample) = remote.first() else {
        return PasswordCheck {
            ok: true,
            reason: PasswordCheckReason::EmptyRemote,
        };
    };

    if is_encrypted_key(&sample.key) {
        if password.is_empty() {
            return PasswordCheck {
                ok: false,
                reason: PasswordCheckReason::RemoteEncryptedLocalNoPassword,
            };
        }
        let cipher = PathCipher::new(password);
        return match cipher.decrypt_key(&sample.key) {
            Ok(text) if is_valid_text(&text) => PasswordCheck {
                ok: true,
                reason: PasswordCheckReason::PasswordMatched,
            },
            Ok(_) => PasswordCheck {
                ok: false,
                reason: PasswordCheckReason::InvalidTextAfterDecryption,
            },
            Err(_) => PasswordCheck {
                ok: false,
                reason: PasswordCheckReason::PasswordNotMatched,
            },
        };
    }

    if !password.is_empty() {
        return PasswordCheck {
            ok: false,
            reason: PasswordCheckReason::RemoteNotEncryptedLocalHasPassword,
        };
    }
    PasswordCheck {
        ok: true,
        reason: PasswordCheckReason::NoPasswordBothSides,
    }
}

fn derive_key(secret: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    let digest = Sha256::digest(secret);
    key.copy_from_slice(&digest);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str) -> RemoteItem {
        RemoteItem {
            key: key.to_string(),
            last_modified: 1000,
            size: 1,
            etag: None,
        }
    }

    #[test]
    fn key_roundtrip_uses_current_scheme() {
        let cipher = PathCipher::new("hunter2");
        let remote_key = cipher.encrypt_key("notes/daily.md").unwrap();
        assert!(remote_key.starts_with(MAGIC_KEY_PREFIX_V2));
        assert_eq!(cipher.decrypt_key(&remote_key).unwrap(), "notes/daily.md");
    }

    #[test]
    fn legacy_scheme_is_still_readable() {
        let cipher = PathCipher::new("hunter2");
        let framed = cipher.seal(b"old/path.md").unwrap();
        let legacy = format!("{MAGIC_KEY_PREFIX_V1}{}", STANDARD.encode(framed));
        assert_eq!(cipher.decrypt_key(&legacy).unwrap(), "old/path.md");
    }

    #[test]
    fn wrong_password_fails_to_decrypt() {
        let remote_key = PathCipher::new("right").encrypt_key("a.md").unwrap();
        assert!(matches!(
            PathCipher::new("wrong").decrypt_key(&remote_key),
            Err(CipherError::Decryption)
        ));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let cipher = PathCipher::new("pw");
        assert!(matches!(
            cipher.decrypt_key("plain/key.md"),
            Err(CipherError::UnknownScheme(_))
        ));
    }

    #[test]
    fn content_roundtrip_and_size_overhead() {
        let cipher = PathCipher::new("pw");
        let sealed = cipher.encrypt_content(b"hello").unwrap();
        assert_eq!(sealed.len() as i64, encrypted_size(5));
        assert_eq!(cipher.decrypt_content(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn valid_text_rejects_control_and_replacement_chars() {
        assert!(is_valid_text("notes/daily.md"));
        assert!(is_valid_text("a\tb\nc"));
        assert!(!is_valid_text(""));
        assert!(!is_valid_text("a\u{0000}b"));
        assert!(!is_valid_text("a\u{fffd}b"));
    }

    #[test]
    fn password_check_reasons() {
        assert_eq!(
            check_password(&[], "pw").reason,
            PasswordCheckReason::EmptyRemote
        );
        assert_eq!(
            check_password(&[item("plain.md")], "").reason,
            PasswordCheckReason::NoPasswordBothSides
        );
        assert_eq!(
            check_password(&[item("plain.md")], "pw").reason,
            PasswordCheckReason::RemoteNotEncryptedLocalHasPassword
        );

        let encrypted = PathCipher::new("pw").encrypt_key("a.md").unwrap();
        assert_eq!(
            check_password(&[item(&encrypted)], "").reason,
            PasswordCheckReason::RemoteEncryptedLocalNoPassword
        );
        assert_eq!(
            check_password(&[item(&encrypted)], "pw").reason,
            PasswordCheckReason::PasswordMatched
        );
        assert_eq!(
            check_password(&[item(&encrypted)], "nope").reason,
            PasswordCheckReason::PasswordNotMatched
        );
    }
}
