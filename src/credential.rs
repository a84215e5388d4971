//! Retrieval and decryption of the generated Windows administrator password.
//!
//! The provider publishes the password encrypted to the instance key pair,
//! base64 encoded, some time after boot. The blob is polled until it appears
//! and then decrypted exactly once with the private half of the key pair.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use camino::Utf8Path;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::pacing::{Pacing, Phase};
use crate::util::read_to_string_ambient;

/// Plaintext administrator password. Zeroed on drop, never printed.
#[derive(Clone, Eq, PartialEq)]
pub struct AdminPassword(Zeroizing<String>);

impl AdminPassword {
    /// Wraps a plaintext password.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrows the plaintext.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for AdminPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdminPassword(<redacted>)")
    }
}

/// Errors raised while retrieving the administrator password.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CredentialError {
    /// No identity file was configured.
    #[error("Cannot find SSH Identity file, required to fetch dynamically generated password")]
    MissingIdentityFile,
    /// The identity file could not be read.
    #[error("failed to read identity file {path}: {message}")]
    ReadIdentity {
        /// Identity file path.
        path: String,
        /// I/O error message.
        message: String,
    },
    /// The identity file is not an RSA private key.
    #[error("identity file {path} is not a usable RSA private key: {message}")]
    InvalidKey {
        /// Identity file path.
        path: String,
        /// Parser error message.
        message: String,
    },
    /// The password blob is not valid base64.
    #[error("password data is not valid base64: {message}")]
    Encoding {
        /// Decoder error message.
        message: String,
    },
    /// The blob could not be decrypted with the key.
    #[error("failed to decrypt password data: {message}")]
    Decrypt {
        /// Decryption error message.
        message: String,
    },
    /// A control-plane call failed.
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

/// Parses a PEM private key in PKCS#1 or PKCS#8 form.
///
/// # Errors
///
/// Returns the PKCS#1 parser message when neither form parses.
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, String> {
    RsaPrivateKey::from_pkcs1_pem(pem).or_else(|pkcs1_err| {
        RsaPrivateKey::from_pkcs8_pem(pem).map_err(|_| pkcs1_err.to_string())
    })
}

/// Reads and parses the private key at `path`.
///
/// # Errors
///
/// Returns [`CredentialError::ReadIdentity`] or
/// [`CredentialError::InvalidKey`].
pub fn load_private_key(path: &Utf8Path) -> Result<RsaPrivateKey, CredentialError> {
    let pem = Zeroizing::new(read_to_string_ambient(path).map_err(|err| {
        CredentialError::ReadIdentity {
            path: path.to_string(),
            message: err.to_string(),
        }
    })?);
    parse_private_key(&pem).map_err(|message| CredentialError::InvalidKey {
        path: path.to_string(),
        message,
    })
}

/// Decodes and decrypts a base64 PKCS#1 v1.5 password blob.
///
/// Whitespace inside the blob is ignored.
///
/// # Errors
///
/// Returns [`CredentialError::Encoding`] or [`CredentialError::Decrypt`].
pub fn decrypt_password(key: &RsaPrivateKey, blob: &str) -> Result<AdminPassword, CredentialError> {
    let compact = blob
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>();
    let ciphertext = STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| CredentialError::Encoding {
            message: err.to_string(),
        })?;
    let plaintext = Zeroizing::new(key.decrypt(Pkcs1v15Encrypt, &ciphertext).map_err(|err| {
        CredentialError::Decrypt {
            message: err.to_string(),
        }
    })?);
    let text = std::str::from_utf8(&plaintext).map_err(|err| CredentialError::Decrypt {
        message: err.to_string(),
    })?;
    Ok(AdminPassword::new(text))
}

/// Polls for the encrypted password and decrypts it once it appears.
#[derive(Debug)]
pub struct CredentialRetriever<'a, C: ?Sized> {
    control_plane: &'a C,
    pacing: &'a Pacing,
    interval: Duration,
}

impl<'a, C> CredentialRetriever<'a, C>
where
    C: ControlPlane + ?Sized,
{
    /// Creates a retriever that sleeps `interval` while the blob is absent.
    #[must_use]
    pub const fn new(control_plane: &'a C, pacing: &'a Pacing, interval: Duration) -> Self {
        Self {
            control_plane,
            pacing,
            interval,
        }
    }

    /// Waits for the password of `instance_id` and decrypts it with the key
    /// in `identity_file`.
    ///
    /// The key is loaded before polling starts so a bad key fails fast.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::MissingIdentityFile`] without polling when
    /// no identity file is given, key loading errors, decryption errors, and
    /// non-retryable control-plane errors.
    pub async fn retrieve(
        &self,
        instance_id: &str,
        identity_file: Option<&Utf8Path>,
    ) -> Result<AdminPassword, CredentialError> {
        let path = identity_file.ok_or(CredentialError::MissingIdentityFile)?;
        let key = load_private_key(path)?;

        let phase = Phase::Credential;
        let progress = self.pacing.progress();
        progress.phase_started(phase);
        loop {
            progress.attempt(phase);
            match self.control_plane.password_data(instance_id).await {
                Ok(Some(blob)) if !blob.trim().is_empty() => {
                    progress.phase_finished(phase);
                    let password = decrypt_password(&key, &blob)?;
                    info!(instance_id, "administrator password retrieved");
                    return Ok(password);
                }
                Ok(_) => debug!(instance_id, "password data not available yet"),
                Err(err) if err.is_retryable() => {
                    debug!(instance_id, error = %err, "password data not visible yet");
                }
                Err(err) => return Err(err.into()),
            }
            self.pacing.pause(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use camino::Utf8PathBuf;
    use rsa::RsaPublicKey;
    use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};

    use super::*;
    use crate::test_support::{FakeControlPlane, RecordingProgress, RecordingSleeper};

    struct KeyFixture {
        _dir: tempfile::TempDir,
        path: Utf8PathBuf,
        public: RsaPublicKey,
    }

    fn key_fixture() -> KeyFixture {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).expect("generate key");
        let pem = private.to_pkcs1_pem(LineEnding::LF).expect("encode key");
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("id_rsa")).expect("utf8 path");
        std::fs::write(&path, pem.as_bytes()).expect("write key");
        KeyFixture {
            _dir: dir,
            path,
            public: RsaPublicKey::from(&private),
        }
    }

    fn encrypt(public: &RsaPublicKey, plaintext: &str) -> String {
        let ciphertext = public
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, plaintext.as_bytes())
            .expect("encrypt");
        STANDARD.encode(ciphertext)
    }

    #[tokio::test]
    async fn polls_past_empty_blobs_and_decrypts_once_present() {
        let fixture = key_fixture();
        let plane = FakeControlPlane::new();
        plane.push_password_blob(Some(String::new()));
        plane.push_password_blob(None);
        plane.push_password_blob(Some(encrypt(&fixture.public, "Tr0ub4dor&3")));
        let sleeper = RecordingSleeper::new();
        let pacing = Pacing::new(Arc::new(sleeper.clone()), Arc::new(RecordingProgress::new()));

        let password = CredentialRetriever::new(&plane, &pacing, Duration::from_secs(1000))
            .retrieve("i-win", Some(&fixture.path))
            .await
            .expect("password should decrypt");

        assert_eq!(password.expose(), "Tr0ub4dor&3");
        assert_eq!(plane.password_polls(), 3);
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(1000); 2]);
    }

    #[tokio::test]
    async fn missing_identity_file_fails_before_polling() {
        let plane = FakeControlPlane::new();
        let pacing = Pacing::new(
            Arc::new(RecordingSleeper::new()),
            Arc::new(RecordingProgress::new()),
        );

        let result = CredentialRetriever::new(&plane, &pacing, Duration::from_secs(1))
            .retrieve("i-win", None)
            .await;

        assert_eq!(result, Err(CredentialError::MissingIdentityFile));
        assert_eq!(plane.password_polls(), 0);
    }

    #[test]
    fn corrupt_ciphertext_is_fatal() {
        let fixture = key_fixture();
        let key = load_private_key(&fixture.path).expect("key should load");

        let result = decrypt_password(&key, "bm90IGEgY2lwaGVydGV4dA==");
        assert!(matches!(result, Err(CredentialError::Decrypt { .. })), "{result:?}");
    }

    #[test]
    fn blob_whitespace_is_ignored() {
        let fixture = key_fixture();
        let key = load_private_key(&fixture.path).expect("key should load");
        let blob = encrypt(&fixture.public, "hunter2");
        let (head, tail) = blob.split_at(20);

        let password = decrypt_password(&key, &format!("\n{head}\r\n{tail}\n")).expect("decrypt");
        assert_eq!(password.expose(), "hunter2");
    }

    #[test]
    fn malformed_key_is_reported_with_path() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("id_rsa")).expect("utf8 path");
        std::fs::write(&path, "not a key").expect("write");

        let err = load_private_key(&path).expect_err("garbage must not parse");
        assert!(matches!(err, CredentialError::InvalidKey { .. }), "{err}");
    }

    #[test]
    fn debug_output_redacts_password() {
        let password = AdminPassword::new("s3cret");
        assert_eq!(format!("{password:?}"), "AdminPassword(<redacted>)");
    }
}
