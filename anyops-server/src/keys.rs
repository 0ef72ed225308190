//! SSH identity store: the server's RSA key pair used to bootstrap
//! agents, plus password encryption for the user records at rest.
//!
//! The same key serves both purposes so an operator only ever has to
//! authorize one public key on the fleet.

use crate::store::Store;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use russh_keys::key::{KeyPair, RsaPrivate, SignatureHash};
use russh_keys::PublicKeyBase64;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const KEY_BITS: usize = 4096;
const PRIVATE_KEY_FILE: &str = "id_rsa";
const PUBLIC_KEY_FILE: &str = "id_rsa.pub";
const KEY_COMMENT: &str = "anyops-mgmt";

#[derive(Clone)]
pub struct IdentityStore {
    dir: PathBuf,
    bits: usize,
    guard: Arc<Mutex<()>>,
}

impl IdentityStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            bits: KEY_BITS,
            guard: Arc::new(Mutex::new(())),
        }
    }

    /// Smaller keys for tests; generation time grows steeply with size.
    #[cfg(test)]
    pub(crate) fn with_key_bits(dir: PathBuf, bits: usize) -> Self {
        Self {
            dir,
            bits,
            guard: Arc::new(Mutex::new(())),
        }
    }

    fn private_path(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    fn public_path(&self) -> PathBuf {
        self.dir.join(PUBLIC_KEY_FILE)
    }

    /// Idempotently makes sure the key pair exists on disk. Losing
    /// either half regenerates both, so the two files always match.
    pub fn ensure_keys(&self) -> Result<()> {
        let _held = self.guard.lock();
        if self.private_path().exists() && self.public_path().exists() {
            return Ok(());
        }
        info!(dir = %self.dir.display(), "generating SSH identity");
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating key directory {}", self.dir.display()))?;

        let key = RsaPrivateKey::new(&mut rand::thread_rng(), self.bits)
            .context("generating RSA key")?;

        let pem = key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .context("encoding private key")?;
        std::fs::write(self.private_path(), pem.as_bytes())
            .with_context(|| format!("writing {}", self.private_path().display()))?;
        set_mode(&self.private_path(), 0o600)?;

        let openssh = openssh_public_line(&key)?;
        std::fs::write(self.public_path(), openssh)
            .with_context(|| format!("writing {}", self.public_path().display()))?;
        set_mode(&self.public_path(), 0o644)?;
        Ok(())
    }

    fn private_key(&self) -> Result<RsaPrivateKey> {
        self.ensure_keys()?;
        let pem = std::fs::read_to_string(self.private_path())
            .with_context(|| format!("reading {}", self.private_path().display()))?;
        RsaPrivateKey::from_pkcs1_pem(&pem).context("parsing private key")
    }

    /// Key pair in the form the SSH client authenticates with.
    pub fn ssh_keypair(&self) -> Result<KeyPair> {
        to_russh(&self.private_key()?)
    }

    /// The authorized_keys line operators install on target nodes.
    pub fn public_key_openssh(&self) -> Result<String> {
        self.ensure_keys()?;
        std::fs::read_to_string(self.public_path())
            .with_context(|| format!("reading {}", self.public_path().display()))
    }

    /// PKIX PEM form of the public key, consumed by the dashboard for
    /// in-browser password encryption before submission.
    pub fn public_key_pkix_pem(&self) -> Result<String> {
        let key = self.private_key()?;
        key.to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .context("encoding public key as PKIX PEM")
    }

    pub fn encrypt_password(&self, plain: &str) -> Result<String> {
        let key = self.private_key()?.to_public_key();
        let cipher = key
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, plain.as_bytes())
            .context("encrypting password")?;
        Ok(BASE64.encode(cipher))
    }

    pub fn decrypt_password(&self, cipher_b64: &str) -> Result<String> {
        let cipher = BASE64.decode(cipher_b64).context("decoding ciphertext")?;
        let plain = self
            .private_key()?
            .decrypt(Pkcs1v15Encrypt, &cipher)
            .context("decrypting password")?;
        String::from_utf8(plain).context("decrypted password is not UTF-8")
    }

    /// Stored and submitted passwords may arrive either encrypted or
    /// as legacy plaintext; whatever fails to decrypt is taken as-is.
    pub fn resolve_password(&self, value: &str) -> String {
        self.decrypt_password(value)
            .unwrap_or_else(|_| value.to_string())
    }
}

/// Re-encrypts any user password the key cannot decrypt, then persists
/// once. Run at startup so legacy plaintext blobs converge without an
/// operator step.
pub fn migrate_plaintext_passwords(store: &Store, ids: &IdentityStore) -> Result<()> {
    let plaintext: Vec<(u64, String)> = store.read(|d| {
        d.users
            .iter()
            .filter(|u| ids.decrypt_password(&u.password).is_err())
            .map(|u| (u.id, u.password.clone()))
            .collect()
    });
    if plaintext.is_empty() {
        return Ok(());
    }
    info!(count = plaintext.len(), "re-encrypting legacy plaintext passwords");
    let mut encrypted = Vec::with_capacity(plaintext.len());
    for (id, plain) in plaintext {
        encrypted.push((id, ids.encrypt_password(&plain)?));
    }
    store.write(
        |d| {
            for (id, cipher) in encrypted {
                if let Some(user) = d.users.iter_mut().find(|u| u.id == id) {
                    user.password = cipher;
                }
            }
        },
        true,
    )?;
    Ok(())
}

/// The rsa crate's key type and russh's are distinct; SSH code paths
/// go through russh's DER-backed wrapper.
fn to_russh(key: &RsaPrivateKey) -> Result<KeyPair> {
    let der = key.to_pkcs1_der().context("encoding private key as DER")?;
    let key = RsaPrivate::new_from_der(der.as_bytes()).context("importing key for SSH")?;
    Ok(KeyPair::RSA {
        key,
        hash: SignatureHash::SHA2_512,
    })
}

fn openssh_public_line(key: &RsaPrivateKey) -> Result<String> {
    // The public-key blob must carry "ssh-rsa" as its inner algorithm
    // name to match the line's leading field; the key-pair form would
    // embed the signature algorithm instead.
    let public = to_russh(key)?
        .clone_public_key()
        .context("deriving public key")?;
    Ok(format!(
        "ssh-rsa {} {}\n",
        public.public_key_base64(),
        KEY_COMMENT
    ))
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting mode on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &std::path::Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(dir: &std::path::Path) -> IdentityStore {
        IdentityStore::with_key_bits(dir.join("keys"), 1024)
    }

    #[test]
    fn ensure_keys_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ids = test_store(dir.path());
        ids.ensure_keys().unwrap();
        let first = std::fs::read(ids.private_path()).unwrap();
        ids.ensure_keys().unwrap();
        assert_eq!(std::fs::read(ids.private_path()).unwrap(), first);
    }

    #[test]
    fn losing_the_public_half_regenerates_both() {
        let dir = tempfile::tempdir().unwrap();
        let ids = test_store(dir.path());
        ids.ensure_keys().unwrap();
        let old_private = std::fs::read(ids.private_path()).unwrap();
        std::fs::remove_file(ids.public_path()).unwrap();
        ids.ensure_keys().unwrap();
        assert!(ids.public_path().exists());
        assert_ne!(std::fs::read(ids.private_path()).unwrap(), old_private);
    }

    #[test]
    fn password_roundtrip_and_plaintext_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let ids = test_store(dir.path());
        let cipher = ids.encrypt_password("s3cret").unwrap();
        assert_ne!(cipher, "s3cret");
        assert_eq!(ids.decrypt_password(&cipher).unwrap(), "s3cret");
        // Anything undecryptable is treated as legacy plaintext.
        assert_eq!(ids.resolve_password("not-base64!?"), "not-base64!?");
        assert_eq!(ids.resolve_password(&cipher), "s3cret");
    }

    #[test]
    fn ssh_keypair_converts_and_matches_the_published_line() {
        let dir = tempfile::tempdir().unwrap();
        let ids = test_store(dir.path());
        let pair = ids.ssh_keypair().unwrap();
        assert!(matches!(pair, KeyPair::RSA { .. }));
        // The authorized_keys line and the auth key pair must describe
        // the same key.
        let line = ids.public_key_openssh().unwrap();
        let b64 = line.split_whitespace().nth(1).unwrap();
        let public = pair.clone_public_key().unwrap();
        assert_eq!(public.public_key_base64(), b64);
    }

    #[test]
    fn public_exports_have_the_expected_framing() {
        let dir = tempfile::tempdir().unwrap();
        let ids = test_store(dir.path());
        assert!(ids.public_key_openssh().unwrap().starts_with("ssh-rsa "));
        assert!(ids
            .public_key_pkix_pem()
            .unwrap()
            .starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn startup_migration_encrypts_seeded_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data.json")).unwrap();
        let ids = test_store(dir.path());
        migrate_plaintext_passwords(&store, &ids).unwrap();
        let stored = store.read(|d| d.users[0].password.clone());
        assert_ne!(stored, "password");
        assert_eq!(ids.decrypt_password(&stored).unwrap(), "password");
        // A second run must be a no-op.
        migrate_plaintext_passwords(&store, &ids).unwrap();
        assert_eq!(store.read(|d| d.users[0].password.clone()), stored);
    }
}
