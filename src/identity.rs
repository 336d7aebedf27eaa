//! Daemon identity: the wallet holding the signing seed and the address
//! derived from it.
//!
//! The wallet is a small JSON file with the 32-byte seed sealed under
//! ChaCha20-Poly1305, keyed by Argon2id over the wallet password. The password
//! lives in its own file; only its first line is used. On first run both are
//! created.

use std::fmt;
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

const WALLET_VERSION: u32 = 1;
const SEED_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const GENERATED_PASSWORD_LEN: usize = 32;

/// Full bus address for `public_key` under `identifier`.
pub fn make_address(identifier: &str, public_key: &str) -> String {
    if identifier.is_empty() {
        public_key.to_string()
    } else {
        format!("{identifier}.{public_key}")
    }
}

#[derive(Debug)]
pub enum IdentityError {
    Read(String, io::Error),
    Write(String, io::Error),
    Format(String),
    /// Wrong password or corrupted wallet.
    Decrypt,
    Crypto(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::Read(path, e) => write!(f, "failed to read {path}: {e}"),
            IdentityError::Write(path, e) => write!(f, "failed to write {path}: {e}"),
            IdentityError::Format(msg) => write!(f, "invalid wallet: {msg}"),
            IdentityError::Decrypt => {
                write!(f, "failed to decrypt wallet (wrong password?)")
            }
            IdentityError::Crypto(msg) => write!(f, "crypto error: {msg}"),
        }
    }
}

impl std::error::Error for IdentityError {}

#[derive(Serialize, Deserialize)]
struct WalletFile {
    version: u32,
    public_key: String,
    /// Argon2id salt (hex).
    salt: String,
    /// ChaCha20-Poly1305 nonce (hex).
    nonce: String,
    /// Sealed seed (hex).
    ciphertext: String,
}

/// The daemon's key material.
#[derive(Clone)]
pub struct Identity {
    seed: [u8; SEED_LEN],
    public_key: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn generate() -> Self {
        let mut seed = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; SEED_LEN]) -> Self {
        let public_key = hex::encode(Sha256::digest(seed));
        Self { seed, public_key }
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn address(&self, identifier: &str) -> String {
        make_address(identifier, &self.public_key)
    }

    /// Seal the seed under `password` and write the wallet to `path`.
    pub fn save(&self, path: &Path, password: &str) -> Result<(), IdentityError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = wallet_cipher(password, &salt)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), self.seed.as_ref())
            .map_err(|_| IdentityError::Crypto("failed to seal seed".to_string()))?;

        let wallet = WalletFile {
            version: WALLET_VERSION,
            public_key: self.public_key.clone(),
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        };
        let json = serde_json::to_string_pretty(&wallet)
            .map_err(|e| IdentityError::Format(e.to_string()))?;
        write_private(path, &json)
    }

    /// Read and unseal the wallet at `path`.
    pub fn open(path: &Path, password: &str) -> Result<Self, IdentityError> {
        let json = fs::read_to_string(path)
            .map_err(|e| IdentityError::Read(path.display().to_string(), e))?;
        let wallet: WalletFile =
            serde_json::from_str(&json).map_err(|e| IdentityError::Format(e.to_string()))?;
        if wallet.version != WALLET_VERSION {
            return Err(IdentityError::Format(format!(
                "unsupported version {}",
                wallet.version
            )));
        }

        let salt = decode_hex("salt", &wallet.salt)?;
        let nonce_bytes = decode_hex("nonce", &wallet.nonce)?;
        let ciphertext = decode_hex("ciphertext", &wallet.ciphertext)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(IdentityError::Format("invalid nonce length".to_string()));
        }

        let cipher = wallet_cipher(password, &salt)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| IdentityError::Decrypt)?;
        let seed: [u8; SEED_LEN] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::Format("invalid seed length".to_string()))?;

        let identity = Self::from_seed(seed);
        if identity.public_key != wallet.public_key {
            return Err(IdentityError::Format(
                "public key does not match seed".to_string(),
            ));
        }
        Ok(identity)
    }
}

/// Open the wallet at `wallet_path`, creating it (and the password file, if
/// missing) on first run.
pub fn load_or_create(wallet_path: &Path, password_path: &Path) -> Result<Identity, IdentityError> {
    if wallet_path.exists() {
        let password = read_password(password_path)?;
        let identity = Identity::open(wallet_path, &password)?;
        info!(path = %wallet_path.display(), "Loaded wallet");
        return Ok(identity);
    }

    let password = match read_password(password_path) {
        Ok(p) => p,
        Err(IdentityError::Read(_, e)) if e.kind() == io::ErrorKind::NotFound => {
            let password = generate_password();
            write_private(password_path, &password)?;
            info!(path = %password_path.display(), "Generated wallet password");
            password
        }
        Err(e) => return Err(e),
    };

    let identity = Identity::generate();
    identity.save(wallet_path, &password)?;
    info!(path = %wallet_path.display(), "Created new wallet");
    Ok(identity)
}

/// First line of the password file, without the line terminator.
pub fn read_password(path: &Path) -> Result<String, IdentityError> {
    let text =
        fs::read_to_string(path).map_err(|e| IdentityError::Read(path.display().to_string(), e))?;
    Ok(text
        .lines()
        .next()
        .unwrap_or_default()
        .trim_end_matches('\r')
        .to_string())
}

fn generate_password() -> String {
    let mut bytes = [0u8; GENERATED_PASSWORD_LEN];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn wallet_cipher(password: &str, salt: &[u8]) -> Result<ChaCha20Poly1305, IdentityError> {
    let mut key = [0u8; 32];
    argon2::Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| IdentityError::Crypto(format!("argon2 key derivation failed: {e}")))?;
    ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| IdentityError::Crypto("invalid wallet key length".to_string()))
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, IdentityError> {
    hex::decode(value).map_err(|e| IdentityError::Format(format!("{field}: {e}")))
}

fn write_private(path: &Path, contents: &str) -> Result<(), IdentityError> {
    let err = |e: io::Error| IdentityError::Write(path.display().to_string(), e);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(err)?;
        }
    }
    fs::write(path, contents).map_err(err)?;
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(err)?;
    Ok(())
}
