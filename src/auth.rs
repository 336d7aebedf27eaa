//! Authorized principals registry.
//!
//! The authorized file holds one entry per line:
//!
//! ```text
//! <address-or-pubkey> [uid] [gid]
//! ```
//!
//! A first token containing `.` is matched against the full sender address,
//! anything else against the sender's public key (the part after the last
//! `.`). Optional uid/gid are applied to every process spawned for that
//! principal. A line with a malformed uid or gid is skipped with an error log;
//! the rest of the file still loads.
//!
//! The parsed list lives behind an `Arc` that is swapped wholesale on reload,
//! so lookups in flight keep reading the list they started with.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tracing::{error, info, warn};

/// What an entry matches a sender against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Full address, e.g. `device1.abcd1234`.
    Address(String),
    /// Bare public key, matched against the address suffix.
    PublicKey(String),
}

/// One authorized principal with optional credential overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationEntry {
    pub matcher: Matcher,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl AuthorizationEntry {
    fn matches(&self, address: &str, public_key: &str) -> bool {
        match &self.matcher {
            Matcher::Address(a) => a == address,
            Matcher::PublicKey(pk) => pk == public_key,
        }
    }
}

/// Public-key suffix of an address: everything after the last `.`.
pub fn public_key_of(address: &str) -> &str {
    address.rsplit('.').next().unwrap_or(address)
}

/// Parse the authorized file contents. Blank lines are ignored.
pub fn parse(text: &str) -> Vec<AuthorizationEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            continue;
        };

        let matcher = if first.contains('.') {
            Matcher::Address(first.to_string())
        } else {
            Matcher::PublicKey(first.to_string())
        };

        let uid = match tokens.next().map(str::parse::<u32>) {
            None => None,
            Some(Ok(uid)) => Some(uid),
            Some(Err(_)) => {
                error!("Error parsing uid in authorized line {line:?}");
                continue;
            }
        };

        let gid = match tokens.next().map(str::parse::<u32>) {
            None => None,
            Some(Ok(gid)) => Some(gid),
            Some(Err(_)) => {
                error!("Error parsing gid in authorized line {line:?}");
                continue;
            }
        };

        entries.push(AuthorizationEntry { matcher, uid, gid });
    }
    entries
}

/// Hot-reloadable list of authorized principals.
///
/// Cloneable; all clones share the same list.
#[derive(Clone)]
pub struct AuthorizationRegistry {
    path: PathBuf,
    entries: Arc<RwLock<Arc<Vec<AuthorizationEntry>>>>,
}

impl AuthorizationRegistry {
    /// Registry bound to `path`, initially empty.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Arc::new(RwLock::new(Arc::new(Vec::new()))),
        }
    }

    /// Create the registry and perform the initial load. A missing file is
    /// created empty so it can be edited in place and picked up by the watcher.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let registry = Self::new(path);
        if !registry.path.exists() {
            std::fs::write(&registry.path, "")?;
            info!(
                "Create authorized pubkeys file {}",
                registry.path.display()
            );
        }
        registry.load()?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the file, replacing the current list.
    pub fn load(&self) -> std::io::Result<usize> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(self.replace(parse(&text)))
    }

    /// Re-read the file after a change notification. On failure the previous
    /// list stays in effect.
    pub fn reload(&self) {
        info!("Reload authorized pubkeys file");
        match self.load() {
            Ok(n) => info!("Loaded {n} authorized entries"),
            Err(e) => error!(
                "Failed to reload {}: {e}, keeping previous list",
                self.path.display()
            ),
        }
    }

    /// Swap in a new list. Returns the number of entries.
    pub fn replace(&self, entries: Vec<AuthorizationEntry>) -> usize {
        let n = entries.len();
        let new = Arc::new(entries);
        match self.entries.write() {
            Ok(mut guard) => *guard = new,
            Err(poisoned) => *poisoned.into_inner() = new,
        }
        n
    }

    /// Current list snapshot.
    pub fn snapshot(&self) -> Arc<Vec<AuthorizationEntry>> {
        match self.entries.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// First entry matching `principal` by full address or public-key suffix.
    pub fn lookup(&self, principal: &str) -> Option<AuthorizationEntry> {
        let pk = public_key_of(principal);
        self.snapshot()
            .iter()
            .find(|e| e.matches(principal, pk))
            .cloned()
    }

    /// Poll the file every `interval` and reload when its modification time
    /// or length changes.
    pub fn watch(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut last = file_stamp(&registry.path);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stamp = file_stamp(&registry.path);
                if stamp != last {
                    if stamp.is_none() {
                        warn!(
                            "Authorized file {} disappeared, keeping previous list",
                            registry.path.display()
                        );
                    } else {
                        registry.reload();
                    }
                    last = stamp;
                }
            }
        })
    }
}

fn file_stamp(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}
