//! The user table behind the login and registration forms.
//!
//! Passwords are never stored, only their bcrypt hashes. Access is bounded by a counting
//! semaphore, so at most `pool_size` workers hash or verify at the same time.

use bcrypt;

use toml;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, RwLock};

use config::CredentialConfig;
use error::{Error, Result};

/// Something that can check a login or record a registration.
pub trait CredentialStore: Send + Sync {
    /// For a login, true if the user exists and the password matches. For a registration, true
    /// if the name was free and is now taken.
    fn verify_or_register(&self, username: &str, password: &str, is_login: bool) -> bool;
}

/// On-disk layout of the user table.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct UserFile {
    users: BTreeMap<String, String>,
}

/// Counting semaphore handing out RAII permits.
#[derive(Debug)]
struct Permits {
    free: Mutex<usize>,
    available: Condvar,
}

struct Permit<'a> {
    permits: &'a Permits,
}

impl Permits {
    fn new(count: usize) -> Self {
        Permits {
            free: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) -> Result<Permit> {
        let mut free = self.free.lock()?;
        while *free == 0 {
            free = self.available.wait(free)?;
        }
        *free -= 1;
        Ok(Permit { permits: self })
    }

    #[cfg(test)]
    fn free(&self) -> usize {
        self.free.lock().map(|free| *free).unwrap_or(0)
    }
}

impl<'a> Drop for Permit<'a> {
    fn drop(&mut self) {
        if let Ok(mut free) = self.permits.free.lock() {
            *free += 1;
        }
        self.permits.available.notify_one();
    }
}

/// A credential store holding bcrypt hashes in memory, optionally persisted to a TOML file.
#[derive(Debug)]
pub struct UserTable {
    users: RwLock<BTreeMap<String, String>>,
    permits: Permits,
    path: Option<PathBuf>,
    cost: u32,
}

impl UserTable {
    /// An empty table that lives in memory only.
    pub fn new(pool_size: usize, cost: u32) -> Self {
        UserTable {
            users: RwLock::new(BTreeMap::new()),
            permits: Permits::new(pool_size),
            path: None,
            cost,
        }
    }

    /// Build the table described by the config, loading the user file if there is one. A missing
    /// file is treated as an empty table and created on the first registration.
    pub fn open(config: &CredentialConfig) -> Result<Self> {
        let mut table = UserTable::new(config.pool_size, config.bcrypt_cost);
        if let Some(ref path) = config.path {
            let users = throw!(load(path));
            info!("Loaded {} users from {:?}", users.len(), path);
            table.users = RwLock::new(users);
            table.path = Some(path.clone());
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.users.read().map(|users| users.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn login(&self, username: &str, password: &str) -> Result<bool> {
        let hash = match self.users.read()?.get(username) {
            Some(hash) => hash.clone(),
            None => return Ok(false),
        };
        match bcrypt::verify(password, &hash) {
            Ok(matches) => Ok(matches),
            Err(e) => {
                warn!("Stored hash for {} is unusable: {}", username, e);
                Ok(false)
            }
        }
    }

    fn register(&self, username: &str, password: &str) -> Result<bool> {
        if self.users.read()?.contains_key(username) {
            return Ok(false);
        }
        // hash outside the write lock, it is the slow part
        let hash = match bcrypt::hash(password, self.cost) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Could not hash password for {}: {}", username, e);
                return Ok(false);
            }
        };

        let mut users = self.users.write()?;
        if users.contains_key(username) {
            return Ok(false);
        }
        users.insert(username.to_owned(), hash);
        if let Some(ref path) = self.path {
            throw!(save(path, &users));
        }
        Ok(true)
    }
}

impl CredentialStore for UserTable {
    fn verify_or_register(&self, username: &str, password: &str, is_login: bool) -> bool {
        if username.is_empty() || password.is_empty() {
            return false;
        }

        let outcome = self.permits.acquire().and_then(|_permit| {
            if is_login {
                self.login(username, password)
            } else {
                self.register(username, password)
            }
        });

        match outcome {
            Ok(true) => {
                debug!("{} succeeded for {}", action(is_login), username);
                true
            }
            Ok(false) => {
                debug!("{} refused for {}", action(is_login), username);
                false
            }
            Err(e) => {
                warn!("{} failed for {}: {}", action(is_login), username, e);
                false
            }
        }
    }
}

fn action(is_login: bool) -> &'static str {
    if is_login {
        "Login"
    } else {
        "Registration"
    }
}

fn load(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(ref e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(Error::Io(e)),
    };
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    let contents: UserFile = toml::from_slice(&buffer[..])?;
    Ok(contents.users)
}

fn save(path: &Path, users: &BTreeMap<String, String>) -> Result<()> {
    let contents = UserFile {
        users: users.clone(),
    };
    let serialized = toml::to_string(&contents)?;
    fs::write(path, serialized)?;
    Ok(())
}
