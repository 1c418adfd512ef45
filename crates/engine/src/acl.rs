//! Role-based access control.
//!
//! The table is small and rarely mutated, so a coarse mutex around a plain
//! map is enough; the lock is never held across I/O. Owners come only from
//! static configuration and cannot be changed through this interface.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

/// Privilege levels, most to least privileged. The derived order follows
/// declaration order, so `Owner < Admin < ... < Denied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Owner,
    Admin,
    Writer,
    Reader,
    Denied,
}

impl Role {
    /// Whether this role may publish events.
    pub fn can_write(&self) -> bool {
        *self <= Role::Writer
    }

    /// Whether this role may read events at all.
    pub fn can_read(&self) -> bool {
        *self <= Role::Reader
    }
}

/// One ACL record.
#[derive(Debug, Clone)]
pub struct AclEntry {
    pub pubkey: String,
    pub role: Role,
    pub created_at: u64,
    pub updated_at: u64,
    /// Entry stops applying at this timestamp; `None` never expires.
    pub expires: Option<u64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AclError {
    #[error("owners are seeded from configuration and cannot be changed")]
    OwnerImmutable,
}

/// The role table, keyed by public key.
#[derive(Debug, Default)]
pub struct AccessList {
    entries: Mutex<HashMap<String, AclEntry>>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the configured owner keys. Called once at startup.
    pub fn seed_owners<I>(&self, keys: I, now: u64)
    where
        I: IntoIterator<Item = String>,
    {
        let mut entries = self.entries.lock().unwrap();
        for pubkey in keys {
            entries.insert(
                pubkey.clone(),
                AclEntry {
                    pubkey,
                    role: Role::Owner,
                    created_at: now,
                    updated_at: now,
                    expires: None,
                },
            );
        }
    }

    /// Insert or replace an entry. Replacing keeps the original creation
    /// time and refreshes the modification time. Owners cannot be assigned
    /// or demoted here.
    pub fn upsert(
        &self,
        pubkey: &str,
        role: Role,
        expires: Option<u64>,
        now: u64,
    ) -> Result<(), AclError> {
        if role == Role::Owner {
            return Err(AclError::OwnerImmutable);
        }
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(pubkey) {
            if existing.role == Role::Owner {
                return Err(AclError::OwnerImmutable);
            }
        }
        let created_at = entries.get(pubkey).map(|e| e.created_at).unwrap_or(now);
        entries.insert(
            pubkey.to_string(),
            AclEntry {
                pubkey: pubkey.to_string(),
                role,
                created_at,
                updated_at: now,
                expires,
            },
        );
        Ok(())
    }

    /// Remove an entry. Owners stay.
    pub fn remove(&self, pubkey: &str) -> Result<(), AclError> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(pubkey) {
            if existing.role == Role::Owner {
                return Err(AclError::OwnerImmutable);
            }
        }
        entries.remove(pubkey);
        Ok(())
    }

    /// Effective role of a key at `now`. Expired entries act as absent.
    pub fn role_of(&self, pubkey: &str, now: u64) -> Option<Role> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(pubkey)?;
        if let Some(expires) = entry.expires {
            if now >= expires {
                return None;
            }
        }
        Some(entry.role)
    }

    /// Snapshot of all entries, for administrative listing.
    pub fn entries(&self) -> Vec<AclEntry> {
        self.entries.lock().unwrap().values().cloned().collect()
    }
}
