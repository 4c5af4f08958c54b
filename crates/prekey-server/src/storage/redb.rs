//! Redb-backed durable key store.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! Redb admits one write transaction at a time, which is what makes
//! read-then-delete OPK consumption atomic across threads.
//!
//! Only unused OPKs keep a row. Consumption deletes the oldest row of the
//! user's range, so neither consume nor count grows with the user's
//! history. Key ids live on in a separate table for the duplicate check.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use redb::{Database, DatabaseError, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::{Serialize, de::DeserializeOwned};

use super::{KeyStore, RecordKind, StorageError, validate_opk_batch};
use crate::types::{
    IdentityKey, OneTimePreKey, OneTimePreKeyUpload, RegisterBundleRequest, SignedPreKey,
};

/// Table: identity_keys
/// Key: user_id
/// Value: CBOR-encoded IdentityKey
const IDENTITY_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("identity_keys");

/// Table: signed_prekeys
/// Key: user_id
/// Value: CBOR-encoded SignedPreKey
const SIGNED_PREKEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("signed_prekeys");

/// Table: unused_one_time_prekeys
/// Key: [user_id_len: u32 BE][user_id bytes][id: u64 BE]
/// Value: CBOR-encoded OneTimePreKey
const UNUSED_OPKS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("unused_one_time_prekeys");

/// Table: opk_key_ids
/// Key: [user_id_len: u32 BE][user_id bytes][key_id bytes]
/// Value: id of the OPK uploaded under that key id
const OPK_KEY_IDS: TableDefinition<&[u8], u64> = TableDefinition::new("opk_key_ids");

/// Table: opk_users
/// Key: user_id of every user that ever uploaded an OPK
/// Value: number of unused OPKs
const OPK_USERS: TableDefinition<&str, u64> = TableDefinition::new("opk_users");

/// Table: meta
/// Key: counter name
/// Value: counter value
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Next OPK id to hand out, shared by all users
const NEXT_OPK_ID: &str = "next_opk_id";

/// Attempts to open a database file another handle has locked.
const LOCK_ATTEMPTS: u32 = 50;

/// Pause between lock attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Durable key store backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
///
/// Redb holds an exclusive lock on the file for as long as a `Database` is
/// open. A store from [`RedbKeyStore::open`] keeps it for its lifetime. A
/// store from [`RedbKeyStore::detached`] opens the file per operation and
/// releases it right after, so long-lived readers such as the OPK monitor
/// leave the file to other processes between calls.
#[derive(Clone)]
pub struct RedbKeyStore {
    handle: Handle,
}

#[derive(Clone)]
enum Handle {
    Open(Arc<Database>),
    Detached(Arc<PathBuf>),
}

impl RedbKeyStore {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist. Waits briefly if another handle
    /// has the file locked.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = open_database(path.as_ref())?;
        create_tables(&db)?;

        Ok(Self { handle: Handle::Open(Arc::new(db)) })
    }

    /// Store that holds the database file only while an operation runs.
    ///
    /// Creates the file and its tables up front, then closes it again.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn detached(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        create_tables(&open_database(&path)?)?;

        Ok(Self { handle: Handle::Detached(Arc::new(path)) })
    }

    fn with_db<T>(
        &self,
        op: impl FnOnce(&Database) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        match &self.handle {
            Handle::Open(db) => op(db),
            Handle::Detached(path) => op(&open_database(path)?),
        }
    }
}

impl KeyStore for RedbKeyStore {
    fn get_identity_key(&self, user_id: &str) -> Result<IdentityKey, StorageError> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(io)?;
            let table = txn.open_table(IDENTITY_KEYS).map_err(io)?;

            read_record(&table, user_id)?.ok_or_else(|| StorageError::NotFound {
                record: RecordKind::IdentityKey,
                user_id: user_id.to_string(),
            })
        })
    }

    fn get_signed_prekey(&self, user_id: &str) -> Result<SignedPreKey, StorageError> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(io)?;
            let table = txn.open_table(SIGNED_PREKEYS).map_err(io)?;

            read_record(&table, user_id)?.ok_or_else(|| StorageError::NotFound {
                record: RecordKind::SignedPreKey,
                user_id: user_id.to_string(),
            })
        })
    }

    fn consume_one_time_prekey(&self, user_id: &str) -> Result<OneTimePreKey, StorageError> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(io)?;

            // Dropping the uncommitted transaction aborts it
            let consumed = OpkTables::open(&txn)?
                .take_oldest(user_id)?
                .ok_or_else(|| StorageError::NoOpksAvailable { user_id: user_id.to_string() })?;

            txn.commit().map_err(io)?;

            Ok(consumed)
        })
    }

    fn store_bundle(&self, bundle: &RegisterBundleRequest) -> Result<(), StorageError> {
        let user_id = bundle.user_id.as_str();

        self.with_db(|db| {
            let txn = db.begin_write().map_err(io)?;

            {
                let mut identity_keys = txn.open_table(IDENTITY_KEYS).map_err(io)?;
                let mut signed_prekeys = txn.open_table(SIGNED_PREKEYS).map_err(io)?;
                let mut opks = OpkTables::open(&txn)?;

                let existing: Option<IdentityKey> = read_record(&identity_keys, user_id)?;
                if existing.is_some_and(|ik| ik.public_key != bundle.identity_key) {
                    return Err(StorageError::IdentityKeyConflict {
                        user_id: user_id.to_string(),
                    });
                }

                opks.validate(user_id, &bundle.one_time_prekeys)?;

                let identity_key = IdentityKey {
                    user_id: user_id.to_string(),
                    public_key: bundle.identity_key.clone(),
                };
                identity_keys.insert(user_id, encode(&identity_key)?.as_slice()).map_err(io)?;

                let spk = SignedPreKey {
                    user_id: user_id.to_string(),
                    public_key: bundle.signed_prekey.clone(),
                    signature: bundle.spk_signature.clone(),
                    expires_at_secs: None,
                };
                signed_prekeys.insert(user_id, encode(&spk)?.as_slice()).map_err(io)?;

                opks.append(user_id, &bundle.one_time_prekeys)?;
            }

            txn.commit().map_err(io)?;

            Ok(())
        })
    }

    fn insert_opks(
        &self,
        user_id: &str,
        opks: &[OneTimePreKeyUpload],
    ) -> Result<(), StorageError> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(io)?;

            {
                let mut tables = OpkTables::open(&txn)?;
                tables.validate(user_id, opks)?;
                tables.append(user_id, opks)?;
            }

            txn.commit().map_err(io)?;

            Ok(())
        })
    }

    fn rotate_signed_prekey(
        &self,
        user_id: &str,
        new_spk: &str,
        signature: &str,
        expires_at_secs: Option<u64>,
    ) -> Result<(), StorageError> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(io)?;

            {
                let mut table = txn.open_table(SIGNED_PREKEYS).map_err(io)?;

                if table.get(user_id).map_err(io)?.is_none() {
                    return Err(StorageError::NotFound {
                        record: RecordKind::SignedPreKey,
                        user_id: user_id.to_string(),
                    });
                }

                let spk = SignedPreKey {
                    user_id: user_id.to_string(),
                    public_key: new_spk.to_string(),
                    signature: signature.to_string(),
                    expires_at_secs,
                };
                table.insert(user_id, encode(&spk)?.as_slice()).map_err(io)?;
            }

            txn.commit().map_err(io)?;

            Ok(())
        })
    }

    fn count_available_opks(&self, user_id: &str) -> Result<usize, StorageError> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(io)?;
            let table = txn.open_table(OPK_USERS).map_err(io)?;

            Ok(read_counter(&table, user_id)? as usize)
        })
    }

    fn list_users_with_opks(&self) -> Result<Vec<String>, StorageError> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(io)?;
            let table = txn.open_table(OPK_USERS).map_err(io)?;

            let mut users = Vec::new();
            for entry in table.iter().map_err(io)? {
                let (user_id, _) = entry.map_err(io)?;
                users.push(user_id.value().to_string());
            }

            Ok(users)
        })
    }
}

/// The OPK tables of one write transaction.
struct OpkTables<'txn> {
    unused: Table<'txn, &'static [u8], &'static [u8]>,
    key_ids: Table<'txn, &'static [u8], u64>,
    users: Table<'txn, &'static str, u64>,
    meta: Table<'txn, &'static str, u64>,
}

impl<'txn> OpkTables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> Result<Self, StorageError> {
        Ok(Self {
            unused: txn.open_table(UNUSED_OPKS).map_err(io)?,
            key_ids: txn.open_table(OPK_KEY_IDS).map_err(io)?,
            users: txn.open_table(OPK_USERS).map_err(io)?,
            meta: txn.open_table(META).map_err(io)?,
        })
    }

    /// Reject batches reusing a key id, consumed or not.
    fn validate(&self, user_id: &str, batch: &[OneTimePreKeyUpload]) -> Result<(), StorageError> {
        validate_opk_batch(user_id, batch, |key_id| {
            let key = encode_key_id_key(user_id, key_id);
            Ok(self.key_ids.get(key.as_slice()).map_err(io)?.is_some())
        })
    }

    /// Insert uploads as fresh OPK rows and advance the id counter.
    ///
    /// Caller must have validated the batch.
    fn append(
        &mut self,
        user_id: &str,
        uploads: &[OneTimePreKeyUpload],
    ) -> Result<(), StorageError> {
        if uploads.is_empty() {
            return Ok(());
        }

        let mut next_id = read_counter(&self.meta, NEXT_OPK_ID)?;

        for upload in uploads {
            let opk = OneTimePreKey {
                id: next_id,
                key_id: upload.key_id.clone(),
                user_id: user_id.to_string(),
                public_key: upload.public_key.clone(),
                used: false,
            };
            let key = encode_opk_key(user_id, next_id);
            self.unused.insert(key.as_slice(), encode(&opk)?.as_slice()).map_err(io)?;

            let key_id = encode_key_id_key(user_id, &upload.key_id);
            self.key_ids.insert(key_id.as_slice(), next_id).map_err(io)?;

            next_id += 1;
        }

        let available = read_counter(&self.users, user_id)? + uploads.len() as u64;
        self.users.insert(user_id, available).map_err(io)?;
        self.meta.insert(NEXT_OPK_ID, next_id).map_err(io)?;

        Ok(())
    }

    /// Remove and return the user's oldest unused OPK, flagged as used.
    fn take_oldest(&mut self, user_id: &str) -> Result<Option<OneTimePreKey>, StorageError> {
        let (start, end) = opk_key_range(user_id);

        let oldest: Option<OneTimePreKey> = {
            let mut range = self.unused.range(start.as_slice()..=end.as_slice()).map_err(io)?;
            match range.next() {
                Some(entry) => {
                    let (_, value) = entry.map_err(io)?;
                    Some(decode(value.value())?)
                },
                None => None,
            }
        };

        let Some(mut opk) = oldest else {
            return Ok(None);
        };

        self.unused.remove(encode_opk_key(user_id, opk.id).as_slice()).map_err(io)?;
        let available = read_counter(&self.users, user_id)?.saturating_sub(1);
        self.users.insert(user_id, available).map_err(io)?;

        opk.used = true;
        Ok(Some(opk))
    }
}

/// Open or create the database file, waiting out another handle's lock.
fn open_database(path: &Path) -> Result<Database, StorageError> {
    let mut attempt = 1;
    loop {
        match Database::create(path) {
            Ok(db) => return Ok(db),
            Err(DatabaseError::DatabaseAlreadyOpen) if attempt < LOCK_ATTEMPTS => {
                attempt += 1;
                thread::sleep(LOCK_RETRY_DELAY);
            },
            Err(err) => return Err(io(err)),
        }
    }
}

fn create_tables(db: &Database) -> Result<(), StorageError> {
    let txn = db.begin_write().map_err(io)?;
    {
        let _ = txn.open_table(IDENTITY_KEYS).map_err(io)?;
        let _ = txn.open_table(SIGNED_PREKEYS).map_err(io)?;
        let _ = txn.open_table(UNUSED_OPKS).map_err(io)?;
        let _ = txn.open_table(OPK_KEY_IDS).map_err(io)?;
        let _ = txn.open_table(OPK_USERS).map_err(io)?;
        let _ = txn.open_table(META).map_err(io)?;
    }
    txn.commit().map_err(io)
}

fn io(err: impl Display) -> StorageError {
    StorageError::Io(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Load and decode the per-user record stored under `user_id`.
fn read_record<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    user_id: &str,
) -> Result<Option<T>, StorageError> {
    table.get(user_id).map_err(io)?.map(|value| decode(value.value())).transpose()
}

/// Counter stored under `key`, zero when absent.
fn read_counter(
    table: &impl ReadableTable<&'static str, u64>,
    key: &str,
) -> Result<u64, StorageError> {
    if let Some(guard) = table.get(key).map_err(io)? { Ok(guard.value()) } else { Ok(0) }
}

/// Length-prefixed user id, the common prefix of all per-user OPK keys.
fn user_prefix(user_id: &str, suffix_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + user_id.len() + suffix_len);
    key.extend_from_slice(&(user_id.len() as u32).to_be_bytes());
    key.extend_from_slice(user_id.as_bytes());
    key
}

/// Encode (user_id, id) as an unused-OPK table key.
///
/// Layout: [user_id_len: 4 bytes BE][user_id bytes][id: 8 bytes BE]
/// The length prefix keeps one user's keys contiguous and the big-endian id
/// makes lexicographic order match insertion order.
fn encode_opk_key(user_id: &str, id: u64) -> Vec<u8> {
    let mut key = user_prefix(user_id, 8);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Encode (user_id, key_id) as a key-id table key.
fn encode_key_id_key(user_id: &str, key_id: &str) -> Vec<u8> {
    let mut key = user_prefix(user_id, key_id.len());
    key.extend_from_slice(key_id.as_bytes());
    key
}

/// Inclusive key range covering every unused OPK of one user.
fn opk_key_range(user_id: &str) -> (Vec<u8>, Vec<u8>) {
    (encode_opk_key(user_id, 0), encode_opk_key(user_id, u64::MAX))
}
