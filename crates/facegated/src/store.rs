use facegate_core::{Descriptor, EnrolledIdentity};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const DESCRIPTOR_DIM: usize = 512;
const DESCRIPTOR_BYTE_LEN: usize = DESCRIPTOR_DIM * 4;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed (key mismatch or corrupted data)")]
    DecryptionFailed,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid descriptor dimension: {0} (expected 512)")]
    InvalidDescriptorDim(usize),
    #[error("invalid descriptor value (NaN/Inf or zero norm)")]
    InvalidDescriptorValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed enrolled population with descriptors encrypted at rest.
///
/// Descriptors are sealed with AES-256-GCM before they reach SQLite. The
/// 32-byte key is generated on first use and kept at `{db_dir}/.key`
/// (mode 0600).
#[derive(Clone)]
pub struct IdentityStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl IdentityStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // Tests
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/facegate"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS identities (
                     id TEXT PRIMARY KEY,
                     name TEXT NOT NULL,
                     descriptor BLOB NOT NULL,
                     model_version TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Insert `identity`, deleting `replaces` in the same transaction.
    pub async fn enroll(
        &self,
        identity: &EnrolledIdentity,
        replaces: Option<&str>,
    ) -> Result<(), StoreError> {
        let blob = self.encrypt_descriptor(identity.descriptor.values())?;
        let id = identity.id.clone();
        let name = identity.name.clone();
        let model_version = identity
            .descriptor
            .model_version()
            .unwrap_or("unknown")
            .to_string();
        let created_at = identity.created_at.clone();
        let replaces = replaces.map(str::to_string);

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if let Some(old) = replaces {
                    tx.execute("DELETE FROM identities WHERE id = ?1", [&old])?;
                }
                tx.execute(
                    "INSERT INTO identities (id, name, descriptor, model_version, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, name, blob, model_version, created_at],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Load the whole population in enrollment order.
    pub async fn load_all(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        // Decrypt outside the blocking closure
        let rows: Vec<(String, String, Vec<u8>, String, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, descriptor, model_version, created_at
                     FROM identities ORDER BY created_at, rowid",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut identities = Vec::with_capacity(rows.len());
        for (id, name, blob, model_version, created_at) in rows {
            let values = self.decrypt_descriptor(&blob)?;
            let descriptor = Descriptor::new(values)
                .map_err(|_| StoreError::InvalidDescriptorValue)?
                .with_model_version(model_version);
            identities.push(EnrolledIdentity {
                id,
                name,
                descriptor,
                created_at,
            });
        }
        Ok(identities)
    }

    /// Enrolled identities without descriptor data.
    pub async fn list(&self) -> Result<Vec<IdentityInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, model_version, created_at
                     FROM identities ORDER BY created_at, rowid",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(IdentityInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        model_version: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM identities WHERE id = ?1", [&id])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key))
    }

    /// `nonce (12 bytes) || ciphertext+tag` of the little-endian descriptor.
    fn encrypt_descriptor(&self, values: &[f32]) -> Result<Vec<u8>, StoreError> {
        check_descriptor(values)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), descriptor_to_bytes(values).as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        Ok([nonce.as_slice(), sealed.as_slice()].concat())
    }

    fn decrypt_descriptor(&self, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plain = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| StoreError::DecryptionFailed)?;
        bytes_to_descriptor_strict(&plain)
    }
}

/// Read the install key at `path`, creating it (mode 0600) on first start.
fn load_or_generate_key(path: &Path) -> Result<[u8; 32], StoreError> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let key = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                StoreError::KeyIo(std::io::Error::other(format!(
                    "key file {} holds {} bytes, expected 32",
                    path.display(),
                    bytes.len()
                )))
            })?;
            tracing::debug!(path = %path.display(), "descriptor key loaded");
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => create_key(path),
        Err(e) => Err(StoreError::KeyIo(e)),
    }
}

fn create_key(path: &Path) -> Result<[u8; 32], StoreError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);

    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .and_then(|mut file| file.write_all(&key))
        .map_err(StoreError::KeyIo)?;

    tracing::info!(path = %path.display(), "created descriptor key");
    Ok(key)
}

fn descriptor_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`descriptor_to_bytes`]. Accepts only `DESCRIPTOR_DIM` finite values.
fn bytes_to_descriptor_strict(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != DESCRIPTOR_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    check_descriptor(&values)?;
    Ok(values)
}

fn check_descriptor(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != DESCRIPTOR_DIM {
        return Err(StoreError::InvalidDescriptorDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidDescriptorValue);
    }
    Ok(())
}

/// Enrolled identity metadata (no descriptor).
#[derive(Debug, Clone, serde::Serialize)]
pub struct IdentityInfo {
    pub id: String,
    pub name: String,
    pub model_version: String,
    pub created_at: String,
}
