use crate::{Result, UsageError};
use node_common::{InstanceId, InstanceRecord, TrafficSnapshot};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// File-backed store of [`InstanceRecord`]s.
///
/// The document is a JSON array that is read in full and rewritten in full on
/// every mutation. Each operation holds the store lock across its whole
/// read-modify-write, so concurrent callers never lose each other's updates.
pub struct InstanceRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl InstanceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every record, in document order.
    pub async fn get_all(&self) -> Result<Vec<InstanceRecord>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    pub async fn get(&self, id: InstanceId) -> Result<Option<InstanceRecord>> {
        Ok(self.get_all().await?.into_iter().find(|r| r.id == id))
    }

    /// Registers `record`. Returns false (and writes nothing) if the id is
    /// already present.
    pub async fn add(&self, record: InstanceRecord) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        if records.iter().any(|r| r.id == record.id) {
            debug!(instance_id = record.id, "Instance already registered");
            return Ok(false);
        }
        info!(instance_id = record.id, inbound_port = record.inbound_port, "Registering instance");
        records.push(record);
        self.store(&records).await?;
        Ok(true)
    }

    /// Returns the removed record, if there was one.
    pub async fn remove(&self, id: InstanceId) -> Result<Option<InstanceRecord>> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let Some(pos) = records.iter().position(|r| r.id == id) else {
            return Ok(None);
        };
        let removed = records.remove(pos);
        self.store(&records).await?;
        info!(instance_id = id, "Instance removed from registry");
        Ok(Some(removed))
    }

    /// Replaces the record with the same id. Absent ids are ignored, so a
    /// record removed concurrently is never brought back.
    pub async fn update(&self, record: InstanceRecord) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let Some(existing) = records.iter_mut().find(|r| r.id == record.id) else {
            return Ok(false);
        };
        *existing = record;
        self.store(&records).await?;
        Ok(true)
    }

    /// Moves the stored counters of each `(observed, current)` pair to
    /// `current`, under one lock and one rewrite.
    ///
    /// A pair is applied only if the stored record still equals `observed`.
    /// Records removed or replaced since they were read are left alone.
    /// Returns the ids that were advanced.
    pub async fn advance_counters(
        &self,
        observations: &[(InstanceRecord, TrafficSnapshot)],
    ) -> Result<Vec<InstanceId>> {
        if observations.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let mut advanced = Vec::with_capacity(observations.len());
        for (observed, current) in observations {
            match records.iter_mut().find(|r| r.id == observed.id) {
                Some(existing) if existing == observed => {
                    existing.advance_to(*current);
                    advanced.push(observed.id);
                }
                Some(_) => debug!(instance_id = observed.id, "Record changed since it was read"),
                None => debug!(instance_id = observed.id, "Record removed since it was read"),
            }
        }
        if !advanced.is_empty() {
            self.store(&records).await?;
        }
        Ok(advanced)
    }

    async fn load(&self) -> Result<Vec<InstanceRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                if bytes.iter().all(u8::is_ascii_whitespace) {
                    return Ok(Vec::new());
                }
                Ok(serde_json::from_slice(&bytes)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "Creating empty instance registry");
                self.store(&[]).await?;
                Ok(Vec::new())
            }
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Writes to a temp file in the same directory, then renames over the
    /// registry.
    async fn store(&self, records: &[InstanceRecord]) -> Result<()> {
        let json = serde_json::to_vec_pretty(records)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &json))
            .await
            .map_err(|e| UsageError::RegistryTask(e.to_string()))?
            .map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: std::io::Error) -> UsageError {
        UsageError::RegistryIo {
            path: self.path.display().to_string(),
            source,
        }
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
