//! Persisted set of reserved IP addresses

use enclave_common::{EnclaveError, EnclaveResult};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Taken-address set that survives the allocator
///
/// `update` is a transaction: the closure sees the current set, and its
/// changes are kept only if it returns `Ok` and the write succeeds.
pub trait IpReservationStore: Send + Sync {
    fn load(&self) -> EnclaveResult<BTreeSet<Ipv4Addr>>;

    fn update(
        &self,
        apply: &mut dyn FnMut(&mut BTreeSet<Ipv4Addr>) -> EnclaveResult<()>,
    ) -> EnclaveResult<()>;
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    taken: Mutex<BTreeSet<Ipv4Addr>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IpReservationStore for MemoryStore {
    fn load(&self) -> EnclaveResult<BTreeSet<Ipv4Addr>> {
        Ok(self.taken.lock().clone())
    }

    fn update(
        &self,
        apply: &mut dyn FnMut(&mut BTreeSet<Ipv4Addr>) -> EnclaveResult<()>,
    ) -> EnclaveResult<()> {
        let mut taken = self.taken.lock();
        let mut next = taken.clone();
        apply(&mut next)?;
        *taken = next;
        Ok(())
    }
}

/// JSON file store, written through a temp file and rename
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<Option<BTreeSet<Ipv4Addr>>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn read_file(&self) -> EnclaveResult<BTreeSet<Ipv4Addr>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| EnclaveError::Store(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_file(&self, taken: &BTreeSet<Ipv4Addr>) -> EnclaveResult<()> {
        let content = serde_json::to_string_pretty(taken)
            .map_err(|e| EnclaveError::Store(e.to_string()))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, content)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            std::fs::remove_file(&tmp).ok();
            return Err(e.into());
        }
        Ok(())
    }
}

impl IpReservationStore for JsonFileStore {
    fn load(&self) -> EnclaveResult<BTreeSet<Ipv4Addr>> {
        let mut cache = self.cache.lock();
        if let Some(taken) = cache.as_ref() {
            return Ok(taken.clone());
        }
        let taken = self.read_file()?;
        *cache = Some(taken.clone());
        Ok(taken)
    }

    fn update(
        &self,
        apply: &mut dyn FnMut(&mut BTreeSet<Ipv4Addr>) -> EnclaveResult<()>,
    ) -> EnclaveResult<()> {
        let mut cache = self.cache.lock();
        let mut next = match cache.as_ref() {
            Some(taken) => taken.clone(),
            None => self.read_file()?,
        };
        apply(&mut next)?;
        self.write_file(&next)?;
        *cache = Some(next);
        Ok(())
    }
}
