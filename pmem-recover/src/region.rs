use std::collections::hash_map::{Entry, HashMap};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use pmem_state::PersistentAddr;

use crate::error::RecoverError;
use crate::replay::ReplayTarget;

pub fn region_name(id: u16) -> String {
    format!("region_{id}")
}

/// Region files `region_<id>` of a directory, mapped when first written.
pub struct RegionMap {
    dir: PathBuf,
    maps: HashMap<u16, MmapMut>,
}

impl RegionMap {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RegionMap {
            dir: dir.into(),
            maps: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mapped(&self) -> usize {
        self.maps.len()
    }

    fn region(&mut self, id: u16) -> Result<&mut MmapMut, RecoverError> {
        match self.maps.entry(id) {
            Entry::Occupied(map) => Ok(map.into_mut()),
            Entry::Vacant(vacant) => {
                let path = self.dir.join(region_name(id));
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                // Safety: the region file belongs to the recovering process alone.
                let map = unsafe { MmapMut::map_mut(&file)? };
                tracing::debug!(region = id, path = ?path, len = map.len(), "region mapped");
                Ok(vacant.insert(map))
            }
        }
    }

    fn range(&mut self, addr: PersistentAddr, len: u64) -> Result<&mut [u8], RecoverError> {
        let map = self.region(addr.region())?;
        let start = addr.offset() as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= map.len())
            .ok_or(RecoverError::OutOfRange { addr, len })?;

        Ok(&mut map[start..end])
    }

    /// Write all mapped regions back to their files.
    pub fn flush(&self) -> Result<(), RecoverError> {
        for map in self.maps.values() {
            map.flush()?;
        }

        Ok(())
    }
}

impl ReplayTarget for RegionMap {
    fn write(&mut self, addr: PersistentAddr, bytes: &[u8]) -> Result<(), RecoverError> {
        self.range(addr, bytes.len() as u64)?.copy_from_slice(bytes);
        Ok(())
    }

    fn fill(&mut self, addr: PersistentAddr, byte: u8, len: u64) -> Result<(), RecoverError> {
        self.range(addr, len)?.fill(byte);
        Ok(())
    }
}
