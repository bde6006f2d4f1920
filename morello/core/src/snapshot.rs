use crate::config::CoreConfig;
use crate::memory::MemoryImage;
use crate::morello::state::CapState;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const SNAPSHOT_MAGIC: &str = "morello-core.snapshot";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub addr: u64,
    pub bytes: Vec<u8>,
}

/// Register file, configuration and memory contents of a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub magic: String,
    pub version: u32,
    pub created: String,
    #[serde(default)]
    pub instruction_count: u64,
    #[serde(default)]
    pub config: CoreConfig,
    pub state: CapState,
    #[serde(default)]
    pub memory: Vec<Segment>,
    /// Addresses of tagged granules.
    #[serde(default)]
    pub tags: Vec<u64>,
    /// `[start, end)` ranges that reject writes.
    #[serde(default)]
    pub readonly_ranges: Vec<(u64, u64)>,
    /// `[start, end)` ranges that reject unprivileged accesses.
    #[serde(default)]
    pub privileged_ranges: Vec<(u64, u64)>,
}

impl Snapshot {
    pub fn capture(
        config: &CoreConfig,
        state: &CapState,
        memory: &MemoryImage,
        instruction_count: u64,
    ) -> Self {
        Snapshot {
            magic: SNAPSHOT_MAGIC.to_string(),
            version: SNAPSHOT_VERSION,
            created: crate::now_timestamp(),
            instruction_count,
            config: config.clone(),
            state: state.clone(),
            memory: memory
                .segments()
                .into_iter()
                .map(|(addr, bytes)| Segment { addr, bytes })
                .collect(),
            tags: memory.dump_tags(),
            readonly_ranges: memory.readonly_ranges().to_vec(),
            privileged_ranges: memory.privileged_ranges().to_vec(),
        }
    }

    /// Rebuilds memory. Tags are applied after the data so byte writes do not clear them.
    pub fn restore_memory(&self) -> MemoryImage {
        let mut memory = MemoryImage::new();
        for segment in &self.memory {
            memory.write_bytes(segment.addr, &segment.bytes);
        }
        memory.restore_tags(self.tags.iter().copied());
        memory.set_readonly_ranges(self.readonly_ranges.clone());
        memory.set_privileged_ranges(self.privileged_ranges.clone());
        memory
    }

    fn validate(&self) -> Result<()> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(CoreError::InvalidSnapshot(format!(
                "unexpected magic {:?}",
                self.magic
            )));
        }
        if self.version > SNAPSHOT_VERSION {
            return Err(CoreError::InvalidSnapshot(format!(
                "unsupported version {}",
                self.version
            )));
        }
        Ok(())
    }
}

pub fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let text = serde_json::to_string_pretty(snapshot)?;
    fs::write(path, text)?;
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let text = fs::read_to_string(path)?;
    let snapshot: Snapshot = serde_json::from_str(&text)?;
    snapshot.validate()?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::memory::{Access, BusError, CapBus};

    #[test]
    fn memory_and_tags_survive_capture() {
        let mut memory = MemoryImage::new();
        memory.write_bytes(0x2000, &[1, 2, 3]);
        memory.store_cap(0x3000, Capability::root().compress());
        let snap = Snapshot::capture(&CoreConfig::default(), &CapState::new(), &memory, 7);
        let text = serde_json::to_string(&snap).unwrap();
        let back: Snapshot = serde_json::from_str(&text).unwrap();
        back.validate().unwrap();
        let restored = back.restore_memory();
        assert_eq!(restored.read_bytes(0x2000, 3), vec![1, 2, 3]);
        assert!(restored.tag_at(0x3000));
        assert_eq!(restored.load_cap(0x3000), Capability::root().compress());
        assert_eq!(back.instruction_count, 7);
    }

    #[test]
    fn protected_ranges_survive_capture() {
        let mut memory = MemoryImage::new();
        memory.set_readonly_ranges(vec![(0x1000, 0x2000)]);
        memory.set_privileged_ranges(vec![(0x8000, 0x9000)]);
        let snap = Snapshot::capture(&CoreConfig::default(), &CapState::new(), &memory, 0);
        let text = serde_json::to_string(&snap).unwrap();
        let mut restored = serde_json::from_str::<Snapshot>(&text).unwrap().restore_memory();

        assert_eq!(restored.readonly_ranges(), &[(0x1000u64, 0x2000u64)]);
        assert!(matches!(
            restored.write(0x1800, 1, 0xff, Access::Normal),
            Err(BusError::ReadOnly { .. })
        ));
        assert!(matches!(
            restored.read(0x8000, 8, Access::Unprivileged),
            Err(BusError::Privileged { .. })
        ));
        assert!(restored.read(0x8000, 8, Access::Normal).is_ok());
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let mut snap = Snapshot::capture(&CoreConfig::default(), &CapState::new(), &MemoryImage::new(), 0);
        snap.magic = "other.snapshot".into();
        assert!(matches!(snap.validate(), Err(CoreError::InvalidSnapshot(_))));
    }
}
