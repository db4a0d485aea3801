use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ArmadaError, Result};

/// One physical core is divided into this many shares.
pub const SHARE_BASE: i64 = 10;

/// Smallest memory limit the container runtime accepts (4 MiB).
pub const MIN_MEMORY: i64 = 4 * 1024 * 1024;

/// Discrete CPU capacity: cpu id → free shares on that core.
///
/// Backed by a BTreeMap so iteration order is stable; planners rely on that
/// for reproducible output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuMap(pub BTreeMap<String, i64>);

impl CpuMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of shares over all cpu ids.
    pub fn total(&self) -> i64 {
        self.0.values().sum()
    }

    /// Element-wise addition, inserting keys absent on the left.
    pub fn add(&mut self, other: &CpuMap) {
        for (id, share) in &other.0 {
            *self.0.entry(id.clone()).or_insert(0) += share;
        }
    }

    /// Element-wise subtraction. Every key of `other` must exist here with at
    /// least as many free shares, otherwise nothing is modified.
    pub fn sub(&mut self, other: &CpuMap) -> Result<()> {
        for (id, share) in &other.0 {
            match self.0.get(id) {
                Some(free) if free >= share => {}
                _ => {
                    return Err(ArmadaError::InsufficientCpu(format!(
                        "cpu {} cannot supply {} shares",
                        id, share
                    )))
                }
            }
        }
        for (id, share) in &other.0 {
            if let Some(free) = self.0.get_mut(id) {
                *free -= share;
            }
        }
        Ok(())
    }

    /// Whether one container needing `demand` shares can be served in chunks
    /// of `piece` shares from the free capacity.
    pub fn contains(&self, demand: i64, piece: i64) -> bool {
        if demand <= 0 {
            return true;
        }
        if piece <= 0 {
            return false;
        }
        let chunks: i64 = self.0.values().map(|free| free / piece).sum();
        chunks * piece >= demand
    }
}

impl FromIterator<(String, i64)> for CpuMap {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Volume capacity: volume name → free bytes. Same discipline as [`CpuMap`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeMap(pub BTreeMap<String, i64>);

impl VolumeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> i64 {
        self.0.values().sum()
    }

    pub fn add(&mut self, other: &VolumeMap) {
        for (name, bytes) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += bytes;
        }
    }

    pub fn sub(&mut self, other: &VolumeMap) -> Result<()> {
        for (name, bytes) in &other.0 {
            match self.0.get(name) {
                Some(free) if free >= bytes => {}
                _ => {
                    return Err(ArmadaError::InsufficientRes(format!(
                        "volume {} cannot supply {} bytes",
                        name, bytes
                    )))
                }
            }
        }
        for (name, bytes) in &other.0 {
            if let Some(free) = self.0.get_mut(name) {
                *free -= bytes;
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, i64)> for VolumeMap {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Direction of an atomic capacity update on a node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOp {
    Add,
    Sub,
}

impl ResourceOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceOp::Add => "+",
            ResourceOp::Sub => "-",
        }
    }
}

/// The per-replica slice of node capacity moved by one allocation or release.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub cpu: CpuMap,
    pub quota: f64,
    pub memory: i64,
    pub storage: i64,
    pub volume: VolumeMap,
}

impl ResourceDelta {
    pub fn is_zero(&self) -> bool {
        self.cpu.total() == 0
            && self.quota == 0.0
            && self.memory == 0
            && self.storage == 0
            && self.volume.total() == 0
    }
}
