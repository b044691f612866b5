//! Inventory store interface
//!
//! The store owns the persisted per-colour counts. The daemon only ever hands
//! it deltas; every change is an atomic read-modify-write floored at zero.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, info};
use crate::error::InventoryError;

/// Component colours the robot sorts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Color {
    Red,
    Green,
    Blue,
}

impl Color {
    pub const ALL: [Color; 3] = [Color::Red, Color::Green, Color::Blue];

    /// Parse a colour name, ignoring case ("RED", "green", ...)
    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|color| color.as_str().eq_ignore_ascii_case(text.trim()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Red => "Red",
            Color::Green => "Green",
            Color::Blue => "Blue",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Color::parse(s).ok_or_else(|| format!("unknown colour '{}'", s))
    }
}

pub type Counts = BTreeMap<Color, u64>;

fn zeroed_counts() -> Counts {
    Color::ALL.into_iter().map(|color| (color, 0)).collect()
}

fn apply_delta(current: u64, delta: i64) -> u64 {
    let next = current as i128 + delta as i128;
    next.clamp(0, u64::MAX as i128) as u64
}

/// External inventory store
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Add `delta` to the colour's count and return the new count (never below 0)
    async fn change_count(&self, color: Color, delta: i64) -> Result<u64, InventoryError>;

    /// Current counts, with every known colour present
    async fn get_counts(&self) -> Result<Counts, InventoryError>;
}

/// Inventory kept only in process memory
#[derive(Debug)]
pub struct MemoryInventory {
    counts: Mutex<Counts>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(zeroed_counts()),
        }
    }
}

impl Default for MemoryInventory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InventoryStore for MemoryInventory {
    async fn change_count(&self, color: Color, delta: i64) -> Result<u64, InventoryError> {
        let mut counts = self.counts.lock().await;
        let entry = counts.entry(color).or_insert(0);
        *entry = apply_delta(*entry, delta);
        Ok(*entry)
    }

    async fn get_counts(&self) -> Result<Counts, InventoryError> {
        Ok(self.counts.lock().await.clone())
    }
}

/// One persisted inventory row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Inventory persisted as a JSON document
///
/// The file is rewritten through a temporary sibling and renamed into place, so
/// a crash mid-write leaves the previous document intact.
#[derive(Debug)]
pub struct JsonFileInventory {
    path: PathBuf,
    records: Mutex<BTreeMap<Color, InventoryRecord>>,
}

impl JsonFileInventory {
    /// Open the inventory file, seeding every colour at 0 when absent
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, InventoryError> {
        let path = path.as_ref().to_path_buf();

        let mut records: BTreeMap<Color, InventoryRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Creating inventory file {}", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        for color in Color::ALL {
            records.entry(color).or_insert(InventoryRecord { count: 0, updated_at: now });
        }

        let inventory = Self {
            path,
            records: Mutex::new(records),
        };
        {
            let records = inventory.records.lock().await;
            inventory.persist(&records).await?;
        }
        Ok(inventory)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(
        &self,
        records: &BTreeMap<Color, InventoryRecord>,
    ) -> Result<(), InventoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(records)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, payload).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!("Persisted inventory to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for JsonFileInventory {
    async fn change_count(&self, color: Color, delta: i64) -> Result<u64, InventoryError> {
        // Lock held across the write so concurrent changes serialize
        let mut records = self.records.lock().await;
        let previous = records.get(&color).cloned();
        let current = previous.as_ref().map(|r| r.count).unwrap_or(0);
        let next = apply_delta(current, delta);
        records.insert(color, InventoryRecord { count: next, updated_at: Utc::now() });

        if let Err(e) = self.persist(&records).await {
            match previous {
                Some(record) => records.insert(color, record),
                None => records.remove(&color),
            };
            return Err(e);
        }
        Ok(next)
    }

    async fn get_counts(&self) -> Result<Counts, InventoryError> {
        let records = self.records.lock().await;
        let mut counts = zeroed_counts();
        for (color, record) in records.iter() {
            counts.insert(*color, record.count);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colour_names_parse_case_insensitively() {
        assert_eq!(Color::parse("RED"), Some(Color::Red));
        assert_eq!(Color::parse("green"), Some(Color::Green));
        assert_eq!(Color::parse(" Blue "), Some(Color::Blue));
        assert_eq!(Color::parse("YELLOW"), None);
        assert_eq!("blue".parse::<Color>(), Ok(Color::Blue));
    }

    #[tokio::test]
    async fn memory_inventory_floors_at_zero() {
        let inventory = MemoryInventory::new();
        assert_eq!(inventory.change_count(Color::Red, 3).await.unwrap(), 3);
        assert_eq!(inventory.change_count(Color::Red, -5).await.unwrap(), 0);
        assert_eq!(inventory.change_count(Color::Blue, 2).await.unwrap(), 2);

        let counts = inventory.get_counts().await.unwrap();
        assert_eq!(counts[&Color::Red], 0);
        assert_eq!(counts[&Color::Green], 0);
        assert_eq!(counts[&Color::Blue], 2);
    }

    #[tokio::test]
    async fn json_inventory_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("inventory.json");

        {
            let inventory = JsonFileInventory::open(&path).await.unwrap();
            assert_eq!(inventory.get_counts().await.unwrap()[&Color::Green], 0);
            inventory.change_count(Color::Green, 4).await.unwrap();
            inventory.change_count(Color::Green, -1).await.unwrap();
        }

        let reopened = JsonFileInventory::open(&path).await.unwrap();
        let counts = reopened.get_counts().await.unwrap();
        assert_eq!(counts[&Color::Green], 3);
        assert_eq!(counts[&Color::Red], 0);
        assert_eq!(reopened.change_count(Color::Green, -10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn json_inventory_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        std::fs::write(&path, b"not json").unwrap();

        let err = JsonFileInventory::open(&path).await.unwrap_err();
        assert!(matches!(err, InventoryError::Json(_)));
    }
}
