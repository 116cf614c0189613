//! Snapshot store - durable order book checkpoints
//!
//! `current.json` always holds the latest finalized snapshot; every save
//! also writes a sidecar named by the snapshot's base-chain height, and the
//! sidecar directory is trimmed to a bounded ring keeping the newest
//! heights. Writes go to a temp file first and are renamed into place.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::book::{size_to_value, OrderBookSnapshot};
use crate::error::NodeResult;
use crate::ledger::ChainId;

/// A captured order book with the chain heights it was taken at
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub order_book: OrderBookSnapshot,
    pub chain_heights: BTreeMap<ChainId, u64>,
}

impl Snapshot {
    pub fn base_height(&self, base: &ChainId) -> u64 {
        self.chain_heights.get(base).copied().unwrap_or(0)
    }
}

pub struct SnapshotStore {
    current_path: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
}

impl SnapshotStore {
    pub fn new(current_path: PathBuf, backup_dir: PathBuf, max_backups: usize) -> Self {
        Self {
            current_path,
            backup_dir,
            max_backups,
        }
    }

    /// Persist a snapshot, overwrite the current file, and ring-buffer a
    /// height-named backup
    pub fn save(&self, snapshot: &Snapshot, base: &ChainId) -> NodeResult<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        if let Some(parent) = self.current_path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.current_path, &json)?;

        fs::create_dir_all(&self.backup_dir)?;
        let height = snapshot.base_height(base);
        let sidecar = self.backup_dir.join(format!("snapshot-{height}.json"));
        write_atomic(&sidecar, &json)?;
        self.trim_backups()?;

        debug!("Saved order book snapshot at base height {}", height);
        Ok(())
    }

    /// Load the current snapshot, applying legacy field rewrites
    pub fn load(&self) -> NodeResult<Option<Snapshot>> {
        if !self.current_path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&self.current_path)?;
        let mut value: Value = serde_json::from_slice(&raw)?;
        rewrite_legacy(&mut value);
        let snapshot: Snapshot = serde_json::from_value(value)?;
        Ok(Some(snapshot))
    }

    /// Keep only the newest `max_backups` sidecar files
    fn trim_backups(&self) -> NodeResult<()> {
        let mut heights: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(height) = parse_backup_height(&name.to_string_lossy()) else {
                continue;
            };
            heights.push((height, entry.path()));
        }
        heights.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, path) in heights.into_iter().skip(self.max_backups) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to trim snapshot backup {:?}: {}", path, e);
            }
        }
        Ok(())
    }
}

fn parse_backup_height(name: &str) -> Option<u64> {
    name.strip_prefix("snapshot-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Rewrite snapshots produced by older node versions in place
///
/// Old snapshots named the order id `orderId` and denominated bid orders in
/// quote units (`size`); bids are rewritten to `id` and
/// `value = size * price`.
fn rewrite_legacy(value: &mut Value) {
    let Some(book) = value.get_mut("order_book") else {
        return;
    };
    for (field, is_bid) in [("bid_limit_orders", true), ("ask_limit_orders", false)] {
        let Some(Value::Array(orders)) = book.get_mut(field) else {
            continue;
        };
        for order in orders {
            if let Value::Object(obj) = order {
                rewrite_legacy_order(obj, is_bid);
            }
        }
    }
}

fn rewrite_legacy_order(obj: &mut Map<String, Value>, is_bid: bool) {
    if let Some(id) = obj.remove("orderId") {
        obj.entry("id").or_insert(id);
    }
    if !is_bid || obj.contains_key("value") {
        return;
    }

    let size = json_u64(obj.get("size"));
    let size_remaining = obj
        .get("size_remaining")
        .or_else(|| obj.get("sizeRemaining"));
    let size_remaining = json_u64(size_remaining);
    let Some(price) = obj.get("price").and_then(json_decimal) else {
        return;
    };

    obj.insert("value".into(), size_to_value(size, price).into());
    obj.insert(
        "value_remaining".into(),
        size_to_value(size_remaining, price).into(),
    );
    obj.insert("size".into(), 0u64.into());
    obj.insert("size_remaining".into(), 0u64.into());
    obj.remove("sizeRemaining");
}

fn json_u64(value: Option<&Value>) -> u64 {
    value.and_then(Value::as_u64).unwrap_or(0)
}

fn json_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}
