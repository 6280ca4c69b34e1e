//! The encoded document model: a record paired with a per-field eventstamp
//! tree and a top-level tombstone (spec.md §3, §4.3).
//!
//! `Value`/`Record` are re-exports of `serde_json::Value`/`serde_json::Map`:
//! spec.md's record is already defined as "a plain map of string keys to
//! JSON-compatible values", so `serde_json`'s own tree type *is* the record
//! type, not a model of it. This also makes the "snapshot survives JSON
//! round-trip bit-exactly" requirement (spec.md §6) automatic, and rules out
//! cyclic records by construction (spec.md §9's "reject cycles at encode
//! time": `serde_json::Value` cannot represent a cycle).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::eventstamp::Eventstamp;

/// A JSON-compatible leaf or nested value. Re-export of `serde_json::Value`.
pub use serde_json::Value;

/// A document's top-level shape: a map of string keys to [`Value`]s.
/// Re-export of `serde_json::Map`.
pub type Record = serde_json::Map<String, Value>;

/// The eventstamp tree that mirrors a record's shape.
///
/// `Leaf` marks a position that is a leaf in `data`, including arrays,
/// which spec.md I1 treats as atomic leaves, never merged element-wise.
/// `Object` marks a position that is a nested JSON object in `data`; its
/// keys are exactly the keys present in `data`'s object at that path
/// (spec.md I1: "at every path that is a nested record in `data`,
/// `eventstamps` is also a nested record").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StampTree {
    /// A single eventstamp at a leaf position.
    Leaf(Eventstamp),
    /// A nested object; keys match `data`'s object keys at this path.
    /// `BTreeMap` keeps iteration (and therefore serialized) order
    /// deterministic, which the "JSON round trip bit-exact" requirement
    /// depends on.
    Object(BTreeMap<String, StampTree>),
}

impl StampTree {
    /// Builds a stamp tree that mirrors `value`'s shape, stamping every
    /// leaf (including arrays) with `stamp`.
    #[must_use]
    pub fn mirror(value: &Value, stamp: &Eventstamp) -> Self {
        match value {
            Value::Object(map) => StampTree::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), StampTree::mirror(v, stamp)))
                    .collect(),
            ),
            _ => StampTree::Leaf(stamp.clone()),
        }
    }

    /// The maximum eventstamp anywhere in this tree.
    #[must_use]
    pub fn max_stamp(&self) -> Eventstamp {
        match self {
            StampTree::Leaf(stamp) => stamp.clone(),
            StampTree::Object(fields) => fields
                .values()
                .map(StampTree::max_stamp)
                .fold(None::<Eventstamp>, |acc, s| {
                    Some(match acc {
                        Some(acc) => Eventstamp::max(&acc, &s),
                        None => s,
                    })
                })
                .unwrap_or_else(crate::eventstamp::min_eventstamp),
        }
    }
}

/// The authoritative on-disk / on-wire form of one record (spec.md §3).
///
/// Field names serialize in `camelCase` to match the wire shape spec.md §3
/// and §6 specify (`deletedAt`, not `deleted_at`), the same convention
/// `topgun-core`'s `messages` module uses for every wire-crossing type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedDocument {
    /// Stable identity within a collection. Never changes after creation
    /// (spec.md I4).
    pub id: String,
    /// Deep copy of the application record's raw leaf values.
    pub data: Value,
    /// Parallel tree of per-leaf eventstamps, structurally identical to
    /// `data` at every nested-object node (spec.md I1).
    pub eventstamps: StampTree,
    /// Soft-delete tombstone. `None` while the document is live. Always
    /// present on the wire as `deletedAt: eventstamp | null` (spec.md §3),
    /// never omitted.
    #[serde(default)]
    pub deleted_at: Option<Eventstamp>,
    /// Max of every stamp in `eventstamps`, and of `deleted_at` if set
    /// (spec.md I2).
    pub latest: Eventstamp,
}

impl EncodedDocument {
    /// Builds a new document from a first write: deep-copies `record` into
    /// `data`, mirrors it into `eventstamps` stamped with `stamp`, and
    /// leaves it live (`deleted_at: None`).
    #[must_use]
    pub fn make_resource(id: impl Into<String>, record: Value, stamp: Eventstamp) -> Self {
        let eventstamps = StampTree::mirror(&record, &stamp);
        Self {
            id: id.into(),
            data: record,
            eventstamps,
            deleted_at: None,
            latest: stamp,
        }
    }

    /// Returns the decoded record: a structural copy of `data`. Never
    /// exposes the `eventstamps` tree.
    #[must_use]
    pub fn decode(&self) -> Value {
        self.data.clone()
    }

    /// Returns `true` if this document is live (`deleted_at.is_none()`).
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Tombstones this document at `stamp`, returning a fresh document.
    ///
    /// `data` and `eventstamps` are left intact: spec.md §4.3 requires
    /// this so a later merge can still LWW individual fields against a
    /// not-yet-observed concurrent update.
    #[must_use]
    pub fn delete_resource(&self, stamp: Eventstamp) -> Self {
        let mut next = self.clone();
        next.latest = Eventstamp::max(&next.latest, &stamp);
        next.deleted_at = Some(stamp);
        next
    }
}
