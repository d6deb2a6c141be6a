//! Last-writer-wins JSON object document.
//!
//! Reference [`Document`] used by the tests and by callers who don't bring
//! their own CRDT. The root is an object whose top-level keys are LWW
//! registers; concurrent writes to one key resolve by [`PatchId`] order
//! (time, then session). Applying a patch twice is a no-op.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DocumentError;
use crate::{Document, Patch, PatchId, SessionId};

/// One edit of a [`JsonDocument`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JsonOp {
    Set { key: String, value: Value },
    Remove { key: String },
}

impl JsonOp {
    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        JsonOp::Set { key: key.into(), value: value.into() }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        JsonOp::Remove { key: key.into() }
    }

    /// One `Set` per entry of a JSON object, in key order.
    pub fn from_object(value: &Value) -> Vec<JsonOp> {
        match value {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| JsonOp::set(k.clone(), v.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn key(&self) -> &str {
        match self {
            JsonOp::Set { key, .. } | JsonOp::Remove { key } => key,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Register {
    /// `None` once removed; the stamp is kept so older writes stay dominated.
    value: Option<Value>,
    stamp: PatchId,
}

/// LWW map document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonDocument {
    fields: BTreeMap<String, Register>,
    clock: BTreeMap<SessionId, u64>,
    next_tick: u64,
}

impl JsonDocument {
    /// Current value of a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).and_then(|r| r.value.as_ref())
    }

    fn decode_ops(patch: &Patch) -> Result<Vec<JsonOp>, DocumentError> {
        serde_json::from_slice(patch.payload()).map_err(|e| DocumentError::Decode(e.to_string()))
    }
}

impl Document for JsonDocument {
    type Op = JsonOp;

    fn empty() -> Self {
        Self::default()
    }

    fn next_tick(&self) -> u64 {
        self.next_tick
    }

    fn observed(&self, sid: SessionId) -> Option<u64> {
        self.clock.get(&sid).copied()
    }

    fn build_patch(&self, sid: SessionId, ops: Vec<JsonOp>) -> Result<Patch, DocumentError> {
        if ops.is_empty() {
            return Err(DocumentError::Rejected {
                patch: format!("{sid}.{}", self.next_tick),
                reason: "patch has no ops".into(),
            });
        }
        let payload = serde_json::to_vec(&ops).map_err(|e| DocumentError::Encode(e.to_string()))?;
        Ok(Patch::new(
            PatchId::new(sid, self.next_tick),
            ops.len() as u64,
            payload,
        ))
    }

    fn apply(&mut self, patch: &Patch) -> Result<(), DocumentError> {
        let ops = Self::decode_ops(patch)?;
        if ops.len() as u64 > patch.span() {
            return Err(DocumentError::Rejected {
                patch: patch.id().to_string(),
                reason: format!("{} ops exceed span {}", ops.len(), patch.span()),
            });
        }

        for (offset, op) in ops.into_iter().enumerate() {
            let stamp = patch.id().tick(offset as u64);
            let wins = self
                .fields
                .get(op.key())
                .is_none_or(|existing| stamp > existing.stamp);
            if !wins {
                continue;
            }
            match op {
                JsonOp::Set { key, value } => {
                    self.fields.insert(key, Register { value: Some(value), stamp });
                }
                JsonOp::Remove { key } => {
                    self.fields.insert(key, Register { value: None, stamp });
                }
            }
        }

        let seen = self.clock.entry(patch.sid()).or_insert(patch.last_tick());
        *seen = (*seen).max(patch.last_tick());
        self.next_tick = self.next_tick.max(patch.next_tick());
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, DocumentError> {
        serde_json::to_vec(self).map_err(|e| DocumentError::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, DocumentError> {
        serde_json::from_slice(bytes).map_err(|e| DocumentError::Decode(e.to_string()))
    }

    fn view(&self) -> Option<Value> {
        if self.fields.is_empty() {
            return None;
        }
        let map: Map<String, Value> = self
            .fields
            .iter()
            .filter_map(|(k, r)| r.value.clone().map(|v| (k.clone(), v)))
            .collect();
        Some(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alice() -> SessionId {
        SessionId::new(100_001)
    }

    fn bob() -> SessionId {
        SessionId::new(100_002)
    }

    fn edit(doc: &mut JsonDocument, sid: SessionId, ops: Vec<JsonOp>) -> Patch {
        let patch = doc.build_patch(sid, ops).unwrap();
        doc.apply(&patch).unwrap();
        patch
    }

    #[test]
    fn test_empty_view_is_none() {
        assert_eq!(JsonDocument::empty().view(), None);
    }

    #[test]
    fn test_sequential_patches() {
        let mut doc = JsonDocument::empty();
        edit(&mut doc, alice(), JsonOp::from_object(&json!({"age": 25, "name": "Super Woman"})));
        edit(&mut doc, alice(), vec![JsonOp::set("age", 26)]);
        assert_eq!(doc.view(), Some(json!({"name": "Super Woman", "age": 26})));
        assert_eq!(doc.next_tick(), 3);
        assert_eq!(doc.observed(alice()), Some(2));
        assert_eq!(doc.observed(bob()), None);
    }

    #[test]
    fn test_concurrent_writes_converge() {
        let mut a = JsonDocument::empty();
        let mut b = JsonDocument::empty();
        let pa = edit(&mut a, alice(), vec![JsonOp::set("title", "from alice")]);
        let pb = edit(&mut b, bob(), vec![JsonOp::set("title", "from bob")]);

        a.apply(&pb).unwrap();
        b.apply(&pa).unwrap();
        assert_eq!(a.view(), b.view());
        // same tick: the larger session id wins
        assert_eq!(a.get("title"), Some(&json!("from bob")));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut doc = JsonDocument::empty();
        let p = edit(&mut doc, alice(), vec![JsonOp::set("x", 1)]);
        edit(&mut doc, alice(), vec![JsonOp::set("x", 2)]);
        doc.apply(&p).unwrap();
        assert_eq!(doc.get("x"), Some(&json!(2)));
    }

    #[test]
    fn test_remove_dominates_older_set() {
        let mut doc = JsonDocument::empty();
        let old = doc.build_patch(alice(), vec![JsonOp::set("k", "v")]).unwrap();
        doc.apply(&old).unwrap();
        edit(&mut doc, bob(), vec![JsonOp::remove("k")]);
        doc.apply(&old).unwrap();
        assert_eq!(doc.view(), Some(json!({})));
    }

    #[test]
    fn test_rebased_patch_applies_at_new_time() {
        let mut doc = JsonDocument::empty();
        let p = doc.build_patch(alice(), vec![JsonOp::set("a", 1), JsonOp::set("b", 2)]).unwrap();
        let moved = p.rebase(40);
        doc.apply(&moved).unwrap();
        assert_eq!(doc.next_tick(), 42);
        assert_eq!(doc.observed(alice()), Some(41));
    }

    #[test]
    fn test_encode_decode_preserves_state() {
        let mut doc = JsonDocument::empty();
        edit(&mut doc, alice(), vec![JsonOp::set("n", json!({"deep": [1, 2]}))]);
        edit(&mut doc, bob(), vec![JsonOp::remove("gone")]);
        let restored = JsonDocument::decode(&doc.encode().unwrap()).unwrap();
        assert_eq!(restored, doc);
        assert_eq!(JsonDocument::decode_or_empty(&[]).unwrap(), JsonDocument::empty());
    }

    #[test]
    fn test_build_patch_rejects_empty_ops() {
        assert!(JsonDocument::empty().build_patch(alice(), vec![]).is_err());
    }
}
