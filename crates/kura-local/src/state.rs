//! Persisted per-block records and their composed view.

use kura_types::{Batch, BlockId, Cursor, Document, Patch};
use serde::{Deserialize, Serialize};

use crate::error::{RepoError, Result};
use crate::keys;
use crate::kv::KvStore;

/// Per-device sync bookkeeping for one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMeta {
    /// Last logical tick of the confirmed model, -1 for none.
    pub time: i64,
    /// Wall time of the last successful sync, 0 if never synced.
    pub ts: u64,
    /// Last confirmed server seq, -1 for none.
    pub seq: i64,
}

impl LocalMeta {
    pub const FRESH: LocalMeta = LocalMeta { time: -1, ts: 0, seq: -1 };

    /// Never reached the remote, so the first push creates it there.
    pub fn is_unsynced(&self) -> bool {
        self.ts == 0 && self.seq < 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ModelRecord {
    pub seq: i64,
    pub blob: Vec<u8>,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(postcard::to_stdvec(value)?)
}

/// Everything stored for one block except history batch contents.
#[derive(Debug, Default)]
pub(crate) struct BlockState {
    pub meta: Option<LocalMeta>,
    pub model: Option<ModelRecord>,
    /// `(key, patch)` in key order, which is `(time, sid)` order.
    pub frontier: Vec<(String, Patch)>,
    pub history: Vec<u64>,
}

impl BlockState {
    pub fn load(kv: &dyn KvStore, id: &BlockId) -> Result<Self> {
        let meta = kv.get(&keys::meta(id))?.map(|v| postcard::from_bytes(&v)).transpose()?;
        let model = kv.get(&keys::model(id))?.map(|v| postcard::from_bytes(&v)).transpose()?;

        let mut frontier = Vec::new();
        for (key, value) in kv.scan_prefix(&keys::frontier_prefix(id))? {
            let patch = Patch::from_bytes(&value)
                .map_err(|e| RepoError::Corrupt(format!("frontier {key}: {e}")))?;
            frontier.push((key, patch));
        }

        // batches themselves are only read when trimming or serving history
        let mut history = Vec::new();
        for key in kv.scan_keys(&keys::history_prefix(id))? {
            match keys::parse_history(id, &key) {
                Some(seq) => history.push(seq),
                None => tracing::warn!(key = %key, "ignoring unknown local key"),
            }
        }

        Ok(BlockState { meta, model, frontier, history })
    }

    pub fn exists(&self) -> bool {
        self.meta.is_some()
    }

    pub fn seq(&self) -> i64 {
        self.meta.map_or(-1, |m| m.seq)
    }

    /// The confirmed model, empty when none was stored.
    pub fn model<D: Document>(&self) -> Result<D> {
        match &self.model {
            Some(record) => Ok(D::decode_or_empty(&record.blob)?),
            None => Ok(D::empty()),
        }
    }

    /// Confirmed model with the frontier applied on top.
    pub fn composed<D: Document>(&self) -> Result<D> {
        let mut doc = self.model::<D>()?;
        doc.apply_all(self.frontier.iter().map(|(_, p)| p))?;
        Ok(doc)
    }

    /// First tick free for new patches of any session.
    pub fn next_tick<D: Document>(&self, model: &D) -> u64 {
        self.frontier
            .iter()
            .map(|(_, p)| p.next_tick())
            .fold(model.next_tick(), u64::max)
    }

    pub fn cursor<D: Document>(&self, composed: &D) -> Cursor {
        if !self.exists() {
            return Cursor::new(-1, -1);
        }
        Cursor::new(composed.next_tick() as i64 - 1, self.seq())
    }

    pub fn frontier_patches(&self) -> Vec<Patch> {
        self.frontier.iter().map(|(_, p)| p.clone()).collect()
    }
}

/// Decode a stored history batch.
pub(crate) fn decode_batch(bytes: &[u8]) -> Result<Batch> {
    Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use kura_types::{JsonDocument, JsonOp, PatchId, SessionId};
    use serde_json::json;

    use super::*;
    use crate::kv::{MemoryKv, WriteBatch};

    #[test]
    fn test_load_classifies_and_composes() {
        let kv = MemoryKv::new();
        let id = BlockId::new("doc").unwrap();
        let sid = SessionId::new(80_000);

        let mut confirmed = JsonDocument::empty();
        let first = confirmed.build_patch(sid, vec![JsonOp::set("a", 1)]).unwrap();
        confirmed.apply(&first).unwrap();
        let pending = confirmed.build_patch(sid, vec![JsonOp::set("b", 2)]).unwrap();

        let mut batch = WriteBatch::new();
        batch
            .put(keys::meta(&id), encode(&LocalMeta { time: 0, ts: 5, seq: 0 }).unwrap())
            .put(
                keys::model(&id),
                encode(&ModelRecord { seq: 0, blob: confirmed.encode().unwrap() }).unwrap(),
            )
            .put(keys::frontier(&id, pending.time(), sid), pending.to_bytes().unwrap())
            .put(keys::history(&id, 0), vec![]);
        kv.write(batch).unwrap();

        let state = BlockState::load(&kv, &id).unwrap();
        assert!(state.exists());
        assert_eq!(state.history, vec![0]);
        assert_eq!(state.frontier_patches(), vec![pending]);

        let composed: JsonDocument = state.composed().unwrap();
        assert_eq!(composed.view(), Some(json!({"a": 1, "b": 2})));
        assert_eq!(state.cursor(&composed), Cursor::new(1, 0));
        assert_eq!(state.next_tick(&state.model::<JsonDocument>().unwrap()), 2);
    }

    #[test]
    fn test_next_tick_follows_the_furthest_patch() {
        let kv = MemoryKv::new();
        let id = BlockId::new("ticks").unwrap();
        let (ours, theirs) = (SessionId::new(80_000), SessionId::new(90_000));

        let mut model = JsonDocument::empty();
        let confirmed = model.build_patch(ours, vec![JsonOp::set("a", 1)]).unwrap();
        model.apply(&confirmed).unwrap();
        assert_eq!(model.next_tick(), 1);

        // a foreign patch spanning ticks 5 and 6
        let ahead = Patch::new(PatchId::new(theirs, 5), 2, b"[]".to_vec());
        let mut batch = WriteBatch::new();
        batch
            .put(keys::meta(&id), encode(&LocalMeta { time: 0, ts: 5, seq: 0 }).unwrap())
            .put(keys::model(&id), encode(&ModelRecord { seq: 0, blob: model.encode().unwrap() }).unwrap())
            .put(keys::frontier(&id, ahead.time(), theirs), ahead.to_bytes().unwrap());
        kv.write(batch).unwrap();

        let state = BlockState::load(&kv, &id).unwrap();
        assert_eq!(ahead.next_tick(), 7);
        assert_eq!(state.next_tick(&model), 7);
        assert_eq!(BlockState::default().next_tick(&model), 1);
        assert_eq!(BlockState::default().next_tick(&JsonDocument::empty()), 0);
    }

    #[test]
    fn test_load_reads_only_history_keys() {
        let kv = MemoryKv::new();
        let id = BlockId::new("trimmed").unwrap();
        let mut batch = WriteBatch::new();
        batch
            .put(keys::meta(&id), encode(&LocalMeta { time: -1, ts: 1, seq: 3 }).unwrap())
            .put(keys::history(&id, 2), vec![0xff])
            .put(keys::history(&id, 3), vec![0xff])
            .put(keys::meta(&BlockId::new("trimmed2").unwrap()), vec![0xff]);
        kv.write(batch).unwrap();

        // unreadable batch bodies do not matter until a batch is read
        let state = BlockState::load(&kv, &id).unwrap();
        assert_eq!(state.history, vec![2, 3]);
        assert_eq!(state.seq(), 3);
        assert!(state.frontier.is_empty());
        assert!(decode_batch(&[0xff]).is_err());
    }

    #[test]
    fn test_missing_block_is_empty() {
        let kv = MemoryKv::new();
        let state = BlockState::load(&kv, &BlockId::new("none").unwrap()).unwrap();
        assert!(!state.exists());
        let doc: JsonDocument = state.composed().unwrap();
        assert_eq!(doc.view(), None);
        assert_eq!(state.cursor(&doc), Cursor::new(-1, -1));
    }

    #[test]
    fn test_corrupt_frontier_is_reported() {
        let kv = MemoryKv::new();
        let id = BlockId::new("bad").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(keys::frontier(&id, 0, SessionId::new(80_000)), vec![0xff]);
        kv.write(batch).unwrap();
        assert!(matches!(BlockState::load(&kv, &id), Err(RepoError::Corrupt(_))));
    }
}
