//! Background merge of a column family's sorted runs.
//!
//! The pass merges every run into one: the newest record per key survives,
//! point deletes and range tombstones are applied and then dropped, since
//! nothing older than the merged output remains on disk. Memtables always
//! carry higher sequences than any run, so they are unaffected.

use crate::engine::lsm::{ColumnFamily, LsmOptions};
use crate::engine::memtable::RangeTombstone;
use crate::engine::table::{TableBuilder, TableReader, KIND_DELETE};
use crate::err::Error;
use crate::err::Error::*;
use std::collections::HashSet;
use std::ops::Bound;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::fs;

pub async fn compact_column_family(cf: &Arc<ColumnFamily>, opts: &LsmOptions) -> Result<(), Error> {
    let _guard = cf.maintenance.lock().await;
    if cf.dropped.load(Ordering::Acquire) {
        return Ok(());
    }
    let inputs: Vec<Arc<TableReader>> = {
        let mut state = cf.state.write().await;
        state.compact_hints.clear();
        state.tables.clone()
    };
    if inputs.len() < 2 {
        return Ok(());
    }

    let mut tombstones: Vec<RangeTombstone> = Vec::new();
    let mut expected = 0usize;
    for t in &inputs {
        tombstones.extend_from_slice(t.tombstones());
        expected += t.entry_count as usize;
    }

    let run_id = {
        let mut state = cf.state.write().await;
        let id = state.next_run_id;
        state.next_run_id += 1;
        id
    };

    let mut builder = TableBuilder::new(opts.false_positive_rate, expected.max(1));
    let mut anchor: Option<Vec<u8>> = None;
    let mut kept = 0u64;
    loop {
        let bound = match anchor.as_deref() {
            Some(a) => Bound::Excluded(a),
            None => Bound::Unbounded,
        };
        let mut min_key: Option<Vec<u8>> = None;
        for t in &inputs {
            if let Some(e) = t.first_above(bound).await? {
                if min_key.as_ref().map_or(true, |m| &e.key < m) {
                    min_key = Some(e.key);
                }
            }
        }
        let Some(key) = min_key else { break };
        let mut winner: Option<crate::engine::table::TableEntry> = None;
        for t in &inputs {
            if let Some(e) = t.get(&key).await? {
                if winner.as_ref().map_or(true, |w| e.seq > w.seq) {
                    winner = Some(e);
                }
            }
        }
        if let Some(w) = winner {
            let masked = tombstones.iter().any(|t| t.covers(&w.key, w.seq));
            if w.kind != KIND_DELETE && !masked {
                builder.add(&w.key, w.seq, w.kind, &w.value);
                kept += 1;
            }
        }
        anchor = Some(key);
    }

    let output = if builder.is_empty() {
        None
    } else {
        let path = ColumnFamily::run_path(&cf.dir, run_id);
        builder.finish(&path).await?;
        Some(Arc::new(TableReader::open(&path, run_id, opts.cache_blocks).await?))
    };

    let input_ids: HashSet<u64> = inputs.iter().map(|t| t.run_id).collect();
    {
        let mut state = cf.state.write().await;
        state.tables.retain(|t| !input_ids.contains(&t.run_id));
        if let Some(out) = output {
            state.tables.push(out);
        }
        state.tables.sort_by(|a, b| b.max_seq.cmp(&a.max_seq));
    }
    for t in &inputs {
        fs::remove_file(&t.path).await.map_err(|error| FileRemoveError {
            path: t.path.clone(),
            error,
        })?;
    }
    log::info!(
        "compacted {} runs of cf {} into run {} ({} live entries)",
        inputs.len(),
        cf.name,
        run_id,
        kept
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lsm::{LsmEngine, LsmOptions};
    use crate::engine::{KvEngine, WriteBatch, WriteOptions};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_compaction_keeps_newest_and_drops_deleted() {
        let root = tempdir().unwrap();
        let opts = LsmOptions {
            memtable_bytes: 256,
            ..Default::default()
        };
        let engine = LsmEngine::open(root.path().join("db"), opts.clone()).await.unwrap();
        engine.create_column_family("cf").await.unwrap();

        for round in 0..4u32 {
            for i in 0..8u32 {
                let mut batch = WriteBatch::new();
                batch.put("cf", format!("k{:02}", i).as_bytes(), format!("r{}", round).as_bytes());
                engine.write(batch, WriteOptions::default()).await.unwrap();
            }
        }
        let mut batch = WriteBatch::new();
        batch.delete("cf", b"k00");
        batch.delete_range("cf", b"k06", b"k08");
        engine.write(batch, WriteOptions { sync: true }).await.unwrap();

        // wait for flushes, then force a merge
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let cf = engine.cf_for_test("cf").await;
        compact_column_family(&cf, &opts).await.unwrap();

        assert_eq!(engine.get("cf", b"k00").await.unwrap(), None);
        assert_eq!(engine.get("cf", b"k06").await.unwrap(), None);
        assert_eq!(engine.get("cf", b"k03").await.unwrap(), Some(b"r3".to_vec()));
    }
}
