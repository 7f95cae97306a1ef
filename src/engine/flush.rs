//! Drains a column family's frozen memtables into sorted-run files, oldest
//! first, retiring each memtable's write-ahead log once its run is synced.

use crate::engine::lsm::{ColumnFamily, LsmOptions};
use crate::engine::memtable::{MemTableHandle, MemValue};
use crate::engine::table::{TableBuilder, TableReader, KIND_DELETE, KIND_PUT};
use crate::err::Error;
use crate::err::Error::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::fs;

pub async fn flush_column_family(cf: &Arc<ColumnFamily>, opts: &LsmOptions) -> Result<(), Error> {
    let _guard = cf.maintenance.lock().await;
    loop {
        if cf.dropped.load(Ordering::Acquire) {
            return Ok(());
        }
        let (mem, run_id) = {
            let mut state = cf.state.write().await;
            let Some(mem) = state.frozen.first().map(|(_, mem)| mem.clone()) else {
                return Ok(());
            };
            let run_id = state.next_run_id;
            state.next_run_id += 1;
            (mem, run_id)
        };
        flush_one(cf, opts, mem, run_id).await?;
    }
}

async fn flush_one(cf: &Arc<ColumnFamily>, opts: &LsmOptions, mem: MemTableHandle, run_id: u64) -> Result<(), Error> {
    let mem_id = mem.id;
    let reader = if mem.is_empty() {
        None
    } else {
        let mut builder = TableBuilder::new(opts.false_positive_rate, mem.entries.len().max(1));
        for entry in mem.entries.iter() {
            let rec = entry.value();
            match &rec.value {
                MemValue::Put(v) => builder.add(entry.key(), rec.seq, KIND_PUT, v),
                MemValue::Delete => builder.add(entry.key(), rec.seq, KIND_DELETE, b""),
            }
        }
        for tomb in mem.tombstones() {
            builder.add_tombstone(tomb);
        }
        let path = ColumnFamily::run_path(&cf.dir, run_id);
        builder.finish(&path).await?;
        Some(Arc::new(TableReader::open(&path, run_id, opts.cache_blocks).await?))
    };

    {
        let mut state = cf.state.write().await;
        state.frozen.shift_remove(&mem_id);
        if let Some(reader) = reader {
            log::debug!(
                "flushed memtable {} of cf {} into run {} ({} entries)",
                mem_id,
                cf.name,
                run_id,
                reader.entry_count
            );
            state.tables.push(reader);
            state.tables.sort_by(|a, b| b.max_seq.cmp(&a.max_seq));
        }
    }

    let wal_path = ColumnFamily::wal_path(&cf.dir, mem_id);
    fs::remove_file(&wal_path).await.map_err(|error| FileRemoveError {
        path: wal_path.clone(),
        error,
    })?;
    Ok(())
}
