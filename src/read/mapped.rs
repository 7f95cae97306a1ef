//! Mapped range reads: a primary range scan whose rows feed a key template
//! evaluated server-side, with the derived keys looked up at the same
//! version. Keys and values are treated as NUL-separated tuples for the
//! `{K[i]}` / `{V[i]}` substitutions; `{{` and `}}` escape literal braces,
//! and a trailing `{...}` turns the derived key into a prefix range scan.

use crate::err::Error;
use crate::err::Error::*;
use crate::read;
use crate::server::StorageServer;
use crate::types::{prefix_range, Key, Value, Version};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq)]
pub enum MapperPart {
    Literal(Vec<u8>),
    KeyIndex(usize),
    ValueIndex(usize),
    /// `{...}`: expand the derived key into a prefix scan; must be last
    RangeAll,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MappedRow {
    pub key: Key,
    pub value: Value,
    pub secondary_key: Key,
    pub secondary: Vec<(Key, Value)>,
}

pub fn parse_mapper(mapper: &[u8]) -> Result<Vec<MapperPart>, Error> {
    let mut parts = Vec::new();
    let mut literal = Vec::new();
    let mut i = 0;
    while i < mapper.len() {
        match mapper[i] {
            b'{' if mapper.get(i + 1) == Some(&b'{') => {
                literal.push(b'{');
                i += 2;
            }
            b'}' if mapper.get(i + 1) == Some(&b'}') => {
                literal.push(b'}');
                i += 2;
            }
            b'{' => {
                let close = mapper[i..]
                    .iter()
                    .position(|b| *b == b'}')
                    .ok_or(MapperBadRangeDescriptor)?
                    + i;
                let inner = &mapper[i + 1..close];
                if !literal.is_empty() {
                    parts.push(MapperPart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(parse_placeholder(inner)?);
                i = close + 1;
            }
            other => {
                literal.push(other);
                i += 1;
            }
        }
    }
    if !literal.is_empty() {
        parts.push(MapperPart::Literal(literal));
    }
    // the range descriptor may only close the template
    for (idx, part) in parts.iter().enumerate() {
        if *part == MapperPart::RangeAll && idx + 1 != parts.len() {
            return Err(MapperBadRangeDescriptor);
        }
    }
    Ok(parts)
}

fn parse_placeholder(inner: &[u8]) -> Result<MapperPart, Error> {
    if inner == b"..." {
        return Ok(MapperPart::RangeAll);
    }
    let text = std::str::from_utf8(inner).map_err(|_| MapperBadIndex(String::from_utf8_lossy(inner).to_string()))?;
    let bad = || MapperBadIndex(text.to_string());
    if text.len() < 2 {
        return Err(bad());
    }
    let (source, rest) = text.split_at(1);
    let index = rest
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .ok_or_else(bad)?
        .parse::<usize>()
        .map_err(|_| bad())?;
    match source {
        "K" => Ok(MapperPart::KeyIndex(index)),
        "V" => Ok(MapperPart::ValueIndex(index)),
        _ => Err(bad()),
    }
}

fn tuple_segment(bytes: &[u8], index: usize) -> Option<&[u8]> {
    bytes.split(|b| *b == 0).nth(index)
}

/// Builds the secondary key for one primary row; `true` when the template
/// asked for a range expansion
fn derive_key(parts: &[MapperPart], key: &[u8], value: &[u8]) -> Result<(Key, bool), Error> {
    let mut out = Vec::new();
    let mut is_range = false;
    for part in parts {
        match part {
            MapperPart::Literal(lit) => out.extend_from_slice(lit),
            MapperPart::KeyIndex(i) => {
                let seg = tuple_segment(key, *i).ok_or_else(|| MapperBadIndex(format!("K[{}]", i)))?;
                out.extend_from_slice(seg);
            }
            MapperPart::ValueIndex(i) => {
                let seg = tuple_segment(value, *i).ok_or_else(|| MapperBadIndex(format!("V[{}]", i)))?;
                out.extend_from_slice(seg);
            }
            MapperPart::RangeAll => is_range = true,
        }
    }
    Ok((out, is_range))
}

/// Scans `[begin, end)` and resolves every row's derived key at the same
/// version. Secondary lookups that land on a shard this server does not
/// own fail `QuickGetValueMiss` / `QuickGetKeyValuesMiss` so the caller
/// can fall back to a distributed read.
pub async fn get_mapped_range(
    server: &Arc<StorageServer>,
    begin: &[u8],
    end: &[u8],
    mapper: &[u8],
    row_limit: i64,
    byte_limit: usize,
    v: Version,
) -> Result<Vec<MappedRow>, Error> {
    let parts = parse_mapper(mapper)?;
    let primary = read::get_range(server, begin, end, row_limit, byte_limit, v).await?;
    let mut out = Vec::with_capacity(primary.rows.len());
    for (key, value) in primary.rows {
        let (secondary_key, is_range) = derive_key(&parts, &key, &value)?;
        let secondary = if is_range {
            let range = prefix_range(&secondary_key);
            let fanout = server.cfg.mapped_range_fanout;
            let scan = read::get_range(server, &range.begin, &range.end, (fanout + 1) as i64, usize::MAX, v)
                .await
                .map_err(|err| match err {
                    WrongShardServer => QuickGetKeyValuesMiss,
                    other => other,
                })?;
            if scan.more || scan.rows.len() > fanout {
                return Err(QuickGetKeyValuesHasMore);
            }
            scan.rows
        } else {
            match read::get_value(server, &secondary_key, v).await {
                Ok(Some(value)) => vec![(secondary_key.clone(), value)],
                Ok(None) => Vec::new(),
                Err(WrongShardServer) => return Err(QuickGetValueMiss),
                Err(other) => return Err(other),
            }
        };
        out.push(MappedRow {
            key,
            value,
            secondary_key,
            secondary,
        });
    }
    Ok(out)
}
