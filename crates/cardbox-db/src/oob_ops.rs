//! Out-of-band key/value store.
//!
//! Independent of the contact tables: sync adaptors use it to persist
//! their own bookkeeping (anchors, remote ids) in the same database file.
//! Keys are namespaced as `<scope>:<key>`. Large values are compressed
//! when a cheap entropy probe suggests compression will pay off.

use std::collections::BTreeMap;
use std::io::{Read as _, Write as _};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, params};
use tracing::debug;

use crate::{DbResult, LOG_TARGET, UnspecifiedSnafu};

/// Stored value variants. Binary and text payloads are candidates for
/// compression; numbers are always stored raw.
#[derive(Clone, Debug, PartialEq)]
pub enum OobValue {
    Bytes(Vec<u8>),
    Text(String),
    Int(i64),
    Real(f64),
}

/// Compression codes stored in the `compressed` column.
const RAW: i64 = 0;
const COMPRESSED_BYTES: i64 = 1;
const COMPRESSED_TEXT: i64 = 2;

const BYTES_COMPRESSION_THRESHOLD: usize = 512;
const TEXT_COMPRESSION_THRESHOLD: usize = 256;
const ENTROPY_THRESHOLD: f64 = 0.85;

/// Shannon entropy of a byte sample, scaled to [0, 1]. High-entropy data
/// (already compressed, encrypted) is unlikely to compress further.
fn entropy(sample: &[u8]) -> f64 {
    if sample.is_empty() {
        return 0.0;
    }

    let mut histogram = [0u32; 256];
    for byte in sample {
        histogram[*byte as usize] += 1;
    }

    let total = sample.len() as f64;
    let mut entropy = 0.0;
    for count in histogram.iter().filter(|c| **c > 0) {
        let p = f64::from(*count) / total;
        entropy -= p * p.log2();
    }
    entropy / 8.0
}

fn compress(data: &[u8]) -> DbResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|err| {
            UnspecifiedSnafu {
                reason: format!("compression failed: {err}"),
            }
            .build()
        })
}

fn decompress(data: &[u8]) -> DbResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out).map_err(|err| {
        UnspecifiedSnafu {
            reason: format!("decompression failed: {err}"),
        }
        .build()
    })?;
    Ok(out)
}

pub(crate) fn store(
    conn: &Connection,
    scope: &str,
    values: &BTreeMap<String, OobValue>,
) -> DbResult<()> {
    let mut stmt =
        conn.prepare("INSERT OR REPLACE INTO OOB (name, value, compressed) VALUES (?1, ?2, ?3)")?;

    for (key, value) in values {
        let name = format!("{scope}:{key}");
        match value {
            OobValue::Bytes(bytes) if bytes.len() > BYTES_COMPRESSION_THRESHOLD => {
                // Probe a mid-payload window; headers are often atypical.
                let sample = &bytes[256..512];
                if entropy(sample) < ENTROPY_THRESHOLD {
                    stmt.execute(params![name, compress(bytes)?, COMPRESSED_BYTES])?;
                } else {
                    debug!(target: LOG_TARGET, key = %name, "Skipping compression of high-entropy value");
                    stmt.execute(params![name, bytes, RAW])?;
                }
            }
            OobValue::Bytes(bytes) => {
                stmt.execute(params![name, bytes, RAW])?;
            }
            OobValue::Text(text) if text.len() > TEXT_COMPRESSION_THRESHOLD => {
                stmt.execute(params![name, compress(text.as_bytes())?, COMPRESSED_TEXT])?;
            }
            OobValue::Text(text) => {
                stmt.execute(params![name, text, RAW])?;
            }
            OobValue::Int(value) => {
                stmt.execute(params![name, value, RAW])?;
            }
            OobValue::Real(value) => {
                stmt.execute(params![name, value, RAW])?;
            }
        }
    }
    Ok(())
}

pub(crate) fn remove(conn: &Connection, scope: &str, keys: &[&str]) -> DbResult<()> {
    let mut stmt = conn.prepare("DELETE FROM OOB WHERE name = ?1")?;
    for key in keys {
        stmt.execute(params![format!("{scope}:{key}")])?;
    }
    Ok(())
}

pub(crate) fn remove_scope(conn: &Connection, scope: &str) -> DbResult<()> {
    conn.execute(
        "DELETE FROM OOB WHERE name LIKE ?1 || ':%'",
        params![scope],
    )?;
    Ok(())
}

/// Fetches values by key, or the whole scope when `keys` is empty.
pub(crate) fn fetch(
    conn: &Connection,
    scope: &str,
    keys: &[&str],
) -> DbResult<BTreeMap<String, OobValue>> {
    let mut out = BTreeMap::new();

    let mut decode_row = |name: &str, value: ValueRef<'_>, compressed: i64| -> DbResult<()> {
        let Some(key) = name.strip_prefix(scope).and_then(|n| n.strip_prefix(':')) else {
            return Ok(());
        };

        let decoded = match (compressed, value) {
            (COMPRESSED_BYTES, ValueRef::Blob(blob)) => OobValue::Bytes(decompress(blob)?),
            (COMPRESSED_TEXT, ValueRef::Blob(blob)) => {
                let bytes = decompress(blob)?;
                OobValue::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            (_, ValueRef::Blob(blob)) => OobValue::Bytes(blob.to_vec()),
            (_, ValueRef::Text(text)) => {
                OobValue::Text(String::from_utf8_lossy(text).into_owned())
            }
            (_, ValueRef::Integer(value)) => OobValue::Int(value),
            (_, ValueRef::Real(value)) => OobValue::Real(value),
            (_, ValueRef::Null) => return Ok(()),
        };
        out.insert(key.to_owned(), decoded);
        Ok(())
    };

    if keys.is_empty() {
        let mut stmt =
            conn.prepare("SELECT name, value, compressed FROM OOB WHERE name LIKE ?1 || ':%'")?;
        let mut rows = stmt.query(params![scope])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            decode_row(&name, row.get_ref(1)?, row.get(2)?)?;
        }
    } else {
        let mut stmt = conn.prepare("SELECT name, value, compressed FROM OOB WHERE name = ?1")?;
        for key in keys {
            let name = format!("{scope}:{key}");
            let mut rows = stmt.query(params![name])?;
            while let Some(row) = rows.next()? {
                decode_row(&name, row.get_ref(1)?, row.get(2)?)?;
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_discriminates() {
        let uniform = vec![0u8; 256];
        assert!(entropy(&uniform) < 0.1);

        let spread: Vec<u8> = (0..=255).collect();
        assert!(entropy(&spread) > 0.99);
    }

    #[test]
    fn compress_round_trip() {
        let data = b"abcabcabcabcabcabc".repeat(100);
        let compressed = compress(&data).expect("Compresses");
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).expect("Decompresses"), data);
    }
}
