use std::hash::Hasher;

use serde_json::Value;
use xxhash_rust::xxh64::Xxh64;

use crate::query::metadata::CollectionInfo;
use crate::query::value::{get_path, KEY_ATTRIBUTE};

const ROUTING_SEED: u64 = 0x5348_4152_4453;

/// Shard owning `document`, from the xxh64 hash of its shard-key values.
///
/// Missing shard-key attributes hash as `null`.
pub fn shard_for_document(info: &CollectionInfo, document: &Value) -> u32 {
    if !info.is_sharded() {
        return 0;
    }
    let mut hasher = Xxh64::new(ROUTING_SEED);
    for path in &info.shard_keys {
        hash_value(&mut hasher, get_path(document, path.steps()));
    }
    (hasher.finish() % u64::from(info.number_of_shards)) as u32
}

/// Shard owning the document with primary key `key`.
///
/// Only defined when the collection is sharded by `_key` alone; with custom
/// shard keys a key does not determine the shard.
pub fn shard_for_key(info: &CollectionInfo, key: &str) -> Option<u32> {
    if !info.is_sharded() {
        return Some(0);
    }
    if !sharded_by_key(info) {
        return None;
    }
    let mut doc = serde_json::Map::new();
    doc.insert(KEY_ATTRIBUTE.to_owned(), Value::String(key.to_owned()));
    Some(shard_for_document(info, &Value::Object(doc)))
}

/// Shard a routed row goes to, given the value of the Scatter's route variable.
///
/// Objects route by their shard-key values. A bare string is a document key.
/// With custom shard keys it still routes by the hash of that key.
pub fn shard_for_route(info: &CollectionInfo, value: &Value) -> u32 {
    match value {
        Value::String(key) => {
            let mut doc = serde_json::Map::new();
            doc.insert(KEY_ATTRIBUTE.to_owned(), Value::String(key.clone()));
            let doc = Value::Object(doc);
            if sharded_by_key(info) {
                shard_for_document(info, &doc)
            } else {
                key_hash_shard(info, key)
            }
        }
        other => shard_for_document(info, other),
    }
}

fn sharded_by_key(info: &CollectionInfo) -> bool {
    matches!(info.shard_keys.as_slice(), [only] if only.steps() == [KEY_ATTRIBUTE])
}

fn key_hash_shard(info: &CollectionInfo, key: &str) -> u32 {
    let mut hasher = Xxh64::new(ROUTING_SEED);
    hash_value(&mut hasher, &Value::String(key.to_owned()));
    (hasher.finish() % u64::from(info.number_of_shards.max(1))) as u32
}

/// Feeds a value into the hasher. Numbers hash by their `f64` value so that
/// `1` and `1.0` land on the same shard.
fn hash_value(hasher: &mut Xxh64, value: &Value) {
    match value {
        Value::Null => hasher.write_u8(0),
        Value::Bool(b) => {
            hasher.write_u8(1);
            hasher.write_u8(u8::from(*b));
        }
        Value::Number(n) => {
            hasher.write_u8(2);
            let f = n.as_f64().unwrap_or(0.0);
            let f = if f == 0.0 { 0.0 } else { f };
            hasher.write_u64(f.to_bits());
        }
        Value::String(s) => {
            hasher.write_u8(3);
            hasher.write_u64(s.len() as u64);
            hasher.write(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.write_u8(4);
            hasher.write_u64(items.len() as u64);
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.write_u8(5);
            hasher.write_u64(map.len() as u64);
            for (k, v) in map {
                hasher.write(k.as_bytes());
                hash_value(hasher, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unsharded_collections_use_shard_zero() {
        let info = CollectionInfo::new("c", 0);
        assert_eq!(shard_for_document(&info, &json!({"_key": "a"})), 0);
        assert_eq!(shard_for_key(&info, "a"), Some(0));
    }

    #[test]
    fn key_and_document_routing_agree() {
        let info = CollectionInfo::new("c", 0).with_shards(5, &[]);
        for key in ["a", "b", "alpha", "1234"] {
            let by_doc = shard_for_document(&info, &json!({"_key": key, "v": 1}));
            assert_eq!(shard_for_key(&info, key), Some(by_doc));
            assert_eq!(shard_for_route(&info, &json!(key)), by_doc);
            assert!(by_doc < 5);
        }
    }

    #[test]
    fn custom_shard_keys_ignore_other_attributes() {
        let info = CollectionInfo::new("c", 0).with_shards(4, &["region"]);
        let a = shard_for_document(&info, &json!({"_key": "1", "region": "eu"}));
        let b = shard_for_document(&info, &json!({"_key": "2", "region": "eu", "x": 3}));
        assert_eq!(a, b);
        assert_eq!(shard_for_key(&info, "1"), None);
    }

    #[test]
    fn integral_floats_route_like_integers() {
        let info = CollectionInfo::new("c", 0).with_shards(7, &["n"]);
        assert_eq!(
            shard_for_document(&info, &json!({"n": 3})),
            shard_for_document(&info, &json!({"n": 3.0}))
        );
    }

    #[test]
    fn missing_shard_key_routes_like_null() {
        let info = CollectionInfo::new("c", 0).with_shards(3, &["region"]);
        assert_eq!(
            shard_for_document(&info, &json!({"_key": "x"})),
            shard_for_document(&info, &json!({"region": null}))
        );
    }
}
