use serde_json::json;
use sha2::{Digest, Sha256};

use super::{ItemType, Tags, Uid};
use crate::config::UID_HASH_BYTES;

/// Deterministic uid for an item that has no explicit id
///
/// The snapshot is canonical JSON: object keys are sorted, so field order and
/// tag insertion order never influence the result.
pub fn content_uid(
    kind: ItemType,
    platform_id: Option<&str>,
    tags: &Tags,
    fields: &serde_json::Value,
) -> Uid {
    let snapshot = json!({
        "kind": kind,
        "platform_id": platform_id,
        "tags": tags,
        "fields": fields,
    });
    let digest = Sha256::digest(snapshot.to_string().as_bytes());

    let mut bytes = [0u8; UID_HASH_BYTES];
    bytes.copy_from_slice(&digest[..UID_HASH_BYTES]);
    Uid::from_bytes(bytes)
}
