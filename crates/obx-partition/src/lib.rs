//! Deterministic key-to-partition and partition-to-owner mapping.
//!
//! Partitioning has no external coordinator: every instance computes the
//! same partition for the same key, and the same owner for the same
//! partition given the same live-instance set, using nothing but a hash
//! function and a sort. No locks, no lease service, no gossip protocol.

use obx_schemas::Instance;

/// Number of logical partitions the keyspace is divided into. Fixed at
/// compile time: raising it would redistribute every existing key, so it
/// is not a runtime configuration knob.
pub const PARTITION_COUNT: u16 = 256;

/// MurmurHash3 (x86, 32-bit) over a single byte slice, seed 0.
///
/// Reimplemented here rather than pulled from a crate: the dispatcher's
/// partition assignment is a cross-language wire contract (any producer
/// or sibling implementation must compute the identical partition for a
/// given key), so the exact algorithm is pinned in source rather than
/// left to whatever a dependency's major version happens to do.
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut hash = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k = u32::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);

        hash ^= k;
        hash = hash.rotate_left(13);
        hash = hash.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let mut k1: u32 = 0;
    match tail.len() {
        3 => {
            k1 ^= (tail[2] as u32) << 16;
            k1 ^= (tail[1] as u32) << 8;
            k1 ^= tail[0] as u32;
            k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
            hash ^= k1;
        }
        2 => {
            k1 ^= (tail[1] as u32) << 8;
            k1 ^= tail[0] as u32;
            k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
            hash ^= k1;
        }
        1 => {
            k1 ^= tail[0] as u32;
            k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
            hash ^= k1;
        }
        _ => {}
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85ebca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2ae35);
    hash ^= hash >> 16;
    hash
}

/// Maps a record key to its partition in `0..PARTITION_COUNT`.
pub fn partition_of(key: &str) -> u16 {
    (murmur3_32(key.as_bytes(), 0) % PARTITION_COUNT as u32) as u16
}

/// Determines which live instance owns a given partition.
///
/// Instances are sorted lexicographically by `instance_id` so every
/// process derives the same ordering from the same registry snapshot,
/// then the partition index is taken modulo the instance count. This is
/// deliberately simpler than a consistent-hash ring: on membership
/// change it reshuffles a large fraction of partitions, but it needs no
/// extra state and is trivial to reason about. A ring is a reasonable
/// upgrade if redistribution churn ever becomes a problem.
///
/// Returns `None` if `instances` is empty — there is no owner for any
/// partition when the cluster has no live members.
pub fn owner_of<'a>(partition: u16, instances: &'a [Instance]) -> Option<&'a Instance> {
    if instances.is_empty() {
        return None;
    }
    let mut sorted: Vec<&Instance> = instances.iter().collect();
    sorted.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    let idx = (partition as usize) % sorted.len();
    Some(sorted[idx])
}

/// Convenience: is `instance_id` the owner of `key` given the current
/// live-instance set?
pub fn owns_key(instance_id: &str, key: &str, instances: &[Instance]) -> bool {
    let p = partition_of(key);
    owner_of(p, instances).map(|i| i.instance_id.as_str()) == Some(instance_id)
}
