//! Size-bounded sharding of audit payloads
//!
//! The audit backend rejects oversized messages, so request and response
//! bodies are cut into shards that are logged as separate records sharing a
//! transaction ID.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShardError {
    #[error("Shard size limit must be greater than 0")]
    ZeroLimit,
}

/// Split `body` into consecutive shards no longer than `limit` bytes.
///
/// When more than one shard is needed the body is split evenly instead of
/// greedily, so the trailing shard is not left disproportionately small.
/// The even size is rounded up so the body yields exactly
/// `ceil(len / limit)` shards.
/// An empty body yields a single empty shard.
pub fn shard(body: &[u8], limit: usize) -> Result<Vec<&[u8]>, ShardError> {
    if limit == 0 {
        return Err(ShardError::ZeroLimit);
    }

    if body.is_empty() {
        return Ok(vec![body]);
    }

    let count = body.len().div_ceil(limit);
    let shard_size = if count > 1 {
        body.len().div_ceil(count)
    } else {
        limit
    };

    Ok(body.chunks(shard_size).collect())
}
