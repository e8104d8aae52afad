//! Splits outbound object lists into batches small enough to post.
use crate::error::{PipeError, PipeResult};
use serde::Serialize;

/// Upper bound for one serialized batch.
pub const MAX_PAYLOAD_SIZE: usize = 800_000;

/// Splits `objects` into at least `min_parts` contiguous batches, each
/// serialized below [`MAX_PAYLOAD_SIZE`].
pub fn split<T: Serialize>(objects: &[T], min_parts: usize) -> PipeResult<Vec<Vec<u8>>> {
    split_with_limit(objects, min_parts, MAX_PAYLOAD_SIZE)
}

/// Same as [`split`] with an explicit ceiling.
///
/// Each attempt divides the list into `parts` near-equal batches with the
/// last batch taking the remainder. When any batch serializes above `limit`
/// the whole split is redone with one more part. Once every batch holds a
/// single object and one of them is still too large the split fails with
/// [`PipeError::PayloadTooLarge`]. An empty list yields no batches.
pub fn split_with_limit<T: Serialize>(
    objects: &[T],
    min_parts: usize,
    limit: usize,
) -> PipeResult<Vec<Vec<u8>>> {
    if objects.is_empty() {
        return Ok(Vec::new());
    }

    let mut parts = min_parts.clamp(1, objects.len());
    loop {
        let batches = serialize_parts(objects, parts)?;
        match batches.iter().map(Vec::len).max() {
            Some(largest) if largest > limit => {
                if parts >= objects.len() {
                    return Err(PipeError::PayloadTooLarge {
                        object_type: short_type_name::<T>(),
                        size: largest,
                        limit,
                    });
                }
                parts += 1;
            }
            _ => return Ok(batches),
        }
    }
}

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

fn serialize_parts<T: Serialize>(objects: &[T], parts: usize) -> PipeResult<Vec<Vec<u8>>> {
    let size = objects.len() / parts;
    let mut batches = Vec::with_capacity(parts);
    for i in 0..parts {
        let start = i * size;
        let end = if i == parts - 1 {
            objects.len()
        } else {
            start + size
        };
        batches.push(serde_json::to_vec(&objects[start..end])?);
    }
    Ok(batches)
}
