//! Size and pointer maintenance after a byte-range edit
//!
//! Any splice inside a BMFF file changes the length of every box enclosing the
//! edit, and moves every byte behind it. The two passes here repair both:
//! [`resize`] rewrites the ancestor size fields, and [`fixup_pointers`] moves
//! the `iloc` offsets that point past the edit.

use crate::{
    containers::bmff::{fourcc_str, BoxDecoder, BoxRecord, BoxSpan, BoxType, HEADER_SIZE},
    cursor::BinaryCursor,
    error::{Error, Result},
    schema::IlocBox,
};

fn shifted(value: u64, delta: i64, offset: usize) -> Result<u64> {
    let moved = i128::from(value) + i128::from(delta);
    u64::try_from(moved).map_err(|_| {
        Error::malformed(offset, format!("offset {} cannot move by {}", value, delta))
    })
}

/// Add `delta` to the size field of every box in `path`
///
/// `path` lists the boxes enclosing the edit; they all start before it, so
/// their offsets are still valid after the splice.
pub(crate) fn resize(cursor: &mut BinaryCursor, path: &[BoxSpan], delta: i64) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    for span in path {
        let new_size = shifted(span.size as u64, delta, span.offset)?;
        if span.large_size() {
            cursor.write_u64(span.offset + 8, new_size)?;
        } else {
            let size = u32::try_from(new_size).map_err(|_| {
                Error::unsupported(format!(
                    "{} box would grow past the 32-bit size field",
                    fourcc_str(&span.fourcc)
                ))
            })?;
            cursor.write_u32(span.offset, size)?;
        }
        log::trace!(
            "resized {} at {}: {} -> {}",
            fourcc_str(&span.fourcc),
            span.offset,
            span.size,
            new_size
        );
    }
    Ok(())
}

/// Shift every in-file `iloc` offset at or beyond `threshold` by `delta`
///
/// When an item has a base_offset field at or beyond the threshold, the base
/// moves and its extents stay relative to it. Otherwise each extent whose
/// absolute position is at or beyond the threshold moves. Values are written
/// back with the box's existing widths; a value that no longer fits is an
/// error. Files without `meta/iloc` need no fixup.
pub(crate) fn fixup_pointers(cursor: &mut BinaryCursor, threshold: usize, delta: i64) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    let path = match BoxDecoder::find_path(cursor.as_bytes(), &[BoxType::Meta, BoxType::Iloc])? {
        Some(path) => path,
        None => return Ok(()),
    };
    let span = path[path.len() - 1];
    let record = BoxRecord {
        span,
        payload: cursor.slice(span.payload_range())?,
    };
    let mut iloc = IlocBox::read(&record)?;

    let threshold = threshold as u64;
    let has_base = iloc.base_offset_size > 0;
    let mut moved = 0usize;
    for item in iloc.items.iter_mut().filter(|item| item.in_file()) {
        if has_base && item.base_offset >= threshold {
            item.base_offset = shifted(item.base_offset, delta, span.offset)?;
            moved += 1;
            continue;
        }
        let base = item.base_offset;
        for extent in &mut item.extents {
            if base.saturating_add(extent.offset) >= threshold {
                extent.offset = shifted(extent.offset, delta, span.offset)?;
                moved += 1;
            }
        }
    }
    if moved == 0 {
        return Ok(());
    }

    let encoded = iloc.encode()?;
    let payload = &encoded[HEADER_SIZE..];
    if payload.len() != span.size - span.header_len {
        return Err(Error::malformed(span.offset, "iloc re-encoding changed its size"));
    }
    cursor.overwrite(span.payload_start(), payload)?;
    log::debug!(
        "moved {} iloc offsets at or past {} by {}",
        moved,
        threshold,
        delta
    );
    Ok(())
}

/// Replace `remove` bytes at `pos` inside `path`, then repair sizes and offsets
///
/// Pure insertions move pointers at or after `pos`; replacements and removals
/// move pointers at or after the old end of the edited range.
pub(crate) fn splice(
    cursor: &mut BinaryCursor,
    path: &[BoxSpan],
    pos: usize,
    remove: usize,
    insert: &[u8],
) -> Result<i64> {
    debug_assert!(path.iter().all(|span| span.offset < pos && pos + remove <= span.end()));
    let threshold = pos + remove;
    let delta = cursor.splice(pos, remove, insert)?;
    resize(cursor, path, delta)?;
    fixup_pointers(cursor, threshold, delta)?;
    Ok(delta)
}
