/*******************************************************************************
 *
 * memory-attribute-manager/src/sections.rs
 *
 * Lazy maximal-run iteration over populated/discarded pages, clipped against
 * a query section. Mirrors
 * `memory_attribute_for_each_populated_section`/`_discarded_section` in
 * original_source/system/memory-attribute-manager.c.
 *
 ******************************************************************************/

use crate::bitmap::Bitmap;
use crate::section::Section;

/// Walks the maximal runs of *set* bits within `query`, intersected with the
/// bitmap, invoking `cb` on each non-empty clipped run in ascending order.
/// Stops early if `cb` returns a non-zero code, returning that code;
/// otherwise returns 0. Does not mutate `bitmap` or materialize the runs.
pub fn populated_sections(
    bitmap: &Bitmap,
    block_size: u64,
    query: &Section,
    mut cb: impl FnMut(Section) -> i32,
) -> i32 {
    walk(bitmap, block_size, query, true, &mut cb)
}

/// The dual of [`populated_sections`]: walks maximal runs of *clear* bits.
pub fn discarded_sections(
    bitmap: &Bitmap,
    block_size: u64,
    query: &Section,
    mut cb: impl FnMut(Section) -> i32,
) -> i32 {
    walk(bitmap, block_size, query, false, &mut cb)
}

fn walk(
    bitmap: &Bitmap,
    block_size: u64,
    query: &Section,
    want_set: bool,
    cb: &mut impl FnMut(Section) -> i32,
) -> i32 {
    if query.is_empty() {
        return 0;
    }

    let n = bitmap.len();
    let mut first_bit = (query.offset / block_size) as usize;

    loop {
        first_bit = if want_set {
            bitmap.find_next_set(first_bit, n)
        } else {
            bitmap.find_next_clear(first_bit, n)
        };
        if first_bit >= n {
            return 0;
        }

        let run_end = if want_set {
            bitmap.find_next_clear(first_bit + 1, n)
        } else {
            bitmap.find_next_set(first_bit + 1, n)
        };

        let run = Section::new(first_bit as u64 * block_size, (run_end - first_bit) as u64 * block_size);

        match run.intersect(query) {
            Some(clipped) => {
                let ret = cb(clipped);
                if ret != 0 {
                    return ret;
                }
            }
            // Runs only move forward; once one starts past the query, we're done.
            None => return 0,
        }

        first_bit = run_end;
    }
}
