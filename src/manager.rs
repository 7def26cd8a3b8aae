/*******************************************************************************
 *
 * memory-attribute-manager/src/manager.rs
 *
 * The discard-manager façade and the state-change engine. Ports
 * original_source/system/memory-attribute-manager.c's
 * `memory_attribute_state_change` and friends, generalizing the original's
 * object-system plumbing into a plain owned value.
 *
 ******************************************************************************/

use crate::bitmap::Bitmap;
use crate::error::{Error, ListenerError};
use crate::listener::{Listener, ListenerHandle, ListenerRegistry};
use crate::region::GuestRegion;
use crate::section::{self, Section};
use crate::sections;

/// Tracks the shared/private attribute of every page in one bound guest
/// memory region and notifies registered discard listeners of transitions.
///
/// Single-threaded cooperative: every mutating method takes `&mut self` and
/// performs no internal locking. The embedding application is the mutual
/// exclusion domain — a listener callback must not re-enter the same
/// manager.
pub struct DiscardManager {
    region_size: u64,
    block_size: u64,
    bitmap: Bitmap,
    listeners: ListenerRegistry,
}

impl DiscardManager {
    /// Binds a freshly allocated manager to `region`. The bitmap starts all
    /// clear: the region begins fully private. Must be called
    /// before any listener may register.
    pub fn realize<R: GuestRegion>(region: &R) -> DiscardManager {
        let block_size = region.page_size();
        debug_assert_eq!(
            block_size,
            crate::region::host_page_size(),
            "realize: region page size must equal the host real page size"
        );

        let region_size = region.size();
        let bits = region_size.div_ceil(block_size) as usize;

        DiscardManager {
            region_size,
            block_size,
            bitmap: Bitmap::new(bits),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Releases the bitmap. Concurrent operations during unrealize are
    /// undefined behavior at the API level — quiescing is the caller's
    /// responsibility.
    pub fn unrealize(self) {
        drop(self)
    }

    /// The page granularity `B`, asserting `region` is the one this manager
    /// was realized against (mirrors `g_assert(mr == mgr->mr)` in the
    /// original; we don't retain a pointer to the region, so this is a
    /// value-identity check on size instead of object identity).
    pub fn min_granularity(&self, region: &dyn GuestRegion) -> u64 {
        debug_assert_eq!(region.size(), self.region_size, "min_granularity: wrong region");
        self.block_size
    }

    /// Whether every page in `section` is currently shared.
    pub fn is_populated(&self, section: &Section) -> bool {
        self.is_range_populated(section.offset, section.size)
    }

    fn is_range_populated(&self, offset: u64, size: u64) -> bool {
        let bits = section::bit_range(self.block_size, offset, size);
        self.bitmap.find_next_clear(bits.start, bits.end) >= bits.end
    }

    fn is_range_discarded(&self, offset: u64, size: u64) -> bool {
        let bits = section::bit_range(self.block_size, offset, size);
        self.bitmap.find_next_set(bits.start, bits.end) >= bits.end
    }

    /// Registers `listener` over `section`, which must lie entirely within
    /// the managed region. Replays a `notify_populate` for every currently-
    /// shared run intersecting `section`. A replay failure is logged and
    /// does **not** remove the listener or report an error: the caller
    /// expects the listener to end up registered even if some initial
    /// populations failed.
    pub fn register_listener(&mut self, section: Section, listener: Box<dyn Listener>) -> ListenerHandle {
        assert!(
            section.is_within(self.region_size),
            "register_listener: section must lie within the managed region"
        );

        let handle = self.listeners.insert(section, listener);

        let bitmap = &self.bitmap;
        let block_size = self.block_size;
        let listener = self.listeners.get_mut(handle);
        let ret = sections::populated_sections(bitmap, block_size, &section, |run| {
            match listener.notify_populate(run) {
                Ok(()) => 0,
                Err(ListenerError(code)) => code,
            }
        });

        if ret != 0 {
            log::warn!(
                "register_listener: replay populate failed with code {ret}; listener remains registered"
            );
        }

        handle
    }

    /// Unregisters a previously-registered listener, delivering a
    /// `notify_discard` for every currently-shared run in its section —
    /// balancing the populate callbacks it previously received so its view
    /// is fully torn down.
    pub fn unregister_listener(&mut self, handle: ListenerHandle) {
        let section = self.listeners.section_of(handle);

        let bitmap = &self.bitmap;
        let block_size = self.block_size;
        let listener = self.listeners.get_mut(handle);
        sections::populated_sections(bitmap, block_size, &section, |run| {
            listener.notify_discard(run);
            0
        });

        self.listeners.remove(handle);
    }

    /// Walks the maximal populated runs within `section`, invoking `f` on
    /// each. Propagates the first non-zero code `f` returns. Lets new
    /// consumers (e.g. migration) enumerate shared runs without subscribing.
    pub fn replay_populated(&self, section: &Section, f: impl FnMut(Section) -> i32) -> i32 {
        sections::populated_sections(&self.bitmap, self.block_size, section, f)
    }

    /// The dual of [`Self::replay_populated`] over discarded (private) runs.
    pub fn replay_discarded(&self, section: &Section, f: impl FnMut(Section) -> i32) -> i32 {
        sections::discarded_sections(&self.bitmap, self.block_size, section, f)
    }

    /// Applies a shared↔private transition to `[offset, offset + size)`.
    ///
    /// Validates the range, classifies its current state (fully populated,
    /// fully discarded, or mixed), mutates the bitmap, and notifies
    /// listeners. On `Err`, the bitmap and every listener's view are
    /// restored to exactly the pre-call state.
    pub fn state_change(&mut self, offset: u64, size: u64, to_private: bool) -> Result<(), Error> {
        if !section::is_valid_range(self.region_size, self.block_size, offset, size) {
            log::error!("state_change: invalid range offset={offset:#x} size={size:#x}");
            return Err(Error::InvalidRange);
        }

        if to_private {
            self.state_change_to_private(offset, size);
            Ok(())
        } else {
            self.state_change_to_shared(offset, size)
        }
    }

    fn state_change_to_private(&mut self, offset: u64, size: u64) {
        let bits = section::bit_range(self.block_size, offset, size);

        if self.is_range_discarded(offset, size) {
            return; // already fully private
        }

        if self.is_range_populated(offset, size) {
            self.bitmap.clear_range(bits.start, bits.end);
            self.notify_discard_all_listeners(offset, size);
            return;
        }

        // Mixed: walk page by page, only touching (and notifying for) pages
        // that were actually shared.
        let mut cur = offset;
        while cur < offset + size {
            let bit = (cur / self.block_size) as usize;
            if self.bitmap.test_bit(bit) {
                self.bitmap.clear(bit);
                self.notify_discard_all_listeners(cur, self.block_size);
            }
            cur += self.block_size;
        }
    }

    fn state_change_to_shared(&mut self, offset: u64, size: u64) -> Result<(), Error> {
        let bits = section::bit_range(self.block_size, offset, size);

        if self.is_range_populated(offset, size) {
            return Ok(()); // already fully shared
        }

        if self.is_range_discarded(offset, size) {
            self.bitmap.set_range(bits.start, bits.end);
            if let Err(err) = self.notify_populate_all_listeners(offset, size) {
                self.bitmap.clear_range(bits.start, bits.end);
                return Err(err);
            }
            return Ok(());
        }

        // Mixed: page by page, undoing exactly the pages we converted if any
        // populate callback fails partway through.
        let mut modified = Vec::new();
        let mut cur = offset;
        let mut failure = None;

        while cur < offset + size {
            let bit = (cur / self.block_size) as usize;
            if self.bitmap.test_bit(bit) {
                cur += self.block_size;
                continue;
            }

            self.bitmap.set(bit);
            match self.notify_populate_all_listeners(cur, self.block_size) {
                Ok(()) => modified.push(bit),
                Err(err) => {
                    self.bitmap.clear(bit);
                    failure = Some(err);
                    break;
                }
            }
            cur += self.block_size;
        }

        if let Some(err) = failure {
            for bit in modified {
                self.bitmap.clear(bit);
                let cur = bit as u64 * self.block_size;
                self.notify_discard_all_listeners(cur, self.block_size);
            }
            return Err(err);
        }

        Ok(())
    }

    /// Infallible: for each listener, clip `[offset, offset + size)` against
    /// its section and deliver `notify_discard` if non-empty.
    fn notify_discard_all_listeners(&mut self, offset: u64, size: u64) {
        for (section, listener) in self.listeners.iter_mut() {
            if let Some(clip) = section.intersect_range(offset, size) {
                listener.notify_discard(clip);
            }
        }
    }

    /// Delivers `notify_populate` to every listener overlapping
    /// `[offset, offset + size)`, most recently registered first. On the
    /// first failure, rolls back by delivering `notify_discard` to every
    /// listener notified so far (preserving the populate/discard alternation
    /// for each of them) and returns the error.
    fn notify_populate_all_listeners(&mut self, offset: u64, size: u64) -> Result<(), Error> {
        let mut failed_at = None;

        for (index, (section, listener)) in self.listeners.iter_mut().enumerate() {
            let Some(clip) = section.intersect_range(offset, size) else {
                continue;
            };
            if let Err(ListenerError(code)) = listener.notify_populate(clip) {
                failed_at = Some((index, code));
                break;
            }
        }

        match failed_at {
            None => Ok(()),
            Some((index, code)) => {
                for (section, listener) in self.listeners.iter_mut_take(index) {
                    if let Some(clip) = section.intersect_range(offset, size) {
                        listener.notify_discard(clip);
                    }
                }
                Err(Error::ListenerPopulate(code))
            }
        }
    }
}

/// The capability record the region layer would retrieve from a region and
/// call through. `DiscardManager` implements this directly; `state_change` is
/// deliberately *not* part of it, mirroring the original where it's a
/// subclass method rather than part of the generic `RamDiscardManager`
/// interface.
pub trait DiscardManagerCapability {
    fn min_granularity(&self, region: &dyn GuestRegion) -> u64;
    fn is_populated(&self, section: &Section) -> bool;
    fn register_listener(&mut self, section: Section, listener: Box<dyn Listener>) -> ListenerHandle;
    fn unregister_listener(&mut self, handle: ListenerHandle);
    fn replay_populated(&self, section: &Section, f: &mut dyn FnMut(Section) -> i32) -> i32;
    fn replay_discarded(&self, section: &Section, f: &mut dyn FnMut(Section) -> i32) -> i32;
}

impl DiscardManagerCapability for DiscardManager {
    fn min_granularity(&self, region: &dyn GuestRegion) -> u64 {
        DiscardManager::min_granularity(self, region)
    }

    fn is_populated(&self, section: &Section) -> bool {
        DiscardManager::is_populated(self, section)
    }

    fn register_listener(&mut self, section: Section, listener: Box<dyn Listener>) -> ListenerHandle {
        DiscardManager::register_listener(self, section, listener)
    }

    fn unregister_listener(&mut self, handle: ListenerHandle) {
        DiscardManager::unregister_listener(self, handle)
    }

    fn replay_populated(&self, section: &Section, f: &mut dyn FnMut(Section) -> i32) -> i32 {
        DiscardManager::replay_populated(self, section, f)
    }

    fn replay_discarded(&self, section: &Section, f: &mut dyn FnMut(Section) -> i32) -> i32 {
        DiscardManager::replay_discarded(self, section, f)
    }
}
