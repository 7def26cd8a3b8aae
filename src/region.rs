/*******************************************************************************
 *
 * memory-attribute-manager/src/region.rs
 *
 * The narrow interface the core consumes from the memory-region layer. The
 * region abstraction itself — size, clipping, the actual host mapping — is
 * out of scope; this trait is the seam.
 *
 ******************************************************************************/

/// The subset of a guest memory region the manager needs to bind to it:
/// its size and its page granularity. Implemented by the surrounding
/// region layer, not by this crate.
pub trait GuestRegion {
    /// Total size of the region in bytes.
    fn size(&self) -> u64;

    /// The region's page size, which becomes the manager's block size `B`.
    /// Must equal [`host_page_size`] — `realize` asserts this, matching the
    /// original's `g_assert(mr->ram_block->page_size == qemu_real_host_page_size())`.
    fn page_size(&self) -> u64;
}

/// The host's real page size. A single constant stands in for
/// `qemu_real_host_page_size()`; callers needing the platform's actual value
/// should source it from their OS layer and implement [`GuestRegion::page_size`]
/// accordingly; this is merely the default most hosts (and all tests in this
/// crate) use.
pub fn host_page_size() -> u64 {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRegion {
        size: u64,
        page_size: u64,
    }

    impl GuestRegion for FakeRegion {
        fn size(&self) -> u64 {
            self.size
        }
        fn page_size(&self) -> u64 {
            self.page_size
        }
    }

    #[test]
    fn fake_region_reports_its_fields() {
        let r = FakeRegion { size: 16 * host_page_size(), page_size: host_page_size() };
        assert_eq!(r.size(), 16 * 4096);
        assert_eq!(r.page_size(), host_page_size());
    }
}
