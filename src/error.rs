/*******************************************************************************
 *
 * memory-attribute-manager/src/error.rs
 *
 ******************************************************************************/

//! Error taxonomy for the discard-manager façade.

use displaydoc::Display;

/// A code returned by a listener's `notify_populate` callback, preserved
/// end-to-end so the caller of [`crate::manager::DiscardManager::state_change`]
/// sees exactly what the failing listener reported.
pub type ListenerCode = i32;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// offset/size is misaligned, zero, overflowing or out of the bound region
    InvalidRange,
    /// a listener's notify_populate failed with code {0}; state rolled back
    ListenerPopulate(ListenerCode),
}

impl std::error::Error for Error {}

// Returned by a `Listener::notify_populate` implementation that fails to map
// a section. `notify_discard` is infallible (void in the original): once the
// guest calls for private, the host must tear down mappings regardless of
// listener cooperation.
/// listener populate failed with code {0}
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub struct ListenerError(pub ListenerCode);

impl std::error::Error for ListenerError {}
