/*******************************************************************************
 *
 * memory-attribute-manager/src/listener.rs
 *
 * The listener registry: a head-insertion-ordered collection of subscribed
 * discard listeners, each pinned to a `Section` of the managed region.
 *
 ******************************************************************************/

use crate::error::ListenerError;
use crate::section::Section;

/// A subsystem reacting to populate/discard events over a pinned section
/// (e.g. an I/O-mapping or DMA-pinning subsystem). `notify_discard` is
/// infallible: once the guest has decided a page is private the host must
/// tear down mappings regardless of listener cooperation.
pub trait Listener {
    fn notify_populate(&mut self, section: Section) -> Result<(), ListenerError>;
    fn notify_discard(&mut self, section: Section);
}

/// Opaque handle returned by [`ListenerRegistry::insert`], used to
/// unregister later. Stands in for the original's `RamDiscardListener *`
/// identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

struct Entry {
    handle: ListenerHandle,
    section: Section,
    listener: Box<dyn Listener>,
}

/// Head-insertion-ordered collection of registered listeners: each newly
/// registered listener becomes the first one visited by a broadcast, mirroring
/// the original's `QLIST_INSERT_HEAD` followed by forward `QLIST_FOREACH` —
/// the most recently registered listener sees a populate before any listener
/// registered ahead of it. Discard ordering is unspecified but must cover
/// every overlapping listener, so the same head-ordered `Vec` satisfies both.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Vec<Entry>,
    next_handle: u64,
}

impl ListenerRegistry {
    pub fn new() -> ListenerRegistry {
        ListenerRegistry { entries: Vec::new(), next_handle: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts `listener` pinned to `section` at the head of the list and
    /// returns its handle, so it is the first one visited by the next
    /// broadcast. The caller (the manager) is responsible for replaying
    /// populate callbacks for currently-shared runs — this method only
    /// performs bookkeeping.
    pub fn insert(&mut self, section: Section, listener: Box<dyn Listener>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.insert(0, Entry { handle, section, listener });
        handle
    }

    /// Removes and returns the section and listener previously registered
    /// under `handle`. Panics if `handle` is not currently registered — an
    /// unregister of an unknown listener is a programmer error.
    pub fn remove(&mut self, handle: ListenerHandle) -> (Section, Box<dyn Listener>) {
        let index = self
            .entries
            .iter()
            .position(|e| e.handle == handle)
            .unwrap_or_else(|| panic!("unregister_listener: unknown listener handle"));
        let entry = self.entries.remove(index);
        (entry.section, entry.listener)
    }

    /// Mutable access to the listener registered under `handle`. Panics if
    /// `handle` is unknown.
    pub fn get_mut(&mut self, handle: ListenerHandle) -> &mut dyn Listener {
        self.entries
            .iter_mut()
            .find(|e| e.handle == handle)
            .unwrap_or_else(|| panic!("unknown listener handle"))
            .listener
            .as_mut()
    }

    pub fn section_of(&self, handle: ListenerHandle) -> Section {
        self.entries
            .iter()
            .find(|e| e.handle == handle)
            .unwrap_or_else(|| panic!("unregister_listener: unknown listener handle"))
            .section
    }

    /// Iterates listeners in broadcast order (most recently registered
    /// first), giving mutable access to each one along with its pinned
    /// section.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Section, &mut dyn Listener)> {
        self.entries.iter_mut().map(|e| (&e.section, e.listener.as_mut()))
    }

    /// Iterates the first `n` entries (by broadcast order) mutably. Used by
    /// the populate-broadcast rollback path, which must undo exactly the
    /// listeners notified before the one that failed.
    pub fn iter_mut_take(&mut self, n: usize) -> impl Iterator<Item = (&Section, &mut dyn Listener)> {
        self.entries.iter_mut().take(n).map(|e| (&e.section, e.listener.as_mut()))
    }
}
