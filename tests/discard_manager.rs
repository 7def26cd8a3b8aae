/*******************************************************************************
 *
 * memory-attribute-manager/tests/discard_manager.rs
 *
 * End-to-end coverage of the public API, as a second listener would see it:
 * register against a region, drive state changes, observe what comes back
 * out through replay. Complements the colocated unit tests in src/manager.rs,
 * which exercise the internal classification branches directly.
 *
 ******************************************************************************/

use memory_attribute_manager::{DiscardManager, Error, GuestRegion, Listener, ListenerError, Section};
use std::cell::RefCell;
use std::rc::Rc;

const PAGE: u64 = 4096;
const PAGES: u64 = 32;

fn init_logging() {
    let _ = env_logger::try_init();
}

struct Region {
    size: u64,
}

impl GuestRegion for Region {
    fn size(&self) -> u64 {
        self.size
    }
    fn page_size(&self) -> u64 {
        PAGE
    }
}

#[derive(Default)]
struct Mapper {
    mapped: Vec<Section>,
    unmapped: Vec<Section>,
}

#[derive(Clone, Default)]
struct SharedMapper(Rc<RefCell<Mapper>>);

impl SharedMapper {
    fn mapped(&self) -> Vec<Section> {
        self.0.borrow().mapped.clone()
    }
    fn unmapped(&self) -> Vec<Section> {
        self.0.borrow().unmapped.clone()
    }
}

impl Listener for SharedMapper {
    fn notify_populate(&mut self, section: Section) -> Result<(), ListenerError> {
        self.0.borrow_mut().mapped.push(section);
        Ok(())
    }

    fn notify_discard(&mut self, section: Section) {
        self.0.borrow_mut().unmapped.push(section);
    }
}

#[test]
fn new_region_reports_as_fully_private_via_replay() {
    init_logging();
    let region = Region { size: PAGES * PAGE };
    let mgr = DiscardManager::realize(&region);

    let mut discarded = Vec::new();
    mgr.replay_discarded(&Section::new(0, PAGES * PAGE), |s| {
        discarded.push(s);
        0
    });
    assert_eq!(discarded, vec![Section::new(0, PAGES * PAGE)]);

    let mut populated = Vec::new();
    mgr.replay_populated(&Section::new(0, PAGES * PAGE), |s| {
        populated.push(s);
        0
    });
    assert!(populated.is_empty());
}

#[test]
fn io_mapping_subsystem_sees_every_share_and_unshare() {
    init_logging();
    let region = Region { size: PAGES * PAGE };
    let mut mgr = DiscardManager::realize(&region);

    let mapper = SharedMapper::default();
    let handle = mgr.register_listener(Section::new(0, PAGES * PAGE), Box::new(mapper.clone()));

    // Guest shares a window, then part of it goes back private.
    mgr.state_change(4 * PAGE, 8 * PAGE, false).expect("share");
    assert_eq!(mapper.mapped(), vec![Section::new(4 * PAGE, 8 * PAGE)]);

    mgr.state_change(6 * PAGE, 2 * PAGE, true).expect("unshare middle");
    assert_eq!(mapper.unmapped(), vec![Section::new(6 * PAGE, 2 * PAGE)]);

    assert!(mgr.is_populated(&Section::new(4 * PAGE, 2 * PAGE)));
    assert!(!mgr.is_populated(&Section::new(4 * PAGE, 8 * PAGE)));

    mgr.unregister_listener(handle);
    // Unregister tore down the two surviving shared runs flanking the hole.
    assert_eq!(
        mapper.unmapped()[1..],
        [Section::new(4 * PAGE, 2 * PAGE), Section::new(8 * PAGE, 4 * PAGE)]
    );
}

#[test]
fn late_registration_only_replays_currently_shared_pages() {
    init_logging();
    let region = Region { size: PAGES * PAGE };
    let mut mgr = DiscardManager::realize(&region);

    mgr.state_change(0, 2 * PAGE, false).expect("pre-share");
    mgr.state_change(10 * PAGE, PAGE, false).expect("pre-share 2");

    let mapper = SharedMapper::default();
    mgr.register_listener(Section::new(0, PAGES * PAGE), Box::new(mapper.clone()));

    assert_eq!(
        mapper.mapped(),
        vec![Section::new(0, 2 * PAGE), Section::new(10 * PAGE, PAGE)]
    );
}

#[test]
fn a_misbehaving_listener_cannot_leave_the_manager_in_a_half_shared_state() {
    init_logging();
    let region = Region { size: PAGES * PAGE };
    let mut mgr = DiscardManager::realize(&region);

    struct Refuser;
    impl Listener for Refuser {
        fn notify_populate(&mut self, _section: Section) -> Result<(), ListenerError> {
            Err(ListenerError(-12))
        }
        fn notify_discard(&mut self, _section: Section) {}
    }

    let observer = SharedMapper::default();
    // Refuser registers first, landing at the tail of the broadcast order;
    // observer registers second and sits at the head, so it is actually
    // notified before Refuser's failure is reached.
    mgr.register_listener(Section::new(0, PAGES * PAGE), Box::new(Refuser));
    mgr.register_listener(Section::new(0, PAGES * PAGE), Box::new(observer.clone()));

    let err = mgr.state_change(0, 4 * PAGE, false).unwrap_err();
    assert_eq!(err, Error::ListenerPopulate(-12));

    // The bitmap never recorded the pages as shared, and observer, which did
    // accept them, was told to drop them again.
    assert!(!mgr.is_populated(&Section::new(0, 4 * PAGE)));
    assert!(!observer.mapped().is_empty());
    assert_eq!(observer.mapped(), observer.unmapped());
}

#[test]
fn out_of_bounds_and_misaligned_requests_are_rejected() {
    init_logging();
    let region = Region { size: PAGES * PAGE };
    let mut mgr = DiscardManager::realize(&region);

    assert_eq!(mgr.state_change(PAGES * PAGE, PAGE, false), Err(Error::InvalidRange));
    assert_eq!(mgr.state_change(0, PAGE / 2, false), Err(Error::InvalidRange));
    assert_eq!(mgr.state_change(1, PAGE, false), Err(Error::InvalidRange));
}
