use std::sync::Arc;

use matches::assert_matches;

use crate::gap::uuid16;
use crate::gatt::{AttrInfo, AttrVal, ChrcVal, Declaration, Perm, Prop, ServiceVal};
use crate::testutil::{hdl, no_match_filter, pair, FakeStack};
use crate::SyncMutex;

use super::*;

const CONN: ConnId = ConnId(1);

#[derive(Debug, PartialEq)]
enum Outcome {
    Completed(usize),
    NotFound,
    Error(Error),
}

#[derive(Default)]
struct Recorder(SyncMutex<Vec<Outcome>>);

impl Recorder {
    fn take(&self) -> Vec<Outcome> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl DiscoveryCallbacks for Recorder {
    fn completed(&self, dm: &DiscoveryManager) {
        self.0.lock().push(Outcome::Completed(dm.attr_count()));
    }

    fn service_not_found(&self, conn: ConnId) {
        assert_eq!(conn, CONN);
        self.0.lock().push(Outcome::NotFound);
    }

    fn error_found(&self, conn: ConnId, err: Error) {
        assert_eq!(conn, CONN);
        self.0.lock().push(Outcome::Error(err));
    }
}

fn setup(stack: Arc<FakeStack>) -> (Arc<DiscoveryManager>, Arc<Recorder>) {
    let (client, _host, _ctp, _htp) = pair(stack);
    let rec = Arc::new(Recorder::default());
    let dm = DiscoveryManager::new(client, Arc::clone(&rec) as _);
    (dm, rec)
}

#[test]
fn full_discovery() {
    let (dm, rec) = setup(FakeStack::heart_rate());
    dm.start(CONN, Some(uuid16(0x180D).as_uuid())).unwrap();
    assert_eq!(rec.take(), vec![Outcome::Completed(4)]);

    let svc = dm.service().unwrap();
    assert_eq!(svc.handle, hdl(1));
    assert_eq!(svc.uuid, Declaration::PrimaryService.uuid());
    assert_eq!(
        svc.val,
        Some(AttrVal::Service(ServiceVal {
            uuid: Some(uuid16(0x180D).as_uuid()),
            end: hdl(5),
        }))
    );

    // Characteristic declarations carry their merged values
    let chrc = dm.char_next(None).unwrap();
    assert_eq!(chrc.handle, hdl(3));
    assert_eq!(
        chrc.val,
        Some(AttrVal::Chrc(ChrcVal {
            uuid: Some(uuid16(0x2A37).as_uuid()),
            value_handle: hdl(4),
            props: Prop::NOTIFY,
        }))
    );
    assert_eq!(dm.char_next(Some(hdl(3))), None);
    assert_eq!(dm.char_by_uuid(uuid16(0x2A37).as_uuid()).unwrap().handle, hdl(3));
    assert_eq!(dm.char_by_uuid(uuid16(0x2A38).as_uuid()), None);

    assert_eq!(dm.attr_by_handle(hdl(4)).unwrap().uuid, uuid16(0x2A37).as_uuid());
    assert_eq!(dm.attr_by_handle(hdl(2)), None);
    assert_eq!(dm.attr_next(hdl(1)).unwrap().handle, hdl(3));
    assert_eq!(dm.attr_next(hdl(5)), None);

    // Descriptor walk stays within the characteristic
    assert_eq!(dm.desc_next(hdl(4)).unwrap().handle, hdl(5));
    assert_eq!(dm.desc_next(hdl(1)), None); // next attribute declares a characteristic
    let ccc = dm.desc_by_uuid(hdl(3), crate::gatt::Descriptor::Ccc.uuid()).unwrap();
    assert_eq!(ccc.handle, hdl(5));
    assert_eq!(ccc.perm, Perm::READ | Perm::WRITE);

    // Still locked until the data is released
    assert_eq!(dm.start(CONN, None), Err(Error::Busy));
    assert_eq!(dm.attr_count(), 4);

    dm.release_data().unwrap();
    assert_eq!(dm.attr_count(), 0);
    assert_eq!(dm.service(), None);
    assert_eq!(dm.release_data(), Err(Error::NoData));
}

#[test]
fn rejects_32bit_filter() {
    let (dm, rec) = setup(FakeStack::heart_rate());
    let u32_uuid = crate::gap::Uuid::try_from(&[0, 0, 1, 0][..]).unwrap();
    assert_eq!(dm.start(CONN, Some(u32_uuid)), Err(Error::InvalidFilter));
    assert!(rec.take().is_empty());
    // The lock was never taken
    dm.start(CONN, None).unwrap();
}

#[test]
fn service_not_found() {
    let (dm, rec) = setup(FakeStack::heart_rate());
    dm.start(CONN, no_match_filter()).unwrap();
    assert_eq!(rec.take(), vec![Outcome::NotFound]);
    assert_eq!(dm.attr_count(), 0);
    // The manager is reusable right away
    dm.start(CONN, Some(uuid16(0x180D).as_uuid())).unwrap();
    assert_eq!(rec.take(), vec![Outcome::Completed(4)]);
}

#[test]
fn empty_service_completes_without_enumeration() {
    let stack = FakeStack::new(vec![AttrInfo {
        handle: hdl(7),
        perm: Perm::READ,
        uuid: Declaration::PrimaryService.uuid(),
        val: Some(AttrVal::Service(ServiceVal {
            uuid: Some(uuid16(0x1800).as_uuid()),
            end: hdl(7),
        })),
    }]);
    let (dm, rec) = setup(stack);
    dm.start(CONN, None).unwrap();
    assert_eq!(rec.take(), vec![Outcome::Completed(1)]);
    assert_eq!(dm.service().unwrap().handle, hdl(7));
    assert_eq!(dm.char_next(None), None);
}

fn two_empty_services() -> Arc<FakeStack> {
    let svc = |h: u16, u: u16| AttrInfo {
        handle: hdl(h),
        perm: Perm::READ,
        uuid: Declaration::PrimaryService.uuid(),
        val: Some(AttrVal::Service(ServiceVal {
            uuid: Some(uuid16(u).as_uuid()),
            end: hdl(h),
        })),
    };
    FakeStack::new(vec![svc(1, 0x1800), svc(5, 0x1801)])
}

#[test]
fn resume_walks_remaining_services() {
    let (dm, rec) = setup(two_empty_services());
    dm.start(CONN, None).unwrap();
    assert_eq!(rec.take(), vec![Outcome::Completed(1)]);
    assert_eq!(dm.service().unwrap().handle, hdl(1));

    // Data must be released before continuing
    assert_eq!(dm.resume(CONN), Err(Error::Busy));
    dm.release_data().unwrap();

    dm.resume(CONN).unwrap();
    assert_eq!(rec.take(), vec![Outcome::Completed(1)]);
    assert_eq!(dm.service().unwrap().handle, hdl(5));
    dm.release_data().unwrap();

    dm.resume(CONN).unwrap();
    assert_eq!(rec.take(), vec![Outcome::NotFound]);
}

#[test]
fn resume_rejected_after_filtered_discovery() {
    let (dm, rec) = setup(FakeStack::heart_rate());
    dm.start(CONN, Some(uuid16(0x180D).as_uuid())).unwrap();
    assert_eq!(rec.take(), vec![Outcome::Completed(4)]);
    dm.release_data().unwrap();
    assert_eq!(dm.resume(CONN), Err(Error::InvalidFilter));
}

#[test]
fn resume_without_previous_run() {
    let (dm, _rec) = setup(FakeStack::heart_rate());
    assert_eq!(dm.resume(CONN), Err(Error::NoData));
}

#[test]
fn storage_exhaustion_unwinds() {
    let mut attrs = vec![AttrInfo {
        handle: hdl(1),
        perm: Perm::READ,
        uuid: Declaration::PrimaryService.uuid(),
        val: Some(AttrVal::Service(ServiceVal {
            uuid: Some(uuid16(0x1800).as_uuid()),
            end: hdl(60),
        })),
    }];
    for h in 2..=51 {
        attrs.push(AttrInfo {
            handle: hdl(h),
            perm: Perm::READ,
            uuid: uuid16(0x2A00).as_uuid(),
            val: None,
        });
    }
    let stack = FakeStack::new(attrs);
    let (client, host, _ctp, _htp) = pair(stack);
    let rec = Arc::new(Recorder::default());
    let dm = DiscoveryManager::new(Arc::clone(&client), Arc::clone(&rec) as _);
    dm.start(CONN, None).unwrap();
    assert_eq!(rec.take(), vec![Outcome::Error(Error::NoSpace)]);
    assert_eq!(dm.attr_count(), 0);
    assert_eq!(client.call_count(), 0);
    assert_eq!(host.container_count(), 0);
    // Fully unwound and reusable
    dm.start(CONN, None).unwrap();
    assert_eq!(rec.take(), vec![Outcome::Error(Error::NoSpace)]);
}

#[test]
fn immediate_stack_failure() {
    let stack = FakeStack::heart_rate();
    let (client, _host, _ctp, _htp) = pair(Arc::clone(&stack));
    let rec = Arc::new(Recorder::default());
    let dm = DiscoveryManager::new(client, Arc::clone(&rec) as _);
    stack.fail_next(crate::rpc::Error::NotFound);
    assert_eq!(
        dm.start(CONN, None),
        Err(Error::Rpc(crate::rpc::Error::NotFound))
    );
    assert!(rec.take().is_empty());
    // The lock was dropped on the way out
    dm.start(CONN, None).unwrap();
    assert_eq!(rec.take(), vec![Outcome::Completed(4)]);
}

mod session {
    use crate::gatt::DiscoverType;

    use super::super::session::{Session, Step};
    use super::*;

    fn svc_attr() -> AttrInfo {
        AttrInfo {
            handle: hdl(1),
            perm: Perm::READ,
            uuid: Declaration::PrimaryService.uuid(),
            val: Some(AttrVal::Service(ServiceVal {
                uuid: Some(uuid16(0x180D).as_uuid()),
                end: hdl(5),
            })),
        }
    }

    #[test]
    fn conn_mismatch_is_protocol_error() {
        let mut s = Session::new();
        let _ = s.begin(CONN, None, crate::gatt::HandleRange::ALL);
        assert_matches!(
            s.step(ConnId(2), Some(&svc_attr())),
            Step::Fail(Error::Protocol)
        );
    }

    #[test]
    fn out_of_order_handles_are_rejected() {
        let mut s = Session::new();
        let _ = s.begin(CONN, None, crate::gatt::HandleRange::ALL);
        assert_matches!(s.step(CONN, Some(&svc_attr())), Step::Next(_));
        let attr = |h: u16| AttrInfo {
            handle: hdl(h),
            perm: Perm::READ,
            uuid: uuid16(0x2A00).as_uuid(),
            val: None,
        };
        assert_matches!(s.step(CONN, Some(&attr(4))), Step::Continue);
        assert_matches!(s.step(CONN, Some(&attr(3))), Step::Fail(Error::Protocol));
    }

    #[test]
    fn unknown_characteristic_handle_is_protocol_error() {
        let mut s = Session::new();
        let _ = s.begin(CONN, None, crate::gatt::HandleRange::ALL);
        assert_matches!(s.step(CONN, Some(&svc_attr())), Step::Next(_));
        let attr = |h: u16| AttrInfo {
            handle: hdl(h),
            perm: Perm::READ,
            uuid: uuid16(0x2A00).as_uuid(),
            val: None,
        };
        assert_matches!(s.step(CONN, Some(&attr(3))), Step::Continue);
        // Attribute enumeration done; switch to characteristics
        let next = s.step(CONN, None);
        assert_matches!(
            next,
            Step::Next(crate::gatt::DiscoverParams {
                typ: DiscoverType::Characteristic,
                ..
            })
        );
        let chrc = AttrInfo {
            handle: hdl(2), // never enumerated
            perm: Perm::READ,
            uuid: Declaration::Characteristic.uuid(),
            val: Some(AttrVal::Chrc(ChrcVal {
                uuid: None,
                value_handle: hdl(4),
                props: Prop::READ,
            })),
        };
        assert_matches!(s.step(CONN, Some(&chrc)), Step::Fail(Error::Protocol));
    }

    #[test]
    fn attr_past_service_end_is_rejected() {
        let mut s = Session::new();
        let _ = s.begin(CONN, None, crate::gatt::HandleRange::ALL);
        assert_matches!(s.step(CONN, Some(&svc_attr())), Step::Next(_));
        // Service is [1,5]; a stray report at 7 must not reach the
        // characteristic phase with an inverted range
        let stray = AttrInfo {
            handle: hdl(7),
            perm: Perm::READ,
            uuid: uuid16(0x2A00).as_uuid(),
            val: None,
        };
        assert_matches!(s.step(CONN, Some(&stray)), Step::Fail(Error::Protocol));
    }
}
