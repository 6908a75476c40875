//! Loopback wiring and a scripted stack for exercising both sides of the
//! link in-process.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::error;

use crate::gap::{uuid16, Uuid};
use crate::gatt::{
    AttrInfo, AttrVal, ChrcVal, Declaration, Descriptor, DiscoverParams, DiscoverType, GattClient,
    GattHost, Handle, Iter, Perm, Prop, ReadParams, ServiceVal, Stack, StackDiscoverFn,
    StackNotifyFn, StackReadFn, StackWriteFn, SubscribeParams, WriteParams,
};
use crate::rpc::{CmdId, ConnId, Error, Result, Router, Transport};
use crate::SyncMutex;

/// Transport that dispatches commands straight into the peer's router.
#[derive(Debug, Default)]
pub(crate) struct Loopback {
    peer: OnceCell<Arc<Router>>,
    /// Fail the next command without delivering it.
    pub fail_next: AtomicBool,
    /// Truncate the next command payload to provoke a decode error.
    pub corrupt_next: AtomicBool,
    /// Number of decoding failures reported by this side.
    pub reports: AtomicUsize,
}

impl Loopback {
    pub fn connect(&self, r: Arc<Router>) {
        assert!(self.peer.set(r).is_ok());
    }
}

impl Transport for Loopback {
    fn cmd(&self, id: CmdId, payload: &[u8]) -> Result<Vec<u8>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Fault);
        }
        let payload = if self.corrupt_next.swap(false, Ordering::SeqCst) {
            &payload[..payload.len() / 2]
        } else {
            payload
        };
        let r = self.peer.get().ok_or(Error::Fault)?;
        Ok(r.dispatch(id, payload))
    }

    fn report(&self, id: CmdId, err: &Error) {
        self.reports.fetch_add(1, Ordering::SeqCst);
        error!("{id} failed: {err}");
    }
}

/// Wires a client and a host back to back over loopback transports.
pub(crate) fn pair(
    stack: Arc<FakeStack>,
) -> (Arc<GattClient>, Arc<GattHost>, Arc<Loopback>, Arc<Loopback>) {
    let client_tp = Arc::new(Loopback::default());
    let host_tp = Arc::new(Loopback::default());
    let client = GattClient::new(Arc::clone(&client_tp) as _);
    let host = GattHost::new(Arc::clone(&host_tp) as _, stack);
    let mut r = Router::new();
    host.register(&mut r);
    client_tp.connect(Arc::new(r));
    let mut r = Router::new();
    client.register(&mut r);
    host_tp.connect(Arc::new(r));
    (client, host, client_tp, host_tp)
}

pub(crate) fn hdl(h: u16) -> Handle {
    Handle::new(h).unwrap()
}

/// Scripted local stack. Discovery walks a fixed attribute table; reads and
/// writes are recorded; notifications are driven manually.
pub(crate) struct FakeStack {
    attrs: SyncMutex<Vec<AttrInfo>>,
    reads: SyncMutex<Vec<Vec<u8>>>,
    pub writes: SyncMutex<Vec<WriteParams>>,
    pub no_rsp_writes: SyncMutex<Vec<(Handle, Vec<u8>, bool)>>,
    pub sub_params: SyncMutex<Vec<SubscribeParams>>,
    notify: SyncMutex<Option<StackNotifyFn>>,
    fail: SyncMutex<Option<Error>>,
}

impl FakeStack {
    pub fn new(attrs: Vec<AttrInfo>) -> Arc<Self> {
        Arc::new(Self {
            attrs: SyncMutex::new(attrs),
            reads: SyncMutex::new(Vec::new()),
            writes: SyncMutex::new(Vec::new()),
            no_rsp_writes: SyncMutex::new(Vec::new()),
            sub_params: SyncMutex::new(Vec::new()),
            notify: SyncMutex::new(None),
            fail: SyncMutex::new(None),
        })
    }

    /// Heart-rate style service: declaration at 1 with end handle 5, a
    /// characteristic declared at 3 with its value at 4, and a CCC at 5.
    pub fn heart_rate() -> Arc<Self> {
        let hrs = uuid16(0x180D).as_uuid();
        let hrm = uuid16(0x2A37).as_uuid();
        Self::new(vec![
            AttrInfo {
                handle: hdl(1),
                perm: Perm::READ,
                uuid: Declaration::PrimaryService.uuid(),
                val: Some(AttrVal::Service(ServiceVal {
                    uuid: Some(hrs),
                    end: hdl(5),
                })),
            },
            AttrInfo {
                handle: hdl(3),
                perm: Perm::READ,
                uuid: Declaration::Characteristic.uuid(),
                val: Some(AttrVal::Chrc(ChrcVal {
                    uuid: Some(hrm),
                    value_handle: hdl(4),
                    props: Prop::NOTIFY,
                })),
            },
            AttrInfo {
                handle: hdl(4),
                perm: Perm::empty(),
                uuid: hrm,
                val: None,
            },
            AttrInfo {
                handle: hdl(5),
                perm: Perm::READ | Perm::WRITE,
                uuid: Descriptor::Ccc.uuid(),
                val: None,
            },
        ])
    }

    /// Makes the next stack operation fail with `e`.
    pub fn fail_next(&self, e: Error) {
        *self.fail.lock() = Some(e);
    }

    /// Scripts the records returned by the next read procedure.
    pub fn script_reads(&self, records: Vec<Vec<u8>>) {
        *self.reads.lock() = records;
    }

    /// Delivers one notification, as the controller would. `None` terminates
    /// the subscription.
    pub fn notify(&self, conn: ConnId, data: Option<&[u8]>) {
        let Some(cb) = self.notify.lock().take() else {
            return;
        };
        let ret = cb(conn, data);
        if data.is_some() && ret == Iter::Continue {
            *self.notify.lock() = Some(cb);
        }
    }

    pub fn has_subscription(&self) -> bool {
        self.notify.lock().is_some()
    }

    fn take_fail(&self) -> Result<()> {
        self.fail.lock().take().map_or(Ok(()), Err)
    }

    fn matches(a: &AttrInfo, params: &DiscoverParams) -> bool {
        use std::ops::RangeBounds;
        if !params.range.contains(&a.handle) {
            return false;
        }
        match params.typ {
            DiscoverType::Primary => match a.val {
                Some(AttrVal::Service(sv)) => {
                    a.uuid == Declaration::PrimaryService.uuid()
                        && params.uuid.map_or(true, |u| sv.uuid == Some(u))
                }
                _ => false,
            },
            DiscoverType::Characteristic => a.uuid == Declaration::Characteristic.uuid(),
            DiscoverType::Attribute => true,
            _ => false,
        }
    }

    /// Attribute discovery reports bare attributes without declaration
    /// values.
    fn strip(a: &AttrInfo, typ: DiscoverType) -> AttrInfo {
        let mut a = a.clone();
        if typ == DiscoverType::Attribute {
            a.val = None;
        }
        a
    }
}

impl Stack for FakeStack {
    fn discover(&self, conn: ConnId, params: DiscoverParams, mut cb: StackDiscoverFn) -> Result<()> {
        self.take_fail()?;
        let attrs: Vec<AttrInfo> = self
            .attrs
            .lock()
            .iter()
            .filter(|a| Self::matches(a, &params))
            .map(|a| Self::strip(a, params.typ))
            .collect();
        for a in &attrs {
            if cb(conn, Some(a)) == Iter::Stop {
                return Ok(());
            }
        }
        cb(conn, None);
        Ok(())
    }

    fn read(&self, conn: ConnId, _params: ReadParams, mut cb: StackReadFn) -> Result<()> {
        self.take_fail()?;
        let records = std::mem::take(&mut *self.reads.lock());
        for r in &records {
            if cb(conn, Ok(Some(r.as_slice()))) == Iter::Stop {
                return Ok(());
            }
        }
        cb(conn, Ok(None));
        Ok(())
    }

    fn write(&self, conn: ConnId, params: WriteParams, cb: StackWriteFn) -> Result<()> {
        self.take_fail()?;
        self.writes.lock().push(params);
        cb(conn, Ok(()));
        Ok(())
    }

    fn write_without_response(
        &self,
        _conn: ConnId,
        handle: Handle,
        data: &[u8],
        sign: bool,
    ) -> Result<()> {
        self.take_fail()?;
        self.no_rsp_writes.lock().push((handle, data.to_vec(), sign));
        Ok(())
    }

    fn subscribe(
        &self,
        conn: ConnId,
        params: SubscribeParams,
        notify: StackNotifyFn,
        write: Option<StackWriteFn>,
    ) -> Result<()> {
        self.take_fail()?;
        self.sub_params.lock().push(params);
        *self.notify.lock() = Some(notify);
        if let Some(w) = write {
            w(conn, Ok(()));
        }
        Ok(())
    }

    fn resubscribe(&self, _conn: ConnId, params: SubscribeParams) -> Result<()> {
        self.take_fail()?;
        self.sub_params.lock().push(params);
        Ok(())
    }

    fn unsubscribe(&self, _conn: ConnId, _ccc_handle: Handle) -> Result<()> {
        self.take_fail()?;
        *self.notify.lock() = None;
        Ok(())
    }
}

impl Debug for FakeStack {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeStack")
            .field("attrs", &self.attrs.lock().len())
            .field("subscribed", &self.has_subscription())
            .finish()
    }
}

/// Scripted discovery with a filter that never matches anything.
pub(crate) fn no_match_filter() -> Option<Uuid> {
    Some(uuid16(0xFEED).as_uuid())
}
