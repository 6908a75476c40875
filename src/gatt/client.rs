use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use structbuf::{Pack, Packer, StructBuf, Unpacker};
use tracing::{debug, warn};

use crate::rpc::{
    rsp_status, rsp_u8, rsp_void, take_status, CallbackSlot, CmdId, ConnId, Error, Proxy, Result,
    Router, Token, TokenTable, Transport,
};
use crate::{name_of, SyncMutex};

use super::*;

const MAX_CALLS: usize = 32;
const MAX_SUBS: usize = 16;
const MAX_CB_SLOTS: usize = 16;

/// In-flight procedure state, kept until the terminal callback or an
/// immediate failure.
#[derive(Clone)]
enum Call {
    Discover(Arc<DiscoverFn>),
    Read(Arc<ReadFn>),
    Write(Arc<WriteFn>),
}

/// Persistent subscription state. Notifications route through the callback
/// proxy; the CCC write result routes through the subscription token.
struct Sub {
    conn: ConnId,
    write: Option<Arc<SubscribeWriteFn>>,
}

/// Identifier returned by [`GattClient::subscribe`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct SubId(Token);

/// Application-core side of the link. Issues GATT client procedures as
/// serialized commands and dispatches the callbacks mirrored back by the
/// remote [`GattHost`].
pub struct GattClient {
    tp: Arc<dyn Transport>,
    calls: SyncMutex<TokenTable<Call>>,
    subs: SyncMutex<TokenTable<Arc<Sub>>>,
    notify: Proxy<NotifyFn>,
    complete: Proxy<CompleteFn>,
}

impl GattClient {
    /// Creates a client for transport `tp`. [`Self::register`] must be called
    /// to install the callback handlers before any procedure is issued.
    #[must_use]
    pub fn new(tp: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            tp,
            calls: SyncMutex::new(TokenTable::new(MAX_CALLS)),
            subs: SyncMutex::new(TokenTable::new(MAX_SUBS)),
            notify: Proxy::new(MAX_CB_SLOTS),
            complete: Proxy::new(MAX_CB_SLOTS),
        })
    }

    /// Installs the callback command handlers.
    pub fn register(self: &Arc<Self>, r: &mut Router) {
        let c = Arc::clone(self);
        r.register(
            CmdId::DiscoverCallback,
            Box::new(move |p| c.discover_callback(p)),
        );
        let c = Arc::clone(self);
        r.register(CmdId::ReadCallback, Box::new(move |p| c.read_callback(p)));
        let c = Arc::clone(self);
        r.register(CmdId::WriteCallback, Box::new(move |p| c.write_callback(p)));
        let c = Arc::clone(self);
        r.register(
            CmdId::CompleteCallback,
            Box::new(move |p| c.complete_callback(p)),
        );
        let c = Arc::clone(self);
        r.register(
            CmdId::NotifyCallback,
            Box::new(move |p| c.notify_callback(p)),
        );
        let c = Arc::clone(self);
        r.register(
            CmdId::SubscribeWriteCallback,
            Box::new(move |p| c.subscribe_write_callback(p)),
        );
    }

    /// Starts an attribute discovery procedure. `cb` is called once per
    /// discovered attribute and once more with `None` when the procedure
    /// ends.
    pub fn discover(&self, conn: ConnId, params: &DiscoverParams, cb: Arc<DiscoverFn>) -> Result<()> {
        debug!("discover on {conn}: {params:?}");
        let token = self.calls.lock().insert(Call::Discover(cb))?;
        let mut b = StructBuf::new(2 + params.wire_size() + 4);
        let p = &mut b.append();
        p.u16(conn);
        params.pack(p);
        p.u32(token);
        self.call(CmdId::Discover, &b, token)
    }

    /// Starts a read procedure.
    pub fn read(&self, conn: ConnId, params: &ReadParams, cb: Arc<ReadFn>) -> Result<()> {
        debug!("read on {conn}: {params:?}");
        let token = self.calls.lock().insert(Call::Read(cb))?;
        let mut b = StructBuf::new(2 + params.wire_size() + 4);
        let p = &mut b.append();
        p.u16(conn);
        params.pack(p);
        p.u32(token);
        self.call(CmdId::Read, &b, token)
    }

    /// Starts a write procedure.
    pub fn write(&self, conn: ConnId, params: &WriteParams, cb: Arc<WriteFn>) -> Result<()> {
        debug!("write on {conn}: {params:?}");
        let token = self.calls.lock().insert(Call::Write(cb))?;
        let mut b = StructBuf::new(2 + params.wire_size() + 4);
        let p = &mut b.append();
        p.u16(conn);
        params.pack(p);
        p.u32(token);
        self.call(CmdId::Write, &b, token)
    }

    /// Writes an attribute without response. `cb` is called when the local
    /// stack on the remote core has consumed the data.
    pub fn write_without_response(
        &self,
        conn: ConnId,
        handle: Handle,
        data: &[u8],
        sign: bool,
        cb: &Arc<CompleteFn>,
    ) -> Result<()> {
        debug!("write without response on {conn} to {handle}");
        let slot = self.complete.slot_of(cb);
        let mut b = StructBuf::new(4 + 2 + 2 + 2 + data.len() + 1 + 1);
        let p = &mut b.append();
        // Decode-side scratchpad reservation for the data
        p.u32(round_up4(data.len()) as u32);
        p.u16(conn);
        handle.pack(p);
        pack_bytes(p, data);
        p.bool(sign).u8(slot);
        take_status(&self.tp.cmd(CmdId::WriteWithoutResponse, b.as_ref())?)
    }

    /// Subscribes to notifications for `params.value_handle`. The returned id
    /// stays valid until [`Self::unsubscribe`].
    pub fn subscribe(
        &self,
        conn: ConnId,
        params: &SubscribeParams,
        notify: &Arc<NotifyFn>,
        write: Option<Arc<SubscribeWriteFn>>,
    ) -> Result<SubId> {
        debug!("subscribe on {conn}: {params:?}");
        let slot = self.notify.slot_of(notify);
        let token = self.subs.lock().insert(Arc::new(Sub { conn, write }))?;
        let mut b = StructBuf::new(2 + 2 + SubscribeParams::WIRE_SIZE + 4);
        let p = &mut b.append();
        p.u16(conn).u8(slot).u8(CallbackSlot::NONE);
        params.pack(p);
        p.u32(token);
        match self
            .tp
            .cmd(CmdId::Subscribe, b.as_ref())
            .and_then(|rsp| take_status(&rsp))
        {
            Ok(()) => Ok(SubId(token)),
            Err(e) => {
                self.subs.lock().remove(token);
                Err(e)
            }
        }
    }

    /// Re-issues the CCC write for an existing subscription with updated
    /// parameters.
    pub fn resubscribe(&self, sub: SubId, params: &SubscribeParams) -> Result<()> {
        debug!("resubscribe {sub:?}: {params:?}");
        if self.subs.lock().get(sub.0).is_none() {
            return Err(Error::NotFound);
        }
        let mut b = StructBuf::new(4 + SubscribeParams::WIRE_SIZE);
        let p = &mut b.append();
        p.u32(sub.0);
        params.pack(p);
        take_status(&self.tp.cmd(CmdId::Resubscribe, b.as_ref())?)
    }

    /// Ends a subscription. Notifications received after this call are
    /// dropped.
    pub fn unsubscribe(&self, sub: SubId) -> Result<()> {
        debug!("unsubscribe {sub:?}");
        let Some(s) = self.subs.lock().remove(sub.0) else {
            return Err(Error::NotFound);
        };
        let mut b = StructBuf::new(2 + 4);
        b.append().u16(s.conn).u32(sub.0);
        take_status(&self.tp.cmd(CmdId::Unsubscribe, b.as_ref())?)
    }

    /// Sets a subscription state flag on the remote core.
    pub fn flag_set(&self, sub: SubId, flag: SubFlags) -> Result<()> {
        self.flag_update(sub, flag, FlagOp::Set).map(|_| ())
    }

    /// Clears a subscription state flag on the remote core.
    pub fn flag_clear(&self, sub: SubId, flag: SubFlags) -> Result<()> {
        self.flag_update(sub, flag, FlagOp::Clear).map(|_| ())
    }

    /// Tests a subscription state flag on the remote core.
    pub fn flag_get(&self, sub: SubId, flag: SubFlags) -> Result<bool> {
        self.flag_update(sub, flag, FlagOp::Get)
    }

    fn flag_update(&self, sub: SubId, flag: SubFlags, op: FlagOp) -> Result<bool> {
        if self.subs.lock().get(sub.0).is_none() {
            return Err(Error::NotFound);
        }
        let mut b = StructBuf::new(4 + 1 + 1);
        b.append().u32(sub.0).u8(flag.bits()).u8(op);
        let rsp = self.tp.cmd(CmdId::SubscribeFlagUpdate, b.as_ref())?;
        let Some(c) = Unpacker::new(&rsp).map(|p| p.i32()) else {
            return Err(Error::Fault);
        };
        Error::from_code(c).map_or(Ok(c != 0), Err)
    }

    /// Sends a prepared command and drops the pending call on an immediate
    /// failure.
    fn call(&self, id: CmdId, b: &StructBuf, token: Token) -> Result<()> {
        match self.tp.cmd(id, b.as_ref()).and_then(|rsp| take_status(&rsp)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.calls.lock().remove(token);
                Err(e)
            }
        }
    }

    /// Number of in-flight procedures.
    #[cfg(test)]
    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Number of live subscriptions.
    #[cfg(test)]
    pub(crate) fn sub_count(&self) -> usize {
        self.subs.lock().len()
    }

    fn discover_callback(&self, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let conn = ConnId(p.u16());
        let token = Token::from(p.u32());
        if !p.is_ok() {
            self.tp.report(CmdId::DiscoverCallback, &Error::BadMessage(CmdId::DiscoverCallback));
            return rsp_u8(Iter::Stop.into());
        }
        let Some(attr) = AttrInfo::unpack(p).filter(|_| p.is_empty()) else {
            self.fail(CmdId::DiscoverCallback, token);
            return rsp_u8(Iter::Stop.into());
        };
        let Some(Call::Discover(cb)) = self.calls.lock().get_cloned(token) else {
            warn!("discover callback for unknown {token:?}");
            return rsp_u8(Iter::Stop.into());
        };
        let ret = cb(conn, attr.as_ref());
        if attr.is_none() || ret == Iter::Stop {
            self.calls.lock().remove(token);
        }
        rsp_u8(ret.into())
    }

    fn read_callback(&self, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let conn = ConnId(p.u16());
        let token = Token::from(p.u32());
        if !p.is_ok() {
            self.tp.report(CmdId::ReadCallback, &Error::BadMessage(CmdId::ReadCallback));
            return rsp_u8(Iter::Stop.into());
        }
        let status = p.i32();
        let data = match Error::from_code(status) {
            Some(e) => Err(e),
            None if p.u8() != 0 => match take_bytes(p).filter(|_| p.is_empty()) {
                Some(v) => Ok(Some(v)),
                None => {
                    self.fail(CmdId::ReadCallback, token);
                    return rsp_u8(Iter::Stop.into());
                }
            },
            None => Ok(None),
        };
        if !p.is_ok() {
            self.fail(CmdId::ReadCallback, token);
            return rsp_u8(Iter::Stop.into());
        }
        let Some(Call::Read(cb)) = self.calls.lock().get_cloned(token) else {
            warn!("read callback for unknown {token:?}");
            return rsp_u8(Iter::Stop.into());
        };
        let terminal = !matches!(data, Ok(Some(_)));
        let ret = cb(conn, data);
        if terminal || ret == Iter::Stop {
            self.calls.lock().remove(token);
        }
        rsp_u8(ret.into())
    }

    fn write_callback(&self, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let conn = ConnId(p.u16());
        let token = Token::from(p.u32());
        let status = p.i32();
        if !(p.is_ok() && p.is_empty()) {
            self.fail(CmdId::WriteCallback, token);
            return rsp_status(Err(Error::BadMessage(CmdId::WriteCallback)));
        }
        let Some(Call::Write(cb)) = self.calls.lock().remove(token) else {
            warn!("write callback for unknown {token:?}");
            return rsp_void();
        };
        cb(conn, Error::from_code(status).map_or(Ok(()), Err));
        rsp_void()
    }

    fn complete_callback(&self, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let conn = ConnId(p.u16());
        let slot = CallbackSlot(p.u8());
        if !(p.is_ok() && p.is_empty()) {
            self.tp.report(CmdId::CompleteCallback, &Error::BadMessage(CmdId::CompleteCallback));
            return rsp_status(Err(Error::BadMessage(CmdId::CompleteCallback)));
        }
        match self.complete.resolve(slot) {
            Some(cb) => cb(conn),
            None => warn!("completion for unknown {slot:?}"),
        }
        rsp_void()
    }

    fn notify_callback(&self, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let conn = ConnId(p.u16());
        let slot = CallbackSlot(p.u8());
        let handle = Handle::unpack(p);
        let data = match p.u8() {
            0 => None,
            _ => take_bytes(p),
        };
        if !(p.is_ok() && p.is_empty() && handle.is_some()) {
            self.tp.report(CmdId::NotifyCallback, &Error::BadMessage(CmdId::NotifyCallback));
            return rsp_u8(Iter::Stop.into());
        }
        let Some(cb) = self.notify.resolve(slot) else {
            warn!("notification for unknown {slot:?}");
            return rsp_u8(Iter::Stop.into());
        };
        debug!("notification on {conn} from {:?}", handle);
        rsp_u8(cb(conn, data).into())
    }

    fn subscribe_write_callback(&self, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let conn = ConnId(p.u16());
        let token = Token::from(p.u32());
        let status = p.i32();
        if !(p.is_ok() && p.is_empty()) {
            self.tp.report(
                CmdId::SubscribeWriteCallback,
                &Error::BadMessage(CmdId::SubscribeWriteCallback),
            );
            return rsp_status(Err(Error::BadMessage(CmdId::SubscribeWriteCallback)));
        }
        let sub = self.subs.lock().get_cloned(token);
        match sub {
            Some(s) => {
                if let Some(ref cb) = s.write {
                    cb(conn, Error::from_code(status).map_or(Ok(()), Err));
                }
            }
            None => warn!("CCC write result for unknown {token:?}"),
        }
        rsp_void()
    }

    /// Reports a malformed callback and releases its pending call.
    fn fail(&self, id: CmdId, token: Token) {
        self.tp.report(id, &Error::BadMessage(id));
        self.calls.lock().remove(token);
    }
}

impl Debug for GattClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(name_of!(GattClient))
            .field("calls", &self.calls.lock().len())
            .field("subs", &self.subs.lock().len())
            .finish()
    }
}

/// Rounds `n` up to a 4-byte boundary.
#[inline]
#[must_use]
pub(crate) const fn round_up4(n: usize) -> usize {
    (n + 3) & !3
}
