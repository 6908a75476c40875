use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use structbuf::{Pack, StructBuf, Unpacker};
use tracing::{debug, warn};

use crate::rpc::{
    rsp_status, take_u8, take_void, CallbackSlot, CmdId, ConnId, Error, Result, Router, Token,
    TokenTable, Transport,
};
use crate::{name_of, SyncMutex};

use super::*;

const MAX_CONTAINERS: usize = 32;

/// Discover callback handed to the local stack. Called once per attribute
/// and once more with `None` at the end of the procedure.
pub type StackDiscoverFn = Box<dyn FnMut(ConnId, Option<&AttrInfo>) -> Iter + Send>;

/// Read callback handed to the local stack. `Ok(None)` ends the procedure.
pub type StackReadFn = Box<dyn FnMut(ConnId, Result<Option<&[u8]>>) -> Iter + Send>;

/// Write result callback handed to the local stack.
pub type StackWriteFn = Box<dyn FnOnce(ConnId, Result<()>) + Send>;

/// Notification callback handed to the local stack. Kept until it returns
/// [`Iter::Stop`] or is called with `None` data.
pub type StackNotifyFn = Box<dyn Fn(ConnId, Option<&[u8]>) -> Iter + Send + Sync>;

/// Local GATT client stack on the network core. This is the seam to the
/// controller; tests drive it with a scripted implementation.
pub trait Stack: Debug + Send + Sync {
    fn discover(&self, conn: ConnId, params: DiscoverParams, cb: StackDiscoverFn) -> Result<()>;
    fn read(&self, conn: ConnId, params: ReadParams, cb: StackReadFn) -> Result<()>;
    fn write(&self, conn: ConnId, params: WriteParams, cb: StackWriteFn) -> Result<()>;
    fn write_without_response(
        &self,
        conn: ConnId,
        handle: Handle,
        data: &[u8],
        sign: bool,
    ) -> Result<()>;
    fn subscribe(
        &self,
        conn: ConnId,
        params: SubscribeParams,
        notify: StackNotifyFn,
        write: Option<StackWriteFn>,
    ) -> Result<()>;
    fn resubscribe(&self, conn: ConnId, params: SubscribeParams) -> Result<()>;
    fn unsubscribe(&self, conn: ConnId, ccc_handle: Handle) -> Result<()>;
}

/// Per-procedure state held while the local stack iterates.
#[derive(Debug)]
struct Container {
    conn: ConnId,
    remote: Token,
}

/// Per-subscription state, shared with the notify closure and kept until
/// the subscription ends. Keyed by the remote subscription token.
#[derive(Debug)]
struct SubContainer {
    remote: Token,
    conn: ConnId,
    params: SyncMutex<SubscribeParams>,
}

/// Network-core side of the link. Decodes commands from the remote
/// [`GattClient`], drives the local [`Stack`], and mirrors its callbacks
/// back.
pub struct GattHost {
    tp: Arc<dyn Transport>,
    stack: Arc<dyn Stack>,
    containers: SyncMutex<TokenTable<Container>>,
    subs: SyncMutex<Vec<Arc<SubContainer>>>,
}

impl GattHost {
    /// Creates a host bridging transport `tp` to the local stack.
    #[must_use]
    pub fn new(tp: Arc<dyn Transport>, stack: Arc<dyn Stack>) -> Arc<Self> {
        Arc::new(Self {
            tp,
            stack,
            containers: SyncMutex::new(TokenTable::new(MAX_CONTAINERS)),
            subs: SyncMutex::new(Vec::new()),
        })
    }

    /// Installs the command handlers.
    pub fn register(self: &Arc<Self>, r: &mut Router) {
        let h = Arc::clone(self);
        r.register(CmdId::Discover, Box::new(move |p| h.discover(p)));
        let h = Arc::clone(self);
        r.register(CmdId::Read, Box::new(move |p| h.read(p)));
        let h = Arc::clone(self);
        r.register(CmdId::Write, Box::new(move |p| h.write(p)));
        let h = Arc::clone(self);
        r.register(
            CmdId::WriteWithoutResponse,
            Box::new(move |p| h.write_without_response(p)),
        );
        let h = Arc::clone(self);
        r.register(CmdId::Subscribe, Box::new(move |p| h.subscribe(p)));
        let h = Arc::clone(self);
        r.register(CmdId::Resubscribe, Box::new(move |p| h.resubscribe(p)));
        let h = Arc::clone(self);
        r.register(CmdId::Unsubscribe, Box::new(move |p| h.unsubscribe(p)));
        let h = Arc::clone(self);
        r.register(
            CmdId::SubscribeFlagUpdate,
            Box::new(move |p| h.flag_update(p)),
        );
    }

    /// Number of in-flight procedure containers.
    #[cfg(test)]
    pub(crate) fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    /// Number of live subscription containers.
    #[cfg(test)]
    pub(crate) fn sub_count(&self) -> usize {
        self.subs.lock().len()
    }

    fn discover(self: &Arc<Self>, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let conn = ConnId(p.u16());
        let Some(params) = DiscoverParams::unpack(p) else {
            return self.reject(CmdId::Discover, p);
        };
        let remote = Token::from(p.u32());
        if !(p.is_ok() && p.is_empty()) {
            return self.reject(CmdId::Discover, p);
        }
        debug!("discover on {conn}: {params:?}");
        let local = match self.containers.lock().insert(Container { conn, remote }) {
            Ok(t) => t,
            Err(e) => return rsp_status(Err(e)),
        };
        let host = Arc::clone(self);
        let cb: StackDiscoverFn = Box::new(move |conn, attr| {
            let ret = host.discover_cb(conn, remote, attr);
            if attr.is_none() || ret == Iter::Stop {
                host.containers.lock().remove(local);
            }
            ret
        });
        let r = self.stack.discover(conn, params, cb);
        if r.is_err() {
            self.containers.lock().remove(local);
        }
        rsp_status(r)
    }

    /// Mirrors one discovered attribute to the remote core and returns its
    /// iteration decision.
    fn discover_cb(&self, conn: ConnId, remote: Token, attr: Option<&AttrInfo>) -> Iter {
        let mut b = StructBuf::new(2 + 4 + AttrInfo::wire_size(attr));
        let p = &mut b.append();
        p.u16(conn).u32(remote);
        if let Err(e) = AttrInfo::pack(attr, p) {
            // The declaration value cannot be represented on the wire
            warn!("unsupported attribute {:?}", attr.map(|a| a.uuid));
            self.tp.report(CmdId::DiscoverCallback, &e);
            return Iter::Stop;
        }
        match self
            .tp
            .cmd(CmdId::DiscoverCallback, b.as_ref())
            .and_then(|rsp| take_u8(&rsp))
            .map(Iter::try_from)
        {
            Ok(Ok(it)) => it,
            _ => Iter::Stop,
        }
    }

    fn read(self: &Arc<Self>, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let conn = ConnId(p.u16());
        let Some(params) = ReadParams::unpack(p) else {
            return self.reject(CmdId::Read, p);
        };
        let remote = Token::from(p.u32());
        if !(p.is_ok() && p.is_empty()) {
            return self.reject(CmdId::Read, p);
        }
        debug!("read on {conn}: {params:?}");
        let local = match self.containers.lock().insert(Container { conn, remote }) {
            Ok(t) => t,
            Err(e) => return rsp_status(Err(e)),
        };
        let host = Arc::clone(self);
        let cb: StackReadFn = Box::new(move |conn, res| {
            let terminal = !matches!(res, Ok(Some(_)));
            let ret = host.read_cb(conn, remote, res);
            if terminal || ret == Iter::Stop {
                host.containers.lock().remove(local);
            }
            ret
        });
        let r = self.stack.read(conn, params, cb);
        if r.is_err() {
            self.containers.lock().remove(local);
        }
        rsp_status(r)
    }

    /// Mirrors one read record to the remote core.
    fn read_cb(&self, conn: ConnId, remote: Token, res: Result<Option<&[u8]>>) -> Iter {
        let data_len = match res {
            Ok(Some(v)) => v.len(),
            _ => 0,
        };
        let mut b = StructBuf::new(2 + 4 + 4 + 1 + 2 + data_len);
        let p = &mut b.append();
        p.u16(conn).u32(remote);
        match res {
            Ok(data) => {
                p.i32(0_i32);
                match data {
                    Some(v) => {
                        p.u8(1_u8);
                        pack_bytes(p, v);
                    }
                    None => {
                        p.u8(0_u8);
                    }
                }
            }
            Err(e) => {
                p.i32(e.code());
            }
        }
        match self
            .tp
            .cmd(CmdId::ReadCallback, b.as_ref())
            .and_then(|rsp| take_u8(&rsp))
            .map(Iter::try_from)
        {
            Ok(Ok(it)) => it,
            _ => Iter::Stop,
        }
    }

    fn write(self: &Arc<Self>, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let conn = ConnId(p.u16());
        let Some(params) = WriteParams::unpack(p) else {
            return self.reject(CmdId::Write, p);
        };
        let remote = Token::from(p.u32());
        if !(p.is_ok() && p.is_empty()) {
            return self.reject(CmdId::Write, p);
        }
        debug!("write on {conn}: {params:?}");
        let local = match self.containers.lock().insert(Container { conn, remote }) {
            Ok(t) => t,
            Err(e) => return rsp_status(Err(e)),
        };
        let host = Arc::clone(self);
        let cb: StackWriteFn = Box::new(move |conn, res| {
            host.write_cb(conn, remote, res);
            host.containers.lock().remove(local);
        });
        let r = self.stack.write(conn, params, cb);
        if r.is_err() {
            self.containers.lock().remove(local);
        }
        rsp_status(r)
    }

    /// Mirrors the write result to the remote core.
    fn write_cb(&self, conn: ConnId, remote: Token, res: Result<()>) {
        let mut b = StructBuf::new(2 + 4 + 4);
        b.append()
            .u16(conn)
            .u32(remote)
            .i32(res.map_or_else(Error::code, |()| 0));
        let _ = self
            .tp
            .cmd(CmdId::WriteCallback, b.as_ref())
            .and_then(|rsp| take_void(&rsp));
    }

    fn write_without_response(&self, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        // Scratchpad reservation, unused by an owned-buffer decoder
        let _reserve = p.u32();
        let conn = ConnId(p.u16());
        let (handle, data) = match (Handle::unpack(p), take_bytes(p)) {
            (Some(h), Some(d)) => (h, d),
            _ => return self.reject(CmdId::WriteWithoutResponse, p),
        };
        let sign = p.bool();
        let slot = CallbackSlot(p.u8());
        if !(p.is_ok() && p.is_empty()) {
            return self.reject(CmdId::WriteWithoutResponse, p);
        }
        debug!("write without response on {conn} to {handle}");
        let r = self.stack.write_without_response(conn, handle, data, sign);
        if r.is_ok() && slot != CallbackSlot::NONE {
            let mut b = StructBuf::new(2 + 1);
            b.append().u16(conn).u8(slot);
            let _ = self
                .tp
                .cmd(CmdId::CompleteCallback, b.as_ref())
                .and_then(|rsp| take_void(&rsp));
        }
        rsp_status(r)
    }

    fn subscribe(self: &Arc<Self>, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let conn = ConnId(p.u16());
        let notify_slot = CallbackSlot(p.u8());
        let _write_slot = CallbackSlot(p.u8());
        let Some(params) = SubscribeParams::unpack(p) else {
            return self.reject(CmdId::Subscribe, p);
        };
        let remote = Token::from(p.u32());
        if !(p.is_ok() && p.is_empty()) {
            return self.reject(CmdId::Subscribe, p);
        }
        debug!("subscribe on {conn}: {params:?}");

        // A repeated subscribe for the same remote subscription reuses the
        // existing container
        let (sc, created) = {
            let mut subs = self.subs.lock();
            match subs.iter().find(|s| s.remote == remote) {
                Some(sc) => (Arc::clone(sc), false),
                None => {
                    let sc = Arc::new(SubContainer {
                        remote,
                        conn,
                        params: SyncMutex::new(params),
                    });
                    subs.push(Arc::clone(&sc));
                    (sc, true)
                }
            }
        };
        if !created {
            *sc.params.lock() = params;
            return rsp_status(self.stack.resubscribe(conn, params));
        }

        let host = Arc::clone(self);
        let notify: StackNotifyFn = Box::new(move |conn, data| {
            let ret = host.notify_cb(conn, notify_slot, remote, data);
            if data.is_none() || ret == Iter::Stop {
                host.drop_sub(remote);
            }
            ret
        });
        let host = Arc::clone(self);
        let write: StackWriteFn = Box::new(move |conn, res| host.subscribe_write_cb(conn, remote, res));
        let r = self.stack.subscribe(conn, params, notify, Some(write));
        if r.is_err() {
            self.drop_sub(remote);
        }
        rsp_status(r)
    }

    /// Mirrors one notification to the remote core.
    fn notify_cb(&self, conn: ConnId, slot: CallbackSlot, remote: Token, data: Option<&[u8]>) -> Iter {
        let Some(sc) = self.find_sub(remote) else {
            return Iter::Stop;
        };
        let value_handle = sc.params.lock().value_handle;
        let mut b = StructBuf::new(2 + 1 + 2 + 1 + 2 + data.map_or(0, <[u8]>::len));
        let p = &mut b.append();
        p.u16(conn).u8(slot);
        value_handle.pack(p);
        match data {
            Some(v) => {
                p.u8(1_u8);
                pack_bytes(p, v);
            }
            None => {
                p.u8(0_u8);
            }
        }
        match self
            .tp
            .cmd(CmdId::NotifyCallback, b.as_ref())
            .and_then(|rsp| take_u8(&rsp))
            .map(Iter::try_from)
        {
            Ok(Ok(it)) => it,
            _ => Iter::Stop,
        }
    }

    /// Mirrors the CCC write result to the remote core.
    fn subscribe_write_cb(&self, conn: ConnId, remote: Token, res: Result<()>) {
        let mut b = StructBuf::new(2 + 4 + 4);
        b.append()
            .u16(conn)
            .u32(remote)
            .i32(res.map_or_else(Error::code, |()| 0));
        let _ = self
            .tp
            .cmd(CmdId::SubscribeWriteCallback, b.as_ref())
            .and_then(|rsp| take_void(&rsp));
    }

    fn resubscribe(&self, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let remote = Token::from(p.u32());
        let Some(params) = SubscribeParams::unpack(p).filter(|_| p.is_empty()) else {
            return self.reject(CmdId::Resubscribe, p);
        };
        let Some(sc) = self.find_sub(remote) else {
            return rsp_status(Err(Error::NotFound));
        };
        *sc.params.lock() = params;
        rsp_status(self.stack.resubscribe(sc.conn, params))
    }

    fn unsubscribe(&self, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let conn = ConnId(p.u16());
        let remote = Token::from(p.u32());
        if !(p.is_ok() && p.is_empty()) {
            return self.reject(CmdId::Unsubscribe, p);
        }
        debug!("unsubscribe on {conn}");
        let Some(sc) = self.drop_sub(remote) else {
            return rsp_status(Err(Error::NotFound));
        };
        let ccc = sc.params.lock().ccc_handle;
        rsp_status(self.stack.unsubscribe(conn, ccc))
    }

    fn flag_update(&self, payload: &[u8]) -> Vec<u8> {
        let p = &mut Unpacker::new(payload);
        let remote = Token::from(p.u32());
        let flag = SubFlags::from_bits_truncate(p.u8());
        let op = FlagOp::try_from(p.u8()).ok();
        let Some(op) = op.filter(|_| p.is_ok() && p.is_empty()) else {
            return self.reject(CmdId::SubscribeFlagUpdate, p);
        };
        let Some(sc) = self.find_sub(remote) else {
            return rsp_status(Err(Error::NotFound));
        };
        let mut params = sc.params.lock();
        let set = params.flags.contains(flag);
        match op {
            FlagOp::Clear => params.flags.remove(flag),
            FlagOp::Set => params.flags.insert(flag),
            FlagOp::Get => {}
        }
        let mut b = StructBuf::new(4);
        b.append().i32(i32::from(set));
        b.as_ref().to_vec()
    }

    fn find_sub(&self, remote: Token) -> Option<Arc<SubContainer>> {
        self.subs.lock().iter().find(|s| s.remote == remote).map(Arc::clone)
    }

    fn drop_sub(&self, remote: Token) -> Option<Arc<SubContainer>> {
        let mut subs = self.subs.lock();
        let i = subs.iter().position(|s| s.remote == remote)?;
        Some(subs.swap_remove(i))
    }

    /// Reports a command decoding failure and builds the error response.
    fn reject(&self, id: CmdId, _p: &Unpacker) -> Vec<u8> {
        let e = Error::BadMessage(id);
        self.tp.report(id, &e);
        rsp_status(Err(e))
    }
}

impl Debug for GattHost {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(name_of!(GattHost))
            .field("stack", &self.stack)
            .field("containers", &self.containers.lock().len())
            .field("subs", &self.subs.lock().len())
            .finish()
    }
}
