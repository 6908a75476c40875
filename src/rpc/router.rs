use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use structbuf::{Pack, StructBuf, Unpack};
use tracing::error;

use crate::name_of;

use super::*;

/// Boxed command handler. Receives the raw command payload and must always
/// produce a response buffer.
pub type Handler = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Command dispatch table. Handlers are installed once during setup; dispatch
/// takes `&self` so that a handler may itself send commands (and thus nest
/// another dispatch) without deadlocking.
#[derive(Default)]
pub struct Router(BTreeMap<u8, Handler>);

impl Router {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the handler for command `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` already has a handler.
    pub fn register(&mut self, id: CmdId, h: Handler) {
        assert!(
            self.0.insert(u8::from(id), h).is_none(),
            "duplicate handler for {id}"
        );
    }

    /// Dispatches one received command and returns its response.
    #[must_use]
    pub fn dispatch(&self, id: CmdId, payload: &[u8]) -> Vec<u8> {
        match self.0.get(&u8::from(id)) {
            Some(h) => h(payload),
            None => {
                error!("no handler for {id}");
                rsp_status(Err(Error::NotSupported))
            }
        }
    }
}

impl Debug for Router {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(name_of!(Router))
            .field(&self.0.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Encodes a status response: one `i32`, zero for success.
#[must_use]
pub fn rsp_status(r: Result<()>) -> Vec<u8> {
    let mut b = StructBuf::new(4);
    b.append().i32(r.map_or_else(Error::code, |()| 0));
    b.as_ref().to_vec()
}

/// Decodes a status response.
pub fn take_status(rsp: &[u8]) -> Result<()> {
    let Some(c) = rsp.unpack().map(|p| p.i32()) else {
        return Err(Error::Fault);
    };
    Error::from_code(c).map_or(Ok(()), Err)
}

/// Encodes a one-byte response, used for iteration decisions.
#[must_use]
pub fn rsp_u8(v: u8) -> Vec<u8> {
    vec![v]
}

/// Decodes a one-byte response.
pub fn take_u8(rsp: &[u8]) -> Result<u8> {
    rsp.unpack().map(|p| p.u8()).ok_or(Error::Fault)
}

/// Encodes an empty response.
#[must_use]
pub fn rsp_void() -> Vec<u8> {
    Vec::new()
}

/// Verifies an empty response.
pub fn take_void(rsp: &[u8]) -> Result<()> {
    rsp.is_empty().then_some(()).ok_or(Error::Fault)
}
