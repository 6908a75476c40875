//! GATT Discovery Manager. Discovers one remote service at a time through
//! the [`GattClient`] and holds a queryable snapshot of its attributes until
//! released.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::gap::Uuid;
use crate::gatt::{AttrInfo, DiscoverFn, GattClient, Handle, HandleRange, Iter};
use crate::rpc::ConnId;
use crate::{name_of, rpc, SyncMutex};

use session::{Session, Step};

mod arena;
mod session;
#[cfg(test)]
mod tests;

/// Error type returned by the discovery manager.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Rpc(#[from] rpc::Error),
    #[error("attribute storage exhausted")]
    NoSpace,
    #[error("discovery already in progress")]
    Busy,
    #[error("no discovery data held")]
    NoData,
    #[error("unsupported discovery filter")]
    InvalidFilter,
    #[error("protocol violation by remote peer")]
    Protocol,
}

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Discovery outcome callbacks.
pub trait DiscoveryCallbacks: Send + Sync {
    /// Discovery finished. The manager's attribute snapshot stays readable
    /// until [`DiscoveryManager::release_data`].
    fn completed(&self, dm: &DiscoveryManager);

    /// No service matched the filter in the searched handle range.
    fn service_not_found(&self, conn: ConnId);

    /// Discovery failed and its partial data was dropped.
    fn error_found(&self, conn: ConnId, err: Error);
}

/// Discovery in progress; attribute storage is owned by the running
/// procedure.
const LOCKED: u8 = 1 << 0;
/// Discovery finished; attribute storage is readable and awaiting release.
const RELEASE_PENDING: u8 = 1 << 1;

/// Service discovery manager. One discovery runs at a time; its results
/// stay locked in the manager until explicitly released.
pub struct DiscoveryManager {
    client: Arc<GattClient>,
    cb: Arc<dyn DiscoveryCallbacks>,
    state: AtomicU8,
    session: SyncMutex<Session>,
}

impl DiscoveryManager {
    #[must_use]
    pub fn new(client: Arc<GattClient>, cb: Arc<dyn DiscoveryCallbacks>) -> Arc<Self> {
        Arc::new(Self {
            client,
            cb,
            state: AtomicU8::new(0),
            session: SyncMutex::new(Session::new()),
        })
    }

    /// Discovers the first service on `conn` matching `filter`, or the first
    /// service of any type when `filter` is `None`. Only 16- and 128-bit
    /// filters are supported.
    pub fn start(self: &Arc<Self>, conn: ConnId, filter: Option<Uuid>) -> Result<()> {
        if filter.map_or(false, |u| u.as_u32().is_some()) {
            return Err(Error::InvalidFilter);
        }
        self.acquire()?;
        debug!("discovery on {conn}, filter {filter:?}");
        let params = self.session.lock().begin(conn, filter, HandleRange::ALL);
        match self.client.discover(conn, &params, self.discover_fn()) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.unwind();
                Err(e.into())
            }
        }
    }

    /// Continues discovery past the end of the previously found service.
    /// Not allowed after a discovery that used a UUID filter, and only once
    /// the previous data was released.
    pub fn resume(self: &Arc<Self>, conn: ConnId) -> Result<()> {
        let next = {
            let session = self.session.lock();
            if session.filter().is_some() {
                return Err(Error::InvalidFilter);
            }
            session.resume_from().ok_or(Error::NoData)?
        };
        let Some(start) = next else {
            // The previous service ended at the last possible handle
            self.cb.service_not_found(conn);
            return Ok(());
        };
        self.acquire()?;
        debug!("discovery resuming on {conn} from {start}");
        let params = self
            .session
            .lock()
            .begin(conn, None, HandleRange::new(start, Handle::MAX));
        match self.client.discover(conn, &params, self.discover_fn()) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.unwind();
                Err(e.into())
            }
        }
    }

    /// Releases the attribute snapshot of a completed discovery, making the
    /// manager available for the next one.
    pub fn release_data(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(
                LOCKED | RELEASE_PENDING,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::NoData);
        }
        self.session.lock().release_data();
        Ok(())
    }

    /// Number of attributes in the snapshot, including the service
    /// declaration.
    #[must_use]
    pub fn attr_count(&self) -> usize {
        self.with_data(Session::attr_count).unwrap_or(0)
    }

    /// Returns the service declaration attribute.
    #[must_use]
    pub fn service(&self) -> Option<AttrInfo> {
        self.with_data(Session::service)?
    }

    #[must_use]
    pub fn attr_by_handle(&self, h: Handle) -> Option<AttrInfo> {
        self.with_data(|s| s.attr_by_handle(h))?
    }

    /// Returns the attribute following `h`.
    #[must_use]
    pub fn attr_next(&self, h: Handle) -> Option<AttrInfo> {
        self.with_data(|s| s.attr_next(h))?
    }

    /// Returns the next characteristic declaration after `h`, or the first
    /// one when `h` is `None`.
    #[must_use]
    pub fn char_next(&self, h: Option<Handle>) -> Option<AttrInfo> {
        self.with_data(|s| s.char_next(h))?
    }

    /// Returns the first characteristic whose value has type `uuid`.
    #[must_use]
    pub fn char_by_uuid(&self, uuid: Uuid) -> Option<AttrInfo> {
        self.with_data(|s| s.char_by_uuid(uuid))?
    }

    /// Returns the attribute after `h`, unless it starts the next
    /// characteristic.
    #[must_use]
    pub fn desc_next(&self, h: Handle) -> Option<AttrInfo> {
        self.with_data(|s| s.desc_next(h))?
    }

    /// Searches the characteristic declared at `chrc` for a descriptor of
    /// type `uuid`.
    #[must_use]
    pub fn desc_by_uuid(&self, chrc: Handle, uuid: Uuid) -> Option<AttrInfo> {
        self.with_data(|s| s.desc_by_uuid(chrc, uuid))?
    }

    /// Takes the discovery lock.
    fn acquire(&self) -> Result<()> {
        if self.state.fetch_or(LOCKED, Ordering::AcqRel) & LOCKED != 0 {
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Drops partial state and the discovery lock.
    fn unwind(&self) {
        self.session.lock().reset();
        self.state.store(0, Ordering::Release);
    }

    fn discover_fn(self: &Arc<Self>) -> Arc<DiscoverFn> {
        let dm = Arc::clone(self);
        Arc::new(move |conn, attr| dm.on_attr(conn, attr))
    }

    /// Applies one discovered attribute. The session lock is never held
    /// while issuing the next procedure or firing an outcome callback.
    fn on_attr(self: &Arc<Self>, conn: ConnId, attr: Option<&AttrInfo>) -> Iter {
        let step = self.session.lock().step(conn, attr);
        match step {
            Step::Continue => Iter::Continue,
            Step::Next(params) => {
                if let Err(e) = self.client.discover(conn, &params, self.discover_fn()) {
                    self.fail(conn, e.into());
                }
                Iter::Stop
            }
            Step::Complete => {
                self.session.lock().finish();
                self.state.fetch_or(RELEASE_PENDING, Ordering::AcqRel);
                debug!("discovery complete on {conn}: {} attributes", self.attr_count());
                self.cb.completed(self);
                Iter::Stop
            }
            Step::NotFound => {
                self.unwind();
                self.cb.service_not_found(conn);
                Iter::Stop
            }
            Step::Fail(e) => {
                self.fail(conn, e);
                Iter::Stop
            }
        }
    }

    fn fail(&self, conn: ConnId, e: Error) {
        debug!("discovery failed on {conn}: {e}");
        self.unwind();
        self.cb.error_found(conn, e);
    }

    fn with_data<T>(&self, f: impl FnOnce(&Session) -> T) -> Option<T> {
        (self.state.load(Ordering::Acquire) & RELEASE_PENDING != 0)
            .then(|| f(&self.session.lock()))
    }
}

impl Debug for DiscoveryManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct(name_of!(DiscoveryManager));
        d.field("state", &self.state.load(Ordering::Acquire));
        if self.with_data(|_| ()).is_some() {
            let mut attrs = Vec::new();
            self.session.lock().for_each(|a| attrs.push(a.clone()));
            d.field("attrs", &attrs);
        }
        d.finish()
    }
}
