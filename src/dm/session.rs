use crate::gap::Uuid;
use crate::gatt::{
    AttrInfo, AttrVal, ChrcVal, Declaration, DiscoverParams, DiscoverType, Handle, HandleRange,
    Perm, Prop, ServiceVal,
};
use crate::rpc::ConnId;

use super::arena::{Arena, Slot};
use super::Error;

/// Upper bound on stored attributes per discovered service.
const MAX_ATTRS: usize = 48;
/// Upper bound on arena chunks per discovered service.
const MAX_CHUNKS: usize = 8;

/// Current discovery procedure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Phase {
    Idle,
    /// Waiting for the first matching service declaration.
    Service,
    /// Enumerating every attribute of the found service.
    Attrs,
    /// Re-discovering characteristics to fill in declaration values.
    Chars,
    Done,
}

/// Transition computed by [`Session::step`]. Executed by the manager after
/// the session lock is dropped.
#[derive(Debug)]
pub(super) enum Step {
    Continue,
    Next(DiscoverParams),
    Complete,
    NotFound,
    Fail(Error),
}

#[derive(Debug)]
enum StoredVal {
    None,
    Service { uuid: Option<Slot>, end: Handle },
    Chrc { uuid: Option<Slot>, value_handle: Handle, props: Prop },
}

/// One attribute of the discovered service. UUID bytes live in the arena in
/// their shortest little-endian form.
#[derive(Debug)]
struct StoredAttr {
    handle: Handle,
    perm: Perm,
    uuid: Slot,
    val: StoredVal,
}

/// State of one discovery run. Attributes are stored in ascending handle
/// order, which every lookup relies on.
#[derive(Debug)]
pub(super) struct Session {
    conn: ConnId,
    filter: Option<Uuid>,
    phase: Phase,
    arena: Arena,
    attrs: Vec<StoredAttr>,
    /// Declaration-to-end range of the found service.
    svc_range: Option<HandleRange>,
    /// End handle of the last completed run. Survives data release so that
    /// discovery can continue past it.
    last_end: Option<Handle>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self {
            conn: ConnId::default(),
            filter: None,
            phase: Phase::Idle,
            arena: Arena::new(MAX_CHUNKS),
            attrs: Vec::new(),
            svc_range: None,
            last_end: None,
        }
    }

    /// Starts a new run over `range`.
    pub fn begin(&mut self, conn: ConnId, filter: Option<Uuid>, range: HandleRange) -> DiscoverParams {
        self.reset();
        self.conn = conn;
        self.filter = filter;
        self.phase = Phase::Service;
        DiscoverParams {
            uuid: filter,
            range,
            typ: DiscoverType::Primary,
        }
    }

    /// Drops the attribute snapshot while keeping the filter and resume
    /// bookkeeping of the completed run.
    pub fn release_data(&mut self) {
        self.phase = Phase::Idle;
        self.arena.release_all();
        self.attrs.clear();
        self.svc_range = None;
    }

    /// Drops all discovery data. `last_end` is kept for [`Self::resume_from`].
    pub fn reset(&mut self) {
        self.conn = ConnId::default();
        self.filter = None;
        self.phase = Phase::Idle;
        self.arena.release_all();
        self.attrs.clear();
        self.svc_range = None;
    }

    #[inline]
    #[must_use]
    pub fn filter(&self) -> Option<Uuid> {
        self.filter
    }

    /// Returns the handle the next run should start from, or `None` when the
    /// handle space is exhausted.
    #[inline]
    #[must_use]
    pub fn resume_from(&self) -> Option<Option<Handle>> {
        self.last_end.map(Handle::next)
    }

    /// Applies one discovery callback and returns the resulting transition.
    pub fn step(&mut self, conn: ConnId, attr: Option<&AttrInfo>) -> Step {
        if self.conn != conn || matches!(self.phase, Phase::Idle | Phase::Done) {
            return Step::Fail(Error::Protocol);
        }
        match self.phase {
            Phase::Service => self.step_service(attr),
            Phase::Attrs => self.step_attrs(attr),
            Phase::Chars => self.step_chars(attr),
            Phase::Idle | Phase::Done => unreachable!(),
        }
    }

    fn step_service(&mut self, attr: Option<&AttrInfo>) -> Step {
        let Some(a) = attr else {
            self.phase = Phase::Done;
            return Step::NotFound;
        };
        let Some(AttrVal::Service(sv)) = a.val else {
            return Step::Fail(Error::Protocol);
        };
        if sv.end < a.handle {
            return Step::Fail(Error::Protocol);
        }
        self.svc_range = Some(HandleRange::new(a.handle, sv.end));
        if let Err(e) = self.store(a) {
            return Step::Fail(e);
        }
        if a.handle == sv.end {
            // Nothing but the declaration
            self.phase = Phase::Done;
            return Step::Complete;
        }
        self.phase = Phase::Attrs;
        let Some(start) = a.handle.next() else {
            return Step::Fail(Error::Protocol);
        };
        Step::Next(DiscoverParams {
            uuid: None,
            range: HandleRange::new(start, sv.end),
            typ: DiscoverType::Attribute,
        })
    }

    fn step_attrs(&mut self, attr: Option<&AttrInfo>) -> Step {
        if let Some(a) = attr {
            return match self.store(a) {
                Ok(()) => Step::Continue,
                Err(e) => Step::Fail(e),
            };
        }
        if self.attrs.len() < 2 {
            // Nothing past the declaration was reported
            self.phase = Phase::Done;
            return Step::Complete;
        }
        self.phase = Phase::Chars;
        // svc_range and attrs[1] are set by step_service/store
        let (Some(range), Some(second)) = (self.svc_range, self.attrs.get(1)) else {
            return Step::Fail(Error::Protocol);
        };
        Step::Next(DiscoverParams {
            uuid: None,
            range: HandleRange::new(second.handle, range.end()),
            typ: DiscoverType::Characteristic,
        })
    }

    fn step_chars(&mut self, attr: Option<&AttrInfo>) -> Step {
        let Some(a) = attr else {
            self.phase = Phase::Done;
            return Step::Complete;
        };
        let Some(AttrVal::Chrc(cv)) = a.val else {
            return Step::Fail(Error::Protocol);
        };
        let Some(i) = self.find(a.handle) else {
            // Characteristic not seen during attribute enumeration
            return Step::Fail(Error::Protocol);
        };
        let uuid = match cv.uuid.map(|u| self.store_uuid(u)).transpose() {
            Ok(u) => u,
            Err(e) => return Step::Fail(e),
        };
        self.attrs[i].val = StoredVal::Chrc {
            uuid,
            value_handle: cv.value_handle,
            props: cv.props,
        };
        Step::Continue
    }

    /// Marks the run complete and records where a later run may resume.
    pub fn finish(&mut self) {
        if let Some(r) = self.svc_range {
            self.last_end = Some(r.end());
        }
    }

    fn store(&mut self, a: &AttrInfo) -> Result<(), Error> {
        if self.attrs.len() >= MAX_ATTRS {
            return Err(Error::NoSpace);
        }
        // Discovery reports handles in ascending order
        if self.attrs.last().map_or(false, |last| last.handle >= a.handle) {
            return Err(Error::Protocol);
        }
        // Everything reported must fall inside the service being walked
        if self.svc_range.map_or(false, |r| a.handle > r.end()) {
            return Err(Error::Protocol);
        }
        let uuid = self.store_uuid(a.uuid)?;
        let val = match a.val {
            None => StoredVal::None,
            Some(AttrVal::Service(sv)) => StoredVal::Service {
                uuid: sv.uuid.map(|u| self.store_uuid(u)).transpose()?,
                end: sv.end,
            },
            Some(AttrVal::Chrc(cv)) => StoredVal::Chrc {
                uuid: cv.uuid.map(|u| self.store_uuid(u)).transpose()?,
                value_handle: cv.value_handle,
                props: cv.props,
            },
            // Include declarations carry no data the snapshot keeps
            Some(AttrVal::Include(_)) => StoredVal::None,
        };
        self.attrs.push(StoredAttr {
            handle: a.handle,
            perm: a.perm,
            uuid,
            val,
        });
        Ok(())
    }

    fn store_uuid(&mut self, u: Uuid) -> Result<Slot, Error> {
        let s = self.arena.alloc(u.wire_len()).ok_or(Error::NoSpace)?;
        let b = self.arena.get_mut(s);
        if let Some(v) = u.as_u16() {
            b.copy_from_slice(&v.to_le_bytes());
        } else if let Some(v) = u.as_u32() {
            b.copy_from_slice(&v.to_le_bytes());
        } else {
            b.copy_from_slice(&u.to_bytes());
        }
        Ok(s)
    }

    fn read_uuid(&self, s: Slot) -> Option<Uuid> {
        Uuid::try_from(self.arena.get(s)).ok()
    }

    fn materialize(&self, a: &StoredAttr) -> Option<AttrInfo> {
        let uuid = self.read_uuid(a.uuid)?;
        let val = match a.val {
            StoredVal::None => None,
            StoredVal::Service { uuid, end } => Some(AttrVal::Service(ServiceVal {
                uuid: uuid.and_then(|s| self.read_uuid(s)),
                end,
            })),
            StoredVal::Chrc {
                uuid,
                value_handle,
                props,
            } => Some(AttrVal::Chrc(ChrcVal {
                uuid: uuid.and_then(|s| self.read_uuid(s)),
                value_handle,
                props,
            })),
        };
        Some(AttrInfo {
            handle: a.handle,
            perm: a.perm,
            uuid,
            val,
        })
    }

    /// Binary search over the handle-ordered store.
    fn find(&self, h: Handle) -> Option<usize> {
        self.attrs.binary_search_by_key(&h, |a| a.handle).ok()
    }

    #[must_use]
    pub fn attr_count(&self) -> usize {
        self.attrs.len()
    }

    /// Returns the service declaration attribute.
    #[must_use]
    pub fn service(&self) -> Option<AttrInfo> {
        self.attrs.first().and_then(|a| self.materialize(a))
    }

    #[must_use]
    pub fn attr_by_handle(&self, h: Handle) -> Option<AttrInfo> {
        self.find(h).and_then(|i| self.materialize(&self.attrs[i]))
    }

    /// Returns the first attribute with a handle greater than `h`.
    #[must_use]
    pub fn attr_next(&self, h: Handle) -> Option<AttrInfo> {
        let i = self.attrs.partition_point(|a| a.handle <= h);
        self.attrs.get(i).and_then(|a| self.materialize(a))
    }

    /// Returns the next characteristic declaration after `h`, or the first
    /// one when `h` is `None`.
    #[must_use]
    pub fn char_next(&self, h: Option<Handle>) -> Option<AttrInfo> {
        let i = h.map_or(0, |h| self.attrs.partition_point(|a| a.handle <= h));
        self.attrs[i.min(self.attrs.len())..]
            .iter()
            .find(|a| self.is_chrc(a))
            .and_then(|a| self.materialize(a))
    }

    /// Returns the first characteristic whose value has type `uuid`.
    #[must_use]
    pub fn char_by_uuid(&self, uuid: Uuid) -> Option<AttrInfo> {
        self.attrs
            .iter()
            .find(|a| match a.val {
                StoredVal::Chrc { uuid: Some(s), .. } => self.read_uuid(s) == Some(uuid),
                _ => false,
            })
            .and_then(|a| self.materialize(a))
    }

    /// Returns the attribute after `h`, unless it starts the next
    /// characteristic.
    #[must_use]
    pub fn desc_next(&self, h: Handle) -> Option<AttrInfo> {
        let i = self.attrs.partition_point(|a| a.handle <= h);
        self.attrs
            .get(i)
            .filter(|a| !self.is_chrc(a))
            .and_then(|a| self.materialize(a))
    }

    /// Searches the attributes of the characteristic declared at `chrc` for
    /// type `uuid`.
    #[must_use]
    pub fn desc_by_uuid(&self, chrc: Handle, uuid: Uuid) -> Option<AttrInfo> {
        let i = self.attrs.partition_point(|a| a.handle <= chrc);
        self.attrs[i.min(self.attrs.len())..]
            .iter()
            .take_while(|a| !self.is_chrc(a))
            .find(|a| self.read_uuid(a.uuid) == Some(uuid))
            .and_then(|a| self.materialize(a))
    }

    /// Runs `f` over every stored attribute in handle order.
    pub fn for_each(&self, mut f: impl FnMut(&AttrInfo)) {
        for a in &self.attrs {
            if let Some(info) = self.materialize(a) {
                f(&info);
            }
        }
    }

    fn is_chrc(&self, a: &StoredAttr) -> bool {
        self.read_uuid(a.uuid) == Some(Declaration::Characteristic.uuid())
    }
}
