use smallvec::SmallVec;
use structbuf::{Packer, Unpacker};

use crate::gap::{pack_uuid, unpack_uuid, uuid_size, Uuid};
use crate::rpc::{Error, Result};

use super::*;

/// Discovery procedure parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiscoverParams {
    /// Optional attribute type filter.
    pub uuid: Option<Uuid>,
    pub range: HandleRange,
    pub typ: DiscoverType,
}

impl DiscoverParams {
    /// Primary service discovery over the full handle range.
    #[inline]
    #[must_use]
    pub fn primary(uuid: Option<Uuid>) -> Self {
        Self {
            uuid,
            range: HandleRange::ALL,
            typ: DiscoverType::Primary,
        }
    }

    #[must_use]
    pub(crate) fn wire_size(&self) -> usize {
        uuid_size(self.uuid) + 2 + 2 + 1
    }

    pub(crate) fn pack(&self, p: &mut Packer) {
        pack_uuid(p, self.uuid);
        self.range.start().pack(p);
        self.range.end().pack(p);
        p.u8(self.typ);
    }

    pub(crate) fn unpack(p: &mut Unpacker) -> Option<Self> {
        let uuid = unpack_uuid(p)?;
        let start = Handle::unpack(p)?;
        let end = Handle::unpack(p)?;
        let typ = DiscoverType::try_from(p.u8()).ok()?;
        (p.is_ok() && start <= end).then_some(Self {
            uuid,
            range: HandleRange::new(start, end),
            typ,
        })
    }
}

/// Read procedure parameters. The wire form is tagged by a leading handle
/// count: `0` reads by UUID over a range, `1` reads a single attribute, and
/// anything larger reads multiple attributes in one request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadParams {
    ByUuid { range: HandleRange, uuid: Uuid },
    Single { handle: Handle, offset: u16 },
    Multiple { handles: SmallVec<[Handle; 4]>, variable: bool },
}

impl ReadParams {
    #[must_use]
    pub(crate) fn wire_size(&self) -> usize {
        2 + match *self {
            Self::ByUuid { uuid, .. } => 2 + 2 + uuid_size(Some(uuid)),
            Self::Single { .. } => 2 + 2,
            Self::Multiple { ref handles, .. } => 2 * handles.len() + 1,
        }
    }

    pub(crate) fn pack(&self, p: &mut Packer) {
        match *self {
            Self::ByUuid { range, uuid } => {
                p.u16(0_u16);
                range.start().pack(p);
                range.end().pack(p);
                pack_uuid(p, Some(uuid));
            }
            Self::Single { handle, offset } => {
                p.u16(1_u16);
                handle.pack(p);
                p.u16(offset);
            }
            Self::Multiple { ref handles, variable } => {
                #[allow(clippy::cast_possible_truncation)]
                p.u16(handles.len() as u16);
                for h in handles {
                    h.pack(p);
                }
                p.bool(variable);
            }
        }
    }

    pub(crate) fn unpack(p: &mut Unpacker) -> Option<Self> {
        Some(match p.u16() {
            0 => {
                let start = Handle::unpack(p)?;
                let end = Handle::unpack(p)?;
                if start > end {
                    return None;
                }
                // A rangeless read needs the type filter
                let uuid = unpack_uuid(p)??;
                Self::ByUuid {
                    range: HandleRange::new(start, end),
                    uuid,
                }
            }
            1 => Self::Single {
                handle: Handle::unpack(p)?,
                offset: p.u16(),
            },
            n => {
                let mut handles = SmallVec::new();
                for _ in 0..n {
                    handles.push(Handle::unpack(p)?);
                }
                Self::Multiple {
                    handles,
                    variable: p.bool(),
                }
            }
        })
        .filter(|_| p.is_ok())
    }
}

/// Write procedure parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteParams {
    pub handle: Handle,
    pub offset: u16,
    pub data: Vec<u8>,
}

impl WriteParams {
    #[must_use]
    pub(crate) fn wire_size(&self) -> usize {
        2 + self.data.len() + 2 + 2
    }

    pub(crate) fn pack(&self, p: &mut Packer) {
        #[allow(clippy::cast_possible_truncation)]
        p.u16(self.data.len() as u16);
        p.put(&self.data);
        self.handle.pack(p);
        p.u16(self.offset);
    }

    pub(crate) fn unpack(p: &mut Unpacker) -> Option<Self> {
        let data = take_bytes(p)?.to_vec();
        let handle = Handle::unpack(p)?;
        let offset = p.u16();
        p.is_ok().then_some(Self { handle, offset, data })
    }
}

/// Subscription parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubscribeParams {
    pub ccc_handle: Handle,
    pub value_handle: Handle,
    /// CCC value to write (notify and/or indicate bits).
    pub value: u16,
    pub flags: SubFlags,
}

impl SubscribeParams {
    pub(crate) const WIRE_SIZE: usize = 2 + 2 + 2 + 1;

    pub(crate) fn pack(&self, p: &mut Packer) {
        self.ccc_handle.pack(p);
        self.value_handle.pack(p);
        p.u16(self.value).u8(self.flags.bits());
    }

    pub(crate) fn unpack(p: &mut Unpacker) -> Option<Self> {
        let ccc_handle = Handle::unpack(p)?;
        let value_handle = Handle::unpack(p)?;
        let value = p.u16();
        let flags = SubFlags::from_bits_truncate(p.u8());
        p.is_ok().then_some(Self {
            ccc_handle,
            value_handle,
            value,
            flags,
        })
    }
}

/// Appends a length-prefixed byte string.
pub(crate) fn pack_bytes(p: &mut Packer, v: &[u8]) {
    #[allow(clippy::cast_possible_truncation)]
    p.u16(v.len() as u16);
    p.put(v);
}

/// Consumes a length-prefixed byte string.
pub(crate) fn take_bytes<'a>(p: &mut Unpacker<'a>) -> Option<&'a [u8]> {
    let n = usize::from(p.u16());
    p.skip(n).map(Unpacker::into_inner)
}

impl AttrInfo {
    /// Serialized size of an optional attribute record.
    #[must_use]
    pub(crate) fn wire_size(attr: Option<&Self>) -> usize {
        let Some(a) = attr else { return 1 };
        1 + 2 + 1 + uuid_size(Some(a.uuid)) + 1
            + match a.val {
                None => 0,
                Some(AttrVal::Service(v)) => uuid_size(v.uuid) + 2,
                Some(AttrVal::Include(v)) => uuid_size(v.uuid) + 2 + 2,
                Some(AttrVal::Chrc(v)) => uuid_size(v.uuid) + 2 + 1,
            }
    }

    /// Appends an optional attribute record. `None` encodes the
    /// end-of-procedure marker. Fails when the attribute carries a value for
    /// a declaration type the link cannot represent.
    pub(crate) fn pack(attr: Option<&Self>, p: &mut Packer) -> Result<()> {
        let Some(a) = attr else {
            p.u8(0_u8);
            return Ok(());
        };
        p.u8(1_u8);
        a.handle.pack(p);
        p.u8(a.perm.bits());
        pack_uuid(p, Some(a.uuid));
        let Some(ref val) = a.val else {
            p.u8(0_u8);
            return Ok(());
        };
        p.u8(1_u8);
        let decl = a.uuid.as_uuid16().and_then(|u| Declaration::try_from(u).ok());
        match (decl, val) {
            (
                Some(Declaration::PrimaryService | Declaration::SecondaryService),
                &AttrVal::Service(v),
            ) => {
                pack_uuid(p, v.uuid);
                v.end.pack(p);
            }
            (Some(Declaration::Include), &AttrVal::Include(v)) => {
                pack_uuid(p, v.uuid);
                v.start.pack(p);
                v.end.pack(p);
            }
            (Some(Declaration::Characteristic), &AttrVal::Chrc(v)) => {
                pack_uuid(p, v.uuid);
                v.value_handle.pack(p);
                p.u8(v.props.bits());
            }
            _ => return Err(Error::NotSupported),
        }
        Ok(())
    }

    /// Consumes an optional attribute record. The value variant is selected
    /// by the attribute's own 16-bit UUID.
    pub(crate) fn unpack(p: &mut Unpacker) -> Option<Option<Self>> {
        match p.u8() {
            0 => return p.is_ok().then_some(None),
            1 => {}
            _ => return None,
        }
        let handle = Handle::unpack(p)?;
        let perm = Perm::from_bits_truncate(p.u8());
        let uuid = unpack_uuid(p)??;
        let val = match p.u8() {
            0 => None,
            1 => {
                let decl = uuid.as_uuid16().and_then(|u| Declaration::try_from(u).ok())?;
                Some(match decl {
                    Declaration::PrimaryService | Declaration::SecondaryService => {
                        AttrVal::Service(ServiceVal {
                            uuid: unpack_uuid(p)?,
                            end: Handle::unpack(p)?,
                        })
                    }
                    Declaration::Include => AttrVal::Include(IncludeVal {
                        uuid: unpack_uuid(p)?,
                        start: Handle::unpack(p)?,
                        end: Handle::unpack(p)?,
                    }),
                    Declaration::Characteristic => AttrVal::Chrc(ChrcVal {
                        uuid: unpack_uuid(p)?,
                        value_handle: Handle::unpack(p)?,
                        props: Prop::from_bits_truncate(p.u8()),
                    }),
                })
            }
            _ => return None,
        };
        p.is_ok().then_some(Some(Self {
            handle,
            perm,
            uuid,
            val,
        }))
    }
}
