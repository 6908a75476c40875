//! GATT client procedures mirrored across the command channel.

use crate::gap::Uuid;
use crate::rpc::{ConnId, Result};

pub use {client::*, consts::*, handle::*, host::*, params::*};

mod client;
mod consts;
mod handle;
mod host;
mod params;


/// Iteration decision returned by discover, read, and notify callbacks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum Iter {
    Stop = 0,
    Continue = 1,
}

/// Attribute reported by a discovery procedure. `val` carries the decoded
/// declaration value for the declaration types the link understands.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttrInfo {
    pub handle: Handle,
    pub perm: Perm,
    pub uuid: Uuid,
    pub val: Option<AttrVal>,
}

/// Decoded attribute declaration value, keyed by the attribute's own 16-bit
/// UUID on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttrVal {
    Service(ServiceVal),
    Include(IncludeVal),
    Chrc(ChrcVal),
}

/// Primary or secondary service declaration value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServiceVal {
    pub uuid: Option<Uuid>,
    pub end: Handle,
}

/// Include declaration value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IncludeVal {
    pub uuid: Option<Uuid>,
    pub start: Handle,
    pub end: Handle,
}

/// Characteristic declaration value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChrcVal {
    pub uuid: Option<Uuid>,
    pub value_handle: Handle,
    pub props: Prop,
}

/// Discovered attribute callback. `None` marks the end of the procedure.
pub type DiscoverFn = dyn Fn(ConnId, Option<&AttrInfo>) -> Iter + Send + Sync;

/// Read result callback. `Ok(None)` marks the end of the procedure.
pub type ReadFn = dyn Fn(ConnId, Result<Option<&[u8]>>) -> Iter + Send + Sync;

/// Write result callback.
pub type WriteFn = dyn Fn(ConnId, Result<()>) + Send + Sync;

/// Write-without-response completion callback.
pub type CompleteFn = dyn Fn(ConnId) + Send + Sync;

/// Notification callback. `None` data means the subscription was terminated
/// by the peer.
pub type NotifyFn = dyn Fn(ConnId, Option<&[u8]>) -> Iter + Send + Sync;

/// CCC write result callback for subscriptions.
pub type SubscribeWriteFn = dyn Fn(ConnId, Result<()>) + Send + Sync;
