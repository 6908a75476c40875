//! Inter-processor GATT RPC transport.
//!
//! Mirrors a Bluetooth LE host stack across a serialized command channel: the
//! application core issues GATT client procedures through [`gatt::GattClient`],
//! the network core serves them through [`gatt::GattHost`], and [`dm`] builds a
//! queryable snapshot of a remote service on top of the client.

pub use gap::{Uuid, Uuid16};

pub mod dm;
pub mod gap;
pub mod gatt;
pub mod rpc;

mod util;

#[cfg(test)]
mod testutil;

pub(crate) use util::*;

type SyncMutex<T> = parking_lot::Mutex<T>;
