//! Generic Access Profile types shared by both sides of the link.

pub use uuid::*;

mod uuid;
