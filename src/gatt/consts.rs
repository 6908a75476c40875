use bitflags::bitflags;

use crate::gap::uuid16_enum;

/// Declaration attribute types understood by the link
/// ([Vol 3] Part G, Section 3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[non_exhaustive]
#[repr(u16)]
pub enum Declaration {
    PrimaryService = 0x2800,
    SecondaryService = 0x2801,
    Include = 0x2802,
    Characteristic = 0x2803,
}

/// Common descriptor types ([Vol 3] Part G, Section 3.3.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[non_exhaustive]
#[repr(u16)]
pub enum Descriptor {
    Cep = 0x2900,
    Cud = 0x2901,
    Ccc = 0x2902,
}

uuid16_enum! { Declaration Descriptor }

/// Discovery procedure selector.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum DiscoverType {
    Primary = 0x00,
    Secondary = 0x01,
    Include = 0x02,
    Characteristic = 0x03,
    Descriptor = 0x04,
    /// All attributes regardless of type.
    Attribute = 0x05,
}

bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1).
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Prop: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

bitflags! {
    /// Attribute access permissions reported with discovered attributes.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Perm: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const READ_ENCRYPT = 0x04;
        const WRITE_ENCRYPT = 0x08;
        const READ_AUTHEN = 0x10;
        const WRITE_AUTHEN = 0x20;
        const PREPARE_WRITE = 0x40;
    }
}

bitflags! {
    /// Subscription state flags.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct SubFlags: u8 {
        /// Re-send the CCC write after reconnection.
        const VOLATILE = 0x01;
        /// CCC write is pending.
        const WRITE_PENDING = 0x02;
        /// Do not write the CCC when unsubscribing.
        const NO_RESUB = 0x04;
    }
}

/// Operation applied to a single subscription flag.
#[derive(Clone, Copy, Debug, Eq, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum FlagOp {
    Clear = 0x00,
    Set = 0x01,
    Get = 0x02,
}
