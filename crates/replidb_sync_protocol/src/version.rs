//! Protocol version constants.
//!
//! Packet layouts grow by appending fields gated on the sender's software
//! version. A receiver decodes every version up to
//! [`SOFTWARE_VERSION_CURRENT`] and rejects anything newer.

/// Base of the software version numbering.
pub const SOFTWARE_VERSION_BASE: u32 = 100;

/// First released protocol.
pub const SOFTWARE_VERSION_RELEASE_1_0: u32 = SOFTWARE_VERSION_BASE + 1;

/// Adds the item write timestamp.
pub const SOFTWARE_VERSION_RELEASE_2_0: u32 = SOFTWARE_VERSION_BASE + 2;

/// Adds the data request flag word and extra conditions.
pub const SOFTWARE_VERSION_RELEASE_3_0: u32 = SOFTWARE_VERSION_BASE + 3;

/// Query push requests still omit the query fingerprint.
pub const SOFTWARE_VERSION_RELEASE_4_0: u32 = SOFTWARE_VERSION_BASE + 4;

/// Query fingerprint always sent with query sync requests.
pub const SOFTWARE_VERSION_RELEASE_5_0: u32 = SOFTWARE_VERSION_BASE + 5;

/// Adds the item hash key.
pub const SOFTWARE_VERSION_RELEASE_6_0: u32 = SOFTWARE_VERSION_BASE + 6;

/// Oldest version still understood.
pub const SOFTWARE_VERSION_EARLIEST: u32 = SOFTWARE_VERSION_RELEASE_1_0;

/// Version spoken by this build.
pub const SOFTWARE_VERSION_CURRENT: u32 = SOFTWARE_VERSION_RELEASE_6_0;

/// Every version this build can encode and decode, oldest first.
pub const SUPPORTED_VERSIONS: [u32; 6] = [
    SOFTWARE_VERSION_RELEASE_1_0,
    SOFTWARE_VERSION_RELEASE_2_0,
    SOFTWARE_VERSION_RELEASE_3_0,
    SOFTWARE_VERSION_RELEASE_4_0,
    SOFTWARE_VERSION_RELEASE_5_0,
    SOFTWARE_VERSION_RELEASE_6_0,
];
