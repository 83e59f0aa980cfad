//! Hard ceilings applied at the validation boundary and in the stores.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 5_000;
pub const MAX_REF_ID_LEN: usize = 128;
pub const MAX_CONTACT_FIELD_LEN: usize = 256;
pub const MAX_COMMENT_LEN: usize = 2_000;

/// Longest single booking: one day.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_PATTERN_INTERVAL: u32 = 365;

/// Default ceiling for a recurring series without a usable bound.
pub const DEFAULT_MAX_OCCURRENCES: usize = 52;

/// 2000-01-01T00:00:00Z .. 2100-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

pub const DEFAULT_RATE_LIMIT: u32 = 10;
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 60;

/// Tenant names double as WAL file stems: ASCII letters, digits, `_` and
/// `-` only, so distinct names never share a file.
pub fn is_valid_tenant_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TENANT_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
