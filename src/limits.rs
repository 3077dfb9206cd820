use std::time::Duration;

use crate::{
    frame::{Setting, Settings},
    varint::VarInt,
};

/// Server limits the dispatcher advertises and enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// QPACK dynamic table capacity offered to the peer's encoder.
    pub header_table_size: u64,
    /// Largest request header field section accepted on a single request.
    pub max_request_header_field_size: u64,
    /// How long an accepted stream may linger before delivering its first
    /// frame (HEADERS for request streams, the stream-type varint for
    /// unidirectional streams).
    pub request_headers_timeout: Duration,
}

#[bon::bon]
impl Limits {
    #[builder]
    pub fn new(
        #[builder(default = 0)] header_table_size: u64,
        #[builder(default = 16 * 1024)] max_request_header_field_size: u64,
        #[builder(default = Duration::from_secs(30))] request_headers_timeout: Duration,
    ) -> Self {
        Self {
            header_table_size,
            max_request_header_field_size,
            request_headers_timeout,
        }
    }

    /// The SETTINGS advertised on the outbound control stream, fixed at
    /// connection construction.
    pub fn server_settings(&self) -> Settings {
        Settings::from_iter([
            Setting::qpack_max_table_capacity(
                VarInt::from_u64(self.header_table_size).unwrap_or(VarInt::MAX),
            ),
            Setting::max_field_section_size(
                VarInt::from_u64(self.max_request_header_field_size).unwrap_or(VarInt::MAX),
            ),
        ])
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_advertised_settings() {
        let limits = Limits::default();
        assert_eq!(limits.header_table_size, 0);
        assert_eq!(limits.max_request_header_field_size, 16384);
        assert_eq!(limits.request_headers_timeout, Duration::from_secs(30));

        let settings = limits.server_settings();
        assert_eq!(settings.qpack_max_table_capacity(), 0);
        assert_eq!(
            settings.max_field_section_size(),
            Some(VarInt::from_u32(16384))
        );
    }
}
