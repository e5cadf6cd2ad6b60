//! HTTP/2 SETTINGS parameters (RFC 7540 Section 6.5.1).

use crate::error::H2Error;

// Settings identifiers.
pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Largest legal flow control window (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// HTTP/2 SETTINGS parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1). Default 4096.
    pub header_table_size: u32,
    /// SETTINGS_ENABLE_PUSH (0x2). Default 1 (enabled).
    pub enable_push: bool,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3). Default unlimited.
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4). Default 65535.
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE (0x5). Default 16384.
    pub max_frame_size: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6). Default unlimited.
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65535,
            max_frame_size: 16384,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Server defaults: no push, a bounded number of concurrent streams.
    pub fn server_default() -> Self {
        Self {
            enable_push: false,
            max_concurrent_streams: Some(128),
            ..Default::default()
        }
    }

    /// The (identifier, value) pairs advertised in a SETTINGS frame.
    ///
    /// The push flag is only sent when disabled; a server is never allowed
    /// to advertise ENABLE_PUSH=1.
    pub fn to_params(&self) -> Vec<(u16, u32)> {
        let mut params = vec![(SETTINGS_HEADER_TABLE_SIZE, self.header_table_size)];
        if !self.enable_push {
            params.push((SETTINGS_ENABLE_PUSH, 0));
        }
        if let Some(v) = self.max_concurrent_streams {
            params.push((SETTINGS_MAX_CONCURRENT_STREAMS, v));
        }
        params.push((SETTINGS_INITIAL_WINDOW_SIZE, self.initial_window_size));
        params.push((SETTINGS_MAX_FRAME_SIZE, self.max_frame_size));
        if let Some(v) = self.max_header_list_size {
            params.push((SETTINGS_MAX_HEADER_LIST_SIZE, v));
        }
        params
    }

    /// Apply the parameters of a received SETTINGS frame on top of the
    /// current values. Parameters not present keep their previous value.
    pub fn apply(&mut self, params: &[(u16, u32)]) -> Result<(), H2Error> {
        for &(id, value) in params {
            match id {
                SETTINGS_HEADER_TABLE_SIZE => self.header_table_size = value,
                SETTINGS_ENABLE_PUSH => {
                    if value > 1 {
                        return Err(H2Error::ProtocolError("ENABLE_PUSH must be 0 or 1".into()));
                    }
                    self.enable_push = value == 1;
                }
                SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
                SETTINGS_INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(H2Error::FlowControlError);
                    }
                    self.initial_window_size = value;
                }
                SETTINGS_MAX_FRAME_SIZE => {
                    if !(16384..=16_777_215).contains(&value) {
                        return Err(H2Error::ProtocolError("MAX_FRAME_SIZE out of range".into()));
                    }
                    self.max_frame_size = value;
                }
                SETTINGS_MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
                // Unknown settings MUST be ignored (RFC 7540 Section 6.5.2).
                _ => {}
            }
        }
        Ok(())
    }
}
