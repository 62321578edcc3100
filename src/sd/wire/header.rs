// SOME/IP header (as carried by an SD message) and the SD-specific flags
// byte (§3.2, §4.3 "Header filling").

use crate::error::{SdError, SdResult};
use crate::sd::wire::primitives::sd_header_constants as C;

pub const SOMEIP_HEADER_SIZE: usize = 16;
pub const SD_FLAGS_SIZE: usize = 1 + 3; // flags byte + 3 reserved zero bytes
pub const SD_LENGTH_FIELDS_SIZE: usize = 4; // EntriesLength, repeated for OptionsLength

/// SOME/IP transport header fields that precede the SD payload. Field
/// values are fixed constants for SD traffic (§4.3); `length` and
/// `session_id`/`reboot_flag` are the only per-message variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SomeIpHeader {
    /// Total length of everything after this field, in bytes.
    pub length: u32,
    pub client_id: u16,
    pub session_id: u16,
    pub protocol_version: u8,
    pub interface_version: u8,
}

impl SomeIpHeader {
    pub fn encode(&self, out: &mut [u8]) -> SdResult<()> {
        if out.len() < SOMEIP_HEADER_SIZE {
            return Err(SdError::BufferTooSmall { needed: SOMEIP_HEADER_SIZE, available: out.len() });
        }
        out[0..2].copy_from_slice(&C::SERVICE_ID.to_be_bytes());
        out[2..4].copy_from_slice(&C::METHOD_ID.to_be_bytes());
        out[4..8].copy_from_slice(&self.length.to_be_bytes());
        out[8..10].copy_from_slice(&self.client_id.to_be_bytes());
        out[10..12].copy_from_slice(&self.session_id.to_be_bytes());
        out[12] = self.protocol_version;
        out[13] = self.interface_version;
        out[14] = C::MESSAGE_TYPE_NOTIFICATION;
        out[15] = C::RETURN_CODE_OK;
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> SdResult<Self> {
        if buf.len() < SOMEIP_HEADER_SIZE {
            return Err(SdError::MalformedMessage("SOME/IP header shorter than 16 bytes".into()));
        }
        let service_id = u16::from_be_bytes([buf[0], buf[1]]);
        let method_id = u16::from_be_bytes([buf[2], buf[3]]);
        if service_id != C::SERVICE_ID || method_id != C::METHOD_ID {
            return Err(SdError::MalformedMessage(
                "not a SOME/IP-SD message (service/method id mismatch)".into(),
            ));
        }
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let client_id = u16::from_be_bytes([buf[8], buf[9]]);
        let session_id = u16::from_be_bytes([buf[10], buf[11]]);
        let protocol_version = buf[12];
        let interface_version = buf[13];
        Ok(SomeIpHeader { length, client_id, session_id, protocol_version, interface_version })
    }
}

impl Default for SomeIpHeader {
    fn default() -> Self {
        SomeIpHeader {
            length: 0,
            client_id: C::CLIENT_ID,
            session_id: 0,
            protocol_version: C::PROTOCOL_VERSION,
            interface_version: C::INTERFACE_VERSION,
        }
    }
}

/// SD flags byte (§3.2): bit 7 = Reboot, bit 6 = Unicast-supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SdFlags {
    pub reboot: bool,
    pub unicast_supported: bool,
}

impl SdFlags {
    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.reboot {
            b |= 0x80;
        }
        if self.unicast_supported {
            b |= 0x40;
        }
        b
    }

    pub fn from_byte(b: u8) -> Self {
        SdFlags { reboot: b & 0x80 != 0, unicast_supported: b & 0x40 != 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header() {
        let hdr = SomeIpHeader {
            length: 64,
            client_id: 0,
            session_id: 7,
            protocol_version: 1,
            interface_version: 1,
        };
        let mut buf = [0u8; SOMEIP_HEADER_SIZE];
        hdr.encode(&mut buf).unwrap();
        assert_eq!(SomeIpHeader::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn rejects_non_sd_service_id() {
        let mut buf = [0u8; SOMEIP_HEADER_SIZE];
        buf[0] = 0x12;
        buf[1] = 0x34;
        assert!(SomeIpHeader::decode(&buf).is_err());
    }

    #[test]
    fn flags_round_trip() {
        let flags = SdFlags { reboot: true, unicast_supported: false };
        assert_eq!(SdFlags::from_byte(flags.to_byte()), flags);
    }
}
