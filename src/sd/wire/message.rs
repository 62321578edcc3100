// The full SD message type (§3.2): header + flags + entries + options.

use crate::sd::wire::entry::SdEntry;
use crate::sd::wire::header::{SdFlags, SomeIpHeader};
use crate::sd::wire::option::SdOption;

#[derive(Debug, Clone, PartialEq)]
pub struct SdMessage {
    pub header: SomeIpHeader,
    pub flags: SdFlags,
    pub entries: Vec<SdEntry>,
    pub options: Vec<SdOption>,
}

impl SdMessage {
    pub fn new(session_id: u16, reboot: bool) -> Self {
        SdMessage {
            header: SomeIpHeader { session_id, ..Default::default() },
            flags: SdFlags { reboot, unicast_supported: true },
            entries: Vec::new(),
            options: Vec::new(),
        }
    }
}
