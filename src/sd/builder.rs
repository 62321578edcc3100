// C3 — Message Builder & Payload Packer (§4.3).
//
// Combines typed entry specifications into an ordered sequence of
// `SdMessage` values, each bounded by the configured MTU, deduplicating
// endpoint options by value.

use crate::sd::wire::entry::{EntryTail, EntryType, OptionRun, SdEntry, ENTRY_SIZE};
use crate::sd::wire::header::{SD_FLAGS_SIZE, SD_LENGTH_FIELDS_SIZE, SOMEIP_HEADER_SIZE};
use crate::sd::wire::message::SdMessage;
use crate::sd::wire::option::SdOption;

/// Default MTU budget for a whole encoded SD message (§4.3: "such that
/// headers + payload ≤ 1416 bytes, leaving room for IP/UDP headers under a
/// 1500-byte MTU").
pub const DEFAULT_MTU: usize = 1416;

const FIXED_OVERHEAD: usize = SOMEIP_HEADER_SIZE + SD_FLAGS_SIZE + SD_LENGTH_FIELDS_SIZE * 2;

/// One entry to be packed, before its option indices are resolved.
///
/// Only a single option run is modelled (`index_1st`/`num_1st`); the wire
/// format has a second run, but every entry this engine emits attaches at
/// most one endpoint-option set, so the second run is always empty.
#[derive(Debug, Clone)]
pub struct EntrySpec {
    pub entry_type: EntryType,
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub ttl: u32,
    pub tail: EntryTail,
    pub options: Vec<SdOption>,
}

struct WorkingPayload {
    entries: Vec<SdEntry>,
    options: Vec<SdOption>,
}

impl WorkingPayload {
    fn new() -> Self {
        WorkingPayload { entries: Vec::new(), options: Vec::new() }
    }

    fn encoded_size(&self) -> usize {
        FIXED_OVERHEAD
            + self.entries.len() * ENTRY_SIZE
            + self.options.iter().map(SdOption::encoded_size).sum::<usize>()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve `spec`'s options against the deduplicated working set,
    /// returning the option run to store on the entry and the size the
    /// *newly added* options alone contribute.
    fn resolve_options(&mut self, spec_options: &[SdOption]) -> (OptionRun, usize) {
        if spec_options.is_empty() {
            return (OptionRun::default(), 0);
        }
        let start = self.options.len();
        let mut new_size = 0usize;
        for opt in spec_options {
            if !self.options.iter().any(|existing| existing == opt) {
                new_size += opt.encoded_size();
                self.options.push(*opt);
            }
        }
        // The run must be contiguous; since every new option is appended
        // and an already-present option may live anywhere earlier in the
        // array, a spec whose options are a mix of old and new cannot be
        // expressed as one contiguous run in general. This engine only ever
        // builds specs from C5, which always supplies a single endpoint
        // per entry, so this never arises in practice; specs with more are
        // laid out starting at the first newly-added option's position.
        let index = if start < self.options.len() { start } else { 0 };
        (OptionRun { index_1st: index as u8, index_2nd: 0, num_1st: spec_options.len() as u8, num_2nd: 0 }, new_size)
    }

    fn push(&mut self, spec: &EntrySpec) -> usize {
        let (run, new_option_size) = self.resolve_options(&spec.options);
        let entry = SdEntry {
            entry_type: spec.entry_type,
            options: run,
            service_id: spec.service_id,
            instance_id: spec.instance_id,
            major_version: spec.major_version,
            ttl: spec.ttl,
            tail: spec.tail,
        };
        self.entries.push(entry);
        ENTRY_SIZE + new_option_size
    }

    fn into_message(self, session_id: u16, reboot: bool) -> SdMessage {
        let mut msg = SdMessage::new(session_id, reboot);
        msg.entries = self.entries;
        msg.options = self.options;
        msg
    }
}

/// Order entries service-first, then eventgroup, preserving relative order
/// within each group (§4.3 "deterministic order").
fn ordered(mut specs: Vec<EntrySpec>) -> Vec<EntrySpec> {
    specs.sort_by_key(|s| !s.entry_type.is_service_entry());
    specs
}

/// Pack `specs` into one or more MTU-bounded `SdMessage`s, each stamped
/// with the same `(session_id, reboot)` pair (a single packing call always
/// corresponds to one transmission event on one stream).
pub fn pack(specs: Vec<EntrySpec>, session_id: u16, reboot: bool, mtu: usize) -> Vec<SdMessage> {
    let mut messages = Vec::new();
    let mut working = WorkingPayload::new();

    for spec in ordered(specs) {
        let projected_new_size = projected_addition(&working, &spec);
        if !working.is_empty() && working.encoded_size() + projected_new_size > mtu {
            messages.push(std::mem::replace(&mut working, WorkingPayload::new()).into_message(session_id, reboot));
        }
        working.push(&spec);
    }
    if !working.is_empty() {
        messages.push(working.into_message(session_id, reboot));
    }
    messages
}

fn projected_addition(working: &WorkingPayload, spec: &EntrySpec) -> usize {
    let new_options_size: usize = spec
        .options
        .iter()
        .filter(|opt| !working.options.iter().any(|existing| existing == *opt))
        .map(SdOption::encoded_size)
        .sum();
    ENTRY_SIZE + new_options_size
}
