// Top-level SD message codec (§4.1): `encode_sd_message` / `decode_sd_message`.
//
// Encoding never allocates beyond the caller-supplied buffer. Decoding is
// single-pass and non-recursive: header, then entries, then options, each
// consumed in one linear sweep.

use crate::error::{SdError, SdResult};
use crate::sd::wire::entry::{EntryType, SdEntry, ENTRY_SIZE};
use crate::sd::wire::header::{SdFlags, SomeIpHeader, SD_FLAGS_SIZE, SD_LENGTH_FIELDS_SIZE, SOMEIP_HEADER_SIZE};
use crate::sd::wire::message::SdMessage;
use crate::sd::wire::option::{decode_option, DecodedOption, SdOption};

/// Encode `msg` into `out`, returning the number of bytes written.
///
/// A length field that would overflow `u32` on serialisation is treated as
/// a fatal programming error per §4.1 ("internal state inconsistency, not a
/// network condition") rather than a recoverable `SdError`.
pub fn encode_sd_message(msg: &SdMessage, out: &mut [u8]) -> SdResult<usize> {
    let entries_len = msg.entries.len() * ENTRY_SIZE;
    let options_len: usize = msg.options.iter().map(SdOption::encoded_size).sum();
    assert!(
        u32::try_from(entries_len).is_ok() && u32::try_from(options_len).is_ok(),
        "SD message length overflows u32 on serialisation"
    );

    let total = SOMEIP_HEADER_SIZE
        + SD_FLAGS_SIZE
        + SD_LENGTH_FIELDS_SIZE
        + entries_len
        + SD_LENGTH_FIELDS_SIZE
        + options_len;
    if out.len() < total {
        return Err(SdError::BufferTooSmall { needed: total, available: out.len() });
    }

    let payload_len = total - SOMEIP_HEADER_SIZE;
    let header = SomeIpHeader { length: payload_len as u32, ..msg.header };
    header.encode(&mut out[0..SOMEIP_HEADER_SIZE])?;

    let mut off = SOMEIP_HEADER_SIZE;
    out[off] = msg.flags.to_byte();
    out[off + 1..off + 4].copy_from_slice(&[0, 0, 0]);
    off += SD_FLAGS_SIZE;

    out[off..off + 4].copy_from_slice(&(entries_len as u32).to_be_bytes());
    off += 4;
    for entry in &msg.entries {
        entry.encode(&mut out[off..off + ENTRY_SIZE])?;
        off += ENTRY_SIZE;
    }

    out[off..off + 4].copy_from_slice(&(options_len as u32).to_be_bytes());
    off += 4;
    for option in &msg.options {
        let size = option.encoded_size();
        option.encode(&mut out[off..off + size])?;
        off += size;
    }

    debug_assert_eq!(off, total);
    Ok(total)
}

/// Decode a complete SD message from `buf`.
///
/// `EntriesLength` not a multiple of 16, or either length field exceeding
/// the remaining bytes, rejects the whole datagram (§3.2 invariants, §8
/// boundary behaviours). Unknown entry types are skipped; entries whose
/// option run references a rejected (non-discardable unknown) option are
/// also skipped; the rest of the message is still processed.
pub fn decode_sd_message(buf: &[u8]) -> SdResult<SdMessage> {
    let header = SomeIpHeader::decode(buf)?;
    let mut off = SOMEIP_HEADER_SIZE;

    if buf.len() < off + SD_FLAGS_SIZE {
        return Err(SdError::MalformedMessage("truncated before SD flags".into()));
    }
    let flags = SdFlags::from_byte(buf[off]);
    off += SD_FLAGS_SIZE;

    if buf.len() < off + 4 {
        return Err(SdError::MalformedMessage("truncated before EntriesLength".into()));
    }
    let entries_len = u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]) as usize;
    off += 4;
    if entries_len % ENTRY_SIZE != 0 {
        return Err(SdError::MalformedMessage(format!(
            "EntriesLength {entries_len} is not a multiple of {ENTRY_SIZE}"
        )));
    }
    if buf.len() < off + entries_len {
        return Err(SdError::MalformedMessage("EntriesLength exceeds remaining bytes".into()));
    }
    let entries_buf = &buf[off..off + entries_len];
    off += entries_len;

    if buf.len() < off + 4 {
        return Err(SdError::MalformedMessage("truncated before OptionsLength".into()));
    }
    let options_len = u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]) as usize;
    off += 4;
    if buf.len() < off + options_len {
        return Err(SdError::MalformedMessage("OptionsLength exceeds remaining bytes".into()));
    }
    let options_buf = &buf[off..off + options_len];

    let decoded_options = decode_all_options(options_buf)?;
    let usable_options: Vec<SdOption> = decoded_options
        .iter()
        .filter_map(|d| match d {
            DecodedOption::Usable(o) => Some(*o),
            _ => None,
        })
        .collect();
    // Map each slot in the raw decoded array to its position in the
    // filtered `usable_options` array, so entry option indices (which count
    // raw array slots) still point at the right value after Drop slots are
    // removed.
    let mut usable_index_of = Vec::with_capacity(decoded_options.len());
    let mut next_usable = 0usize;
    for d in &decoded_options {
        if matches!(d, DecodedOption::Usable(_)) {
            usable_index_of.push(Some(next_usable));
            next_usable += 1;
        } else {
            usable_index_of.push(None);
        }
    }

    let mut entries = Vec::with_capacity(entries_buf.len() / ENTRY_SIZE);
    for chunk in entries_buf.chunks_exact(ENTRY_SIZE) {
        let mut entry = match SdEntry::decode(chunk) {
            Ok(e) => e,
            Err(_) => {
                // Unknown entry type (or other locally-malformed entry): skip it,
                // the rest of the message is still processed (§4.1).
                continue;
            }
        };
        if option_run_is_rejected(&decoded_options, &entry) {
            continue;
        }
        remap_option_run(&mut entry, &usable_index_of);
        entries.push(entry);
    }

    Ok(SdMessage { header, flags, entries, options: usable_options })
}

/// Rewrite an entry's option indices from raw-array slots to filtered
/// `usable_options` positions. Any referenced run with zero count is left
/// as-is; a non-zero run always resolves (rejects already filtered it out).
fn remap_option_run(entry: &mut SdEntry, usable_index_of: &[Option<usize>]) {
    if entry.options.num_1st > 0 {
        if let Some(i) = usable_index_of.get(entry.options.index_1st as usize).copied().flatten() {
            entry.options.index_1st = i as u8;
        }
    }
    if entry.options.num_2nd > 0 {
        if let Some(i) = usable_index_of.get(entry.options.index_2nd as usize).copied().flatten() {
            entry.options.index_2nd = i as u8;
        }
    }
}

fn decode_all_options(buf: &[u8]) -> SdResult<Vec<DecodedOption>> {
    let mut out = Vec::new();
    let mut off = 0;
    while off < buf.len() {
        let (decoded, consumed) = decode_option(&buf[off..])?;
        out.push(decoded);
        off += consumed;
    }
    Ok(out)
}

fn option_run_is_rejected(options: &[DecodedOption], entry: &SdEntry) -> bool {
    let run = entry.options;
    let ranges = [
        (run.index_1st as usize, run.num_1st as usize),
        (run.index_2nd as usize, run.num_2nd as usize),
    ];
    for (index, count) in ranges {
        if count == 0 {
            continue;
        }
        let end = index + count;
        if end > options.len() {
            return true;
        }
        if options[index..end].iter().any(|o| matches!(o, DecodedOption::Reject)) {
            return true;
        }
    }
    false
}
