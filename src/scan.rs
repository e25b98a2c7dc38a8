use std::borrow::Cow;

use memmem::{Searcher, TwoWaySearcher};
use thiserror::Error;
use tracing::{debug, warn};

use crate::interrupt::CancelFlag;
use crate::maps::{Region, RegionScanLevel};
use crate::routines::{RoutineCtx, ScanRoutine};
use crate::swath::{ENTRY_BYTES, Entry, HEADER_BYTES, MatchStore, StoreError, WriteCursor};
use crate::target::{AttachGuard, TargetError, peek_bytes, read_bytes};
use crate::uservalue::UserValue;
use crate::value::{MatchFlags, MatchType, ScanDataType, Value};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Whether a pass ran to completion or was cancelled at a boundary. Either
/// way the store is sealed and the target detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    Interrupted,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanSummary {
    pub matches: usize,
    pub outcome: ScanOutcome,
}

/// First scan: walk the scannable regions and record every offset the
/// routine accepts. Matched heads are followed by width-minus-one null
/// entries so later passes can reassemble the full value.
pub fn search_regions(
    pid: i32,
    regions: &[Region],
    level: RegionScanLevel,
    routine: &ScanRoutine,
    user: Option<&UserValue>,
    ctx: &RoutineCtx,
    cancel: &CancelFlag,
) -> Result<(MatchStore, ScanSummary), ScanError> {
    let scannable: Vec<&Region> = regions.iter().filter(|r| level.includes(r.kind)).collect();
    let total: usize = scannable.iter().map(|r| r.size).sum();
    // the dense layout is the worst case: one entry per scanned byte plus
    // one header per region
    let max_needed =
        total * ENTRY_BYTES + (scannable.len() + 1) * HEADER_BYTES + ENTRY_BYTES;

    let mut store = MatchStore::new(max_needed)?;
    let mut cur = store.begin_append();
    let mut matches = 0usize;
    let mut outcome = ScanOutcome::Completed;

    let _target = AttachGuard::new(pid)?;

    for region in &scannable {
        if cancel.is_cancelled() {
            outcome = ScanOutcome::Interrupted;
            break;
        }
        let buf = match read_bytes(pid, region.start, region.size) {
            Ok(buf) => buf,
            Err(e) => {
                warn!(
                    "skipping region {} at {:#x} ({} bytes): {e}",
                    region.id, region.start, region.size
                );
                continue;
            }
        };
        matches += scan_buffer(&mut store, &mut cur, region.start, &buf, routine, user, ctx)?;
        store.seal(&cur);
        debug!(
            "region {} at {:#x} done, {} matches so far",
            region.id, region.start, matches
        );
    }

    store.seal(&cur);
    Ok((store, ScanSummary { matches, outcome }))
}

fn scan_buffer(
    store: &mut MatchStore,
    cur: &mut WriteCursor,
    base: usize,
    buf: &[u8],
    routine: &ScanRoutine,
    user: Option<&UserValue>,
    ctx: &RoutineCtx,
) -> Result<usize, ScanError> {
    if let (ScanDataType::String, MatchType::EqualTo, Some(UserValue::String(text))) =
        (routine.data_type(), routine.match_type(), user)
    {
        return scan_buffer_string(store, cur, base, buf, text);
    }

    let aggregate_len = user.map(UserValue::aggregate_length).unwrap_or(0);
    let mut matches = 0usize;
    let mut required_extra = 0usize;

    for offset in 0..buf.len() {
        let window = &buf[offset..];
        let mut out = MatchFlags::default();
        let hit = match candidate_value(routine.data_type(), window, aggregate_len) {
            Some(old) => routine.matches(&old, window, user, &mut out, ctx),
            None => false,
        };
        if hit && !out.is_empty() {
            store.push(
                cur,
                base + offset,
                Entry {
                    old_value: window[0],
                    match_info: out,
                },
            )?;
            matches += 1;
            required_extra = out.max_width_in_bytes().saturating_sub(1);
        } else if required_extra > 0 {
            store.push(
                cur,
                base + offset,
                Entry {
                    old_value: window[0],
                    match_info: MatchFlags::default(),
                },
            )?;
            required_extra -= 1;
        }
    }
    Ok(matches)
}

/// The width interpretations a first-scan candidate at this offset could
/// still take, limited by the bytes left in the region.
fn candidate_value(
    data_type: ScanDataType,
    window: &[u8],
    aggregate_len: usize,
) -> Option<Value> {
    match data_type {
        ScanDataType::ByteArray => {
            if aggregate_len == 0 || window.len() < aggregate_len {
                return None;
            }
            let mut v = Value::from_window(window);
            v.flags = MatchFlags::bytearray(aggregate_len as u16);
            Some(v)
        }
        ScanDataType::String => {
            if aggregate_len == 0 || window.len() < aggregate_len {
                return None;
            }
            let mut v = Value::from_window(window);
            v.flags = MatchFlags::string(aggregate_len as u16);
            Some(v)
        }
        _ => Some(Value::from_window(window)),
    }
}

/// Substring-search fast path for string equality scans.
fn scan_buffer_string(
    store: &mut MatchStore,
    cur: &mut WriteCursor,
    base: usize,
    buf: &[u8],
    text: &[u8],
) -> Result<usize, ScanError> {
    if text.is_empty() || buf.len() < text.len() {
        return Ok(0);
    }
    let searcher = TwoWaySearcher::new(text);
    let mut heads = Vec::new();
    let mut from = 0usize;
    while let Some(pos) = searcher.search_in(&buf[from..]) {
        heads.push(from + pos);
        from += pos + 1;
    }
    if heads.is_empty() {
        return Ok(0);
    }

    let mut next_head = 0usize;
    let mut required_extra = 0usize;
    for offset in 0..buf.len() {
        if next_head < heads.len() && heads[next_head] == offset {
            next_head += 1;
            store.push(
                cur,
                base + offset,
                Entry {
                    old_value: buf[offset],
                    match_info: MatchFlags::string(text.len() as u16),
                },
            )?;
            required_extra = text.len() - 1;
        } else if required_extra > 0 {
            store.push(
                cur,
                base + offset,
                Entry {
                    old_value: buf[offset],
                    match_info: MatchFlags::default(),
                },
            )?;
            required_extra -= 1;
        }
    }
    Ok(heads.len())
}

/// Narrowing scan: re-read the bytes covered by the existing store and
/// rewrite it in place through a write cursor that lags the read side.
/// The candidate set never grows.
pub fn check_matches(
    pid: i32,
    store: &mut MatchStore,
    routine: &ScanRoutine,
    user: Option<&UserValue>,
    ctx: &RoutineCtx,
    cancel: &CancelFlag,
) -> Result<ScanSummary, ScanError> {
    let _target = AttachGuard::new(pid)?;

    let old_len = store.content_bytes();
    let mut read_off = 0usize;
    let mut cur = store.begin_rewrite();
    let mut matches = 0usize;
    let mut outcome = ScanOutcome::Completed;

    while read_off + HEADER_BYTES <= old_len {
        if cancel.is_cancelled() {
            outcome = ScanOutcome::Interrupted;
            break;
        }
        let (first, n) = store.header_at(read_off);
        let entries: Vec<Entry> = (0..n).map(|i| store.entry_at(read_off, i)).collect();

        // one bulk read per swath, with a tail so entries near the end can
        // still be interpreted at full width; per-entry peeks as fallback
        let bulk = read_bytes(pid, first, n + 8)
            .ok()
            .or_else(|| read_bytes(pid, first, n).ok());

        let mut required_extra = 0usize;
        for (i, entry) in entries.iter().enumerate() {
            let addr = first + i;
            let flags = entry.match_info;

            if flags.max_width_in_bytes() > 0 {
                let mut window: Cow<'_, [u8]> = match &bulk {
                    Some(buf) => Cow::Borrowed(&buf[i..]),
                    None => match peek_bytes(pid, addr) {
                        Ok((bytes, len)) => Cow::Owned(bytes[..len].to_vec()),
                        // unreadable now: the match is gone
                        Err(_) => continue,
                    },
                };
                let aggregate_len =
                    flags.bytearray_length.max(flags.string_length) as usize;
                if aggregate_len > window.len() {
                    match read_bytes(pid, addr, aggregate_len) {
                        Ok(buf) => window = Cow::Owned(buf),
                        Err(_) => continue,
                    }
                }

                let avail = (n - i).min(8);
                let mut old_bytes = [0u8; 8];
                for (j, b) in old_bytes.iter_mut().enumerate().take(avail) {
                    *b = entries[i + j].old_value;
                }
                let mut old = Value::from_window(&old_bytes[..avail]);
                let capability = old.flags.widths;
                old.flags = flags;
                old.flags.widths &= capability;

                let mut out = MatchFlags::default();
                if routine.matches(&old, &window, user, &mut out, ctx) && !out.is_empty() {
                    store.push(
                        &mut cur,
                        addr,
                        Entry {
                            old_value: window[0],
                            match_info: out,
                        },
                    )?;
                    matches += 1;
                    required_extra = out.max_width_in_bytes().saturating_sub(1);
                }
            } else if required_extra > 0 {
                let byte = match &bulk {
                    Some(buf) => buf[i],
                    None => entry.old_value,
                };
                store.push(
                    &mut cur,
                    addr,
                    Entry {
                        old_value: byte,
                        match_info: MatchFlags::default(),
                    },
                )?;
                required_extra -= 1;
            }
        }

        read_off += HEADER_BYTES + n * ENTRY_BYTES;
    }

    store.seal(&cur);
    Ok(ScanSummary { matches, outcome })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uservalue::parse_number;
    use crate::utils::DemoTarget;

    fn plain_ctx() -> RoutineCtx {
        RoutineCtx::default()
    }

    #[test]
    fn scan_buffer_finds_and_pads() {
        // no live process needed: drive the buffer walk directly
        let mut store = MatchStore::new(1 << 16).unwrap();
        let mut cur = store.begin_append();
        let routine = ScanRoutine::resolve(ScanDataType::Integer32, MatchType::EqualTo).unwrap();
        let user = UserValue::Number(parse_number("100").unwrap());

        let mut buf = vec![0u8; 64];
        buf[8..12].copy_from_slice(&100i32.to_ne_bytes());
        buf[40..44].copy_from_slice(&100i32.to_ne_bytes());

        let n = scan_buffer(
            &mut store,
            &mut cur,
            0x1000,
            &buf,
            &routine,
            Some(&user),
            &plain_ctx(),
        )
        .unwrap();
        store.seal(&cur);

        assert_eq!(n, 2);
        let addrs: Vec<_> = store
            .iter_matches()
            .map(|loc| store.remote_address(loc))
            .collect();
        assert_eq!(addrs, vec![0x1008, 0x1028]);
        // each head is followed by three recorded continuation bytes
        let loc = store.nth_match(0).unwrap();
        assert_eq!(store.value_at(loc).u32(false), 100);
    }

    #[test]
    fn any_scan_of_one_byte_yields_one_candidate() {
        let mut store = MatchStore::new(1 << 12).unwrap();
        let mut cur = store.begin_append();
        let routine = ScanRoutine::resolve(ScanDataType::AnyNumber, MatchType::Any).unwrap();

        let n = scan_buffer(
            &mut store,
            &mut cur,
            0x4000,
            &[0x7f],
            &routine,
            None,
            &plain_ctx(),
        )
        .unwrap();
        store.seal(&cur);

        assert_eq!(n, 1);
        let loc = store.nth_match(0).unwrap();
        assert_eq!(store.remote_address(loc), 0x4000);
        // only the byte-wide interpretations fit a one-byte region
        assert_eq!(store.flags_at(loc).max_width_in_bytes(), 1);
    }

    #[test]
    fn string_fast_path_matches_generic_walk() {
        let mut store = MatchStore::new(1 << 16).unwrap();
        let mut cur = store.begin_append();
        let routine = ScanRoutine::resolve(ScanDataType::String, MatchType::EqualTo).unwrap();
        let user = UserValue::String(b"magic".to_vec());

        let buf = b"xx magic yy magicmagic";
        let n = scan_buffer(
            &mut store,
            &mut cur,
            0x2000,
            buf,
            &routine,
            Some(&user),
            &plain_ctx(),
        )
        .unwrap();
        store.seal(&cur);

        assert_eq!(n, 3);
        let addrs: Vec<_> = store
            .iter_matches()
            .map(|loc| store.remote_address(loc))
            .collect();
        assert_eq!(addrs, vec![0x2003, 0x200c, 0x2011]);
        let loc = store.nth_match(0).unwrap();
        assert_eq!(store.printable_text(loc, 5), "magic");
    }

    #[test]
    #[ignore = "requires root"]
    fn first_scan_then_narrow() {
        let mut demo = DemoTarget::spawn("counter");
        let pid = demo.pid();
        let regions = crate::maps::read_process_maps(pid).unwrap();
        let cancel = CancelFlag::new();
        let ctx = plain_ctx();

        let routine = ScanRoutine::resolve(ScanDataType::Integer32, MatchType::EqualTo).unwrap();
        let user = UserValue::Number(parse_number("100").unwrap());
        let (mut store, summary) = search_regions(
            pid,
            &regions,
            RegionScanLevel::All,
            &routine,
            Some(&user),
            &ctx,
            &cancel,
        )
        .unwrap();
        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert!(summary.matches >= 1);
        let addrs: Vec<_> = store
            .iter_matches()
            .map(|loc| store.remote_address(loc))
            .collect();
        assert!(addrs.contains(&demo.address));

        // drop the value in the target, then narrow with `decreased`
        demo.send("dec");
        demo.expect_line("99");

        let routine = ScanRoutine::resolve(ScanDataType::Integer32, MatchType::Decreased).unwrap();
        let summary = check_matches(pid, &mut store, &routine, None, &ctx, &cancel).unwrap();
        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert!(summary.matches <= addrs.len());
        let addrs: Vec<_> = store
            .iter_matches()
            .map(|loc| store.remote_address(loc))
            .collect();
        assert!(addrs.contains(&demo.address));
    }

    #[test]
    #[ignore = "requires root"]
    fn cancelled_scan_leaves_a_sealed_store() {
        let demo = DemoTarget::spawn("counter");
        let pid = demo.pid();
        let regions = crate::maps::read_process_maps(pid).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let routine = ScanRoutine::resolve(ScanDataType::AnyNumber, MatchType::Any).unwrap();
        let (store, summary) = search_regions(
            pid,
            &regions,
            RegionScanLevel::All,
            &routine,
            None,
            &RoutineCtx::default(),
            &cancel,
        )
        .unwrap();
        assert_eq!(summary.outcome, ScanOutcome::Interrupted);
        assert_eq!(summary.matches, 0);
        assert_eq!(store.count_matches(), 0);
        assert_eq!(store.content_bytes(), 0);
    }
}
