use std::thread;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tracing::{info, warn};

use crate::interrupt::CancelFlag;
use crate::maps::{MapsError, Region, RegionScanLevel, read_process_maps};
use crate::proc::process_name;
use crate::routines::{RoutineCtx, RoutineError, ScanRoutine};
use crate::scan::{ScanError, ScanOutcome, ScanSummary, check_matches, search_regions};
use crate::swath::{Location, MatchStore};
use crate::target::{self, AttachGuard, TargetError, peek_bytes};
use crate::uservalue::{ParseError, UserNumber, UserValue, parse_bytearray, parse_number};
use crate::value::{MatchFlags, MatchType, ScanDataType, Value, swap_bytes_var};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("expected an argument, type `help {0}` for details")]
    MissingArgument(&'static str),
    #[error("bad arguments, see `help {0}`")]
    BadArguments(&'static str),
    #[error("no matches are known")]
    NoMatches,
    #[error("no target set, type `help pid`")]
    NoTarget,
    #[error("`{0}` does not look like a valid pid")]
    BadPid(String),
    #[error("cannot use that search without matches")]
    NeedsPriorScan,
    #[error("cannot use that command without matches")]
    NeedsMatches,
    #[error("could not parse match id `{0}`")]
    BadMatchId(String),
    #[error("you specified a non-existent match `{0}`")]
    NoSuchMatch(String),
    #[error("no region matching {0}, or already moved")]
    NoSuchRegion(usize),
    #[error("could not parse argument {0}")]
    BadRegionId(String),
    #[error("inverting an empty set, maybe try `reset` instead?")]
    InvertEmptySet,
    #[error("you specified an empty delay count, `{0}`, see `help set`")]
    EmptyDelay(String),
    #[error("trailing garbage after delay count, `{0}`")]
    DelayGarbage(String),
    #[error("`set` is not supported for bytearray or string, use `write` instead")]
    SetUnsupported,
    #[error("`watch` is not supported for bytearray or string")]
    WatchUnsupported,
    #[error("scan_data_type is not string, see `help option`")]
    NotStringType,
    #[error("unable to parse command `{0}`; to scan for a string, use command `\"`")]
    StringNeedsQuote(String),
    #[error("bad address `{0}`")]
    BadAddress(String),
    #[error("bad length `{0}`")]
    BadLength(String),
    #[error("bad data_type `{0}`, see `help write`")]
    BadWriteType(String),
    #[error("bad value `{0}`, see `help write`")]
    BadWriteValue(String),
    #[error("bad value for {0}, see `help option`")]
    BadOptionValue(&'static str),
    #[error("unknown option `{0}`, see `help option`")]
    UnknownOption(String),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("failed to write dump file: {0}")]
    DumpFile(std::io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Routine(#[from] RoutineError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Maps(#[from] MapsError),
}

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub scan_data_type: ScanDataType,
    pub region_scan_level: RegionScanLevel,
    pub detect_reverse_change: bool,
    pub dump_with_ascii: bool,
    pub reverse_endianness: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            scan_data_type: ScanDataType::AnyNumber,
            region_scan_level: RegionScanLevel::HeapStackExeBss,
            detect_reverse_change: false,
            dump_with_ascii: false,
            reverse_endianness: false,
        }
    }
}

/// One interactive session against one target process: the regions list,
/// the match store being narrowed, and the options that shape the scans.
pub struct Session {
    pid: Option<i32>,
    regions: Vec<Region>,
    store: Option<MatchStore>,
    num_matches: usize,
    options: Options,
    cancel: CancelFlag,
}

struct SetBlock {
    matchids: Option<String>,
    value: UserNumber,
    seconds: u64,
}

impl Session {
    pub fn new(cancel: CancelFlag) -> Self {
        Session {
            pid: None,
            regions: Vec::new(),
            store: None,
            num_matches: 0,
            options: Options::default(),
            cancel,
        }
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn num_matches(&self) -> usize {
        self.num_matches
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    fn require_pid(&self) -> Result<i32, CommandError> {
        self.pid.ok_or(CommandError::NoTarget)
    }

    fn ctx(&self) -> RoutineCtx {
        RoutineCtx {
            reverse_endianness: self.options.reverse_endianness,
            detect_reverse_change: self.options.detect_reverse_change,
        }
    }

    /// Attach to a new target and rebuild the regions list.
    pub fn set_pid(&mut self, pid: i32) -> Result<(), CommandError> {
        if pid <= 0 {
            return Err(CommandError::BadPid(pid.to_string()));
        }
        self.pid = Some(pid);
        self.reset()
    }

    /// Report the current target on the diagnostics stream.
    pub fn report_pid(&self) {
        match self.pid {
            Some(pid) => match process_name(pid) {
                Some(name) => info!("target pid is {pid} ({name})."),
                None => info!("target pid is {pid}."),
            },
            None => info!("no target is currently set."),
        }
    }

    /// Drop all matches and re-read the target's maps.
    pub fn reset(&mut self) -> Result<(), CommandError> {
        self.store = None;
        self.num_matches = 0;
        self.regions.clear();

        if let Some(pid) = self.pid {
            match read_process_maps(pid) {
                Ok(regions) => self.regions = regions,
                Err(e) => {
                    warn!("the pid may be invalid, or you don't have permission.");
                    self.pid = None;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Save every byte of the scannable regions so later comparisons can
    /// run against a known-good baseline.
    pub fn snapshot(&mut self) -> Result<(), CommandError> {
        self.require_pid()?;
        self.store = None;
        self.num_matches = 0;
        // the baseline keeps every numeric width viable
        let saved = self.options.scan_data_type;
        self.options.scan_data_type = ScanDataType::AnyNumber;
        let result = self.run_scan(MatchType::Any, None);
        self.options.scan_data_type = saved;
        result
    }

    /// One scan pass: a narrowing pass when matches exist, a region walk
    /// otherwise.
    fn run_scan(
        &mut self,
        match_type: MatchType,
        user: Option<&UserValue>,
    ) -> Result<(), CommandError> {
        let pid = self.require_pid()?;
        let routine = ScanRoutine::resolve(self.options.scan_data_type, match_type)?;
        let ctx = self.ctx();
        let cancel = self.cancel.clone();
        cancel.clear();

        let summary = if let Some(store) = self.store.as_mut() {
            check_matches(pid, store, &routine, user, &ctx, &cancel)?
        } else {
            if match_type.requires_prior_scan() {
                return Err(CommandError::NeedsPriorScan);
            }
            let (store, summary) = search_regions(
                pid,
                &self.regions,
                self.options.region_scan_level,
                &routine,
                user,
                &ctx,
                &cancel,
            )?;
            self.store = Some(store);
            summary
        };

        self.num_matches = summary.matches;
        self.report_scan(&summary);
        Ok(())
    }

    fn report_scan(&self, summary: &ScanSummary) {
        if summary.outcome == ScanOutcome::Interrupted {
            info!("scan interrupted, keeping the matches collected so far.");
        }
        info!("we currently have {} matches.", summary.matches);
        if summary.matches == 1 {
            info!("match identified, use \"set\" to modify value.");
            info!("enter \"help\" for other commands.");
        }
    }

    /// The default command: a numeric literal, a `lo..hi` range, or the
    /// bytes of a byte-array scan, depending on the scan data type.
    pub fn default_scan(&mut self, tokens: &[String]) -> Result<(), CommandError> {
        if tokens.is_empty() {
            return Err(CommandError::UnknownCommand(String::new()));
        }
        match self.options.scan_data_type {
            ScanDataType::ByteArray => {
                let toks: Vec<&str> = tokens.iter().map(String::as_str).collect();
                let arr = parse_bytearray(&toks)?;
                self.run_scan(MatchType::EqualTo, Some(&UserValue::ByteArray(arr)))
            }
            ScanDataType::String => {
                Err(CommandError::StringNeedsQuote(tokens.join(" ")))
            }
            _ => {
                if tokens.len() != 1 {
                    return Err(CommandError::UnknownCommand(tokens.join(" ")));
                }
                if let Some((lo, hi)) = tokens[0].split_once("..") {
                    let lo = parse_number(lo)?;
                    let hi = parse_number(hi)?;
                    self.run_scan(MatchType::Range, Some(&UserValue::Range(lo, hi)))
                } else {
                    let n = parse_number(&tokens[0])?;
                    self.run_scan(MatchType::EqualTo, Some(&UserValue::Number(n)))
                }
            }
        }
    }

    /// A `"` scan: the rest of the line, verbatim, as the string to find.
    pub fn string_scan(&mut self, text: &str) -> Result<(), CommandError> {
        if self.options.scan_data_type != ScanDataType::String {
            return Err(CommandError::NotStringType);
        }
        if text.is_empty() {
            return Err(CommandError::MissingArgument("\""));
        }
        let user = UserValue::String(text.as_bytes().to_vec());
        self.run_scan(MatchType::EqualTo, Some(&user))
    }

    /// Comparison shorthands. Without an operand they compare against the
    /// recorded old values; with one they compare against the literal.
    pub fn shorthand(&mut self, op: &str, operand: Option<&str>) -> Result<(), CommandError> {
        let match_type = match (op, operand.is_some()) {
            ("=", false) => MatchType::NotChanged,
            ("=", true) => MatchType::EqualTo,
            ("!=", false) => MatchType::Changed,
            ("!=", true) => MatchType::NotEqualTo,
            ("<", false) => MatchType::Decreased,
            ("<", true) => MatchType::LessThan,
            (">", false) => MatchType::Increased,
            (">", true) => MatchType::GreaterThan,
            ("+", false) => MatchType::Increased,
            ("+", true) => MatchType::IncreasedBy,
            ("-", false) => MatchType::Decreased,
            ("-", true) => MatchType::DecreasedBy,
            _ => return Err(CommandError::UnknownCommand(op.to_owned())),
        };
        let user = match operand {
            Some(s) => Some(UserValue::Number(parse_number(s)?)),
            None => None,
        };
        self.run_scan(match_type, user.as_ref())
    }

    /// Re-read the current values of all matches without narrowing.
    pub fn update(&mut self) -> Result<(), CommandError> {
        if self.store.is_none() {
            return Err(CommandError::NeedsMatches);
        }
        self.run_scan(MatchType::Any, None)
    }

    /// Stable listing consumed by front-ends:
    /// `[id] address, region + offset, type,  value`.
    pub fn list(&self) -> Result<(), CommandError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let reverse = self.options.reverse_endianness;
        for (i, loc) in store.iter_matches().enumerate() {
            let addr = store.remote_address(loc);
            let flags = store.flags_at(loc);
            let text = if flags.bytearray_length > 0 {
                format!(
                    "{}, [bytearray]",
                    store.bytes_text(loc, flags.bytearray_length as usize)
                )
            } else if flags.string_length > 0 {
                format!(
                    "{}, [string]",
                    store.printable_text(loc, flags.string_length as usize)
                )
            } else {
                store.value_at(loc).to_display(flags, reverse)
            };
            let (region_id, match_off, kind) = match self.region_of(addr) {
                Some(r) => (r.id, addr - r.load_addr, r.kind.name()),
                None => (99, 0, "??"),
            };
            println!("[{i:2}] {addr:12x}, {region_id:2} + {match_off:12x}, {kind:>5},  {text}");
        }
        Ok(())
    }

    fn region_of(&self, addr: usize) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Forget one match by its listed ordinal.
    pub fn delete(&mut self, id: &str) -> Result<(), CommandError> {
        let idx = parse_usize(id).ok_or_else(|| CommandError::BadMatchId(id.to_owned()))?;
        let store = self.store.as_mut().ok_or(CommandError::NoMatches)?;
        match store.nth_match(idx) {
            Some(loc) => {
                store.clear_flags_at(loc);
                self.num_matches -= 1;
                Ok(())
            }
            None => {
                info!("use \"list\" to list matches, or \"help\" for other commands.");
                Err(CommandError::NoSuchMatch(id.to_owned()))
            }
        }
    }

    /// Drop regions by id (`!` keeps the listed ones instead), then clear
    /// every match that no longer lies in a surviving region.
    pub fn dregion(&mut self, selector: &str) -> Result<(), CommandError> {
        self.require_pid()?;
        let (invert, list_str) = match selector.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, selector),
        };
        if invert && list_str.is_empty() {
            return Err(CommandError::InvertEmptySet);
        }

        let mut ids = Vec::new();
        for tok in list_str.split(',') {
            let id =
                parse_usize(tok).ok_or_else(|| CommandError::BadRegionId(tok.to_owned()))?;
            if !self.regions.iter().any(|r| r.id == id) {
                return Err(CommandError::NoSuchRegion(id));
            }
            ids.push(id);
        }

        let (kept, removed): (Vec<Region>, Vec<Region>) = self
            .regions
            .drain(..)
            .partition(|r| ids.contains(&r.id) == invert);

        if let Some(store) = self.store.as_mut() {
            let mut cleared = 0;
            for region in &removed {
                cleared += store.delete_by_region(region, false);
            }
            self.num_matches = self.num_matches.saturating_sub(cleared);
        }
        self.regions = kept;
        Ok(())
    }

    /// List the known regions on stderr.
    pub fn lregions(&self) -> Result<(), CommandError> {
        self.require_pid()?;
        if self.regions.is_empty() {
            info!("no regions are known.");
        }
        for r in &self.regions {
            eprintln!(
                "[{:2}] {:12x}, {:7} bytes, {:>5}, {:12x}, {}{}{}, {}",
                r.id,
                r.start,
                r.size,
                r.kind.name(),
                r.load_addr,
                if r.perms.read { 'r' } else { '-' },
                if r.perms.write { 'w' } else { '-' },
                if r.perms.exec { 'x' } else { '-' },
                if r.filename.is_empty() {
                    "unassociated"
                } else {
                    r.filename.as_str()
                }
            );
        }
        Ok(())
    }

    /// `set [ids=]value[/seconds] ...`: write a value into matches, each
    /// block optionally repeating on its own period until interrupted.
    pub fn set(&mut self, args: &[String]) -> Result<(), CommandError> {
        if args.is_empty() {
            return Err(CommandError::MissingArgument("set"));
        }
        if self.options.scan_data_type.is_aggregate() {
            return Err(CommandError::SetUnsupported);
        }
        if self.num_matches == 0 {
            return Err(CommandError::NoMatches);
        }
        let pid = self.require_pid()?;

        let (blocks, continuous) = parse_set_blocks(args)?;

        self.cancel.clear();
        let mut seconds_elapsed: u64 = 1;
        loop {
            {
                let _target = AttachGuard::new(pid)?;
                for blk in &blocks {
                    // after the first pass only blocks whose period divides
                    // the elapsed time run again
                    if seconds_elapsed != 1
                        && (blk.seconds == 0 || seconds_elapsed % blk.seconds != 0)
                    {
                        continue;
                    }
                    self.apply_set_block(pid, blk)?;
                }
            }
            if !continuous || self.cancel.is_cancelled() {
                break;
            }
            thread::sleep(Duration::from_secs(1));
            if self.cancel.is_cancelled() {
                break;
            }
            seconds_elapsed += 1;
        }
        Ok(())
    }

    fn apply_set_block(&self, pid: i32, blk: &SetBlock) -> Result<(), CommandError> {
        let store = self.store.as_ref().ok_or(CommandError::NoMatches)?;
        let locations: Vec<Location> = match &blk.matchids {
            Some(ids) => {
                let mut out = Vec::new();
                for id in ids.split(',') {
                    let idx = parse_usize(id)
                        .ok_or_else(|| CommandError::BadMatchId(id.to_owned()))?;
                    let loc = store
                        .nth_match(idx)
                        .ok_or_else(|| CommandError::NoSuchMatch(id.to_owned()))?;
                    out.push(loc);
                }
                out
            }
            None => store.iter_matches().collect(),
        };

        for loc in locations {
            let addr = store.remote_address(loc);
            let flags = store.flags_at(loc);
            let Some((bytes, width)) =
                encode_write_value(&blk.value, flags, self.options.reverse_endianness)
            else {
                continue;
            };
            info!("setting {addr:#x} to {:#x}...", blk.value.uint_value);
            target::write_bytes(pid, addr, &bytes[..width])?;
        }
        Ok(())
    }

    /// Re-read one match every second and report changes until interrupted.
    pub fn watch(&mut self, id: &str) -> Result<(), CommandError> {
        if self.options.scan_data_type.is_aggregate() {
            return Err(CommandError::WatchUnsupported);
        }
        let idx = parse_usize(id).ok_or_else(|| CommandError::BadMatchId(id.to_owned()))?;
        let pid = self.require_pid()?;
        let store = self.store.as_ref().ok_or(CommandError::NoMatches)?;
        let loc = store.nth_match(idx).ok_or_else(|| {
            info!("use \"list\" to list matches, or \"help\" for other commands.");
            CommandError::NoSuchMatch(id.to_owned())
        })?;

        let addr = store.remote_address(loc);
        let flags = store.flags_at(loc);
        let mut old = store.value_at(loc);
        let capability = old.flags.widths;
        old.flags = flags;
        old.flags.widths &= capability;

        let routine = ScanRoutine::resolve(ScanDataType::AnyNumber, MatchType::Changed)?;
        let ctx = self.ctx();
        let reverse = self.options.reverse_endianness;

        info!(
            "{} monitoring {addr:#x} for changes until interrupted...",
            timestamp()
        );
        self.cancel.clear();
        while !self.cancel.is_cancelled() {
            {
                let _target = AttachGuard::new(pid)?;
                let (bytes, len) = peek_bytes(pid, addr)?;
                let mut out = MatchFlags::default();
                if routine.matches(&old, &bytes[..len], None, &mut out, &ctx) {
                    let mut newval = Value::from_window(&bytes[..len]);
                    let newcap = newval.flags.widths;
                    newval.flags = flags;
                    newval.flags.widths &= newcap;
                    old = newval;
                    info!(
                        "{} {addr:#x} -> {}",
                        timestamp(),
                        old.to_display(old.flags, reverse)
                    );
                }
            }
            thread::sleep(Duration::from_secs(1));
        }
        Ok(())
    }

    /// Hex dump of arbitrary target memory, to the terminal or a file.
    pub fn dump(&mut self, args: &[String]) -> Result<(), CommandError> {
        if args.len() < 2 || args.len() > 3 {
            return Err(CommandError::BadArguments("dump"));
        }
        let addr =
            parse_addr(&args[0]).ok_or_else(|| CommandError::BadAddress(args[0].clone()))?;
        let len =
            parse_usize(&args[1]).ok_or_else(|| CommandError::BadLength(args[1].clone()))?;
        let pid = self.require_pid()?;

        let buf = {
            let _target = AttachGuard::new(pid)?;
            target::read_bytes(pid, addr, len)?
        };

        if let Some(path) = args.get(2) {
            return std::fs::write(path, &buf).map_err(CommandError::DumpFile);
        }

        for line_start in (0..len).step_by(16) {
            print!("{:#x}: ", addr + line_start);
            let line_len = 16.min(len - line_start);
            for j in 0..line_len {
                print!("{:02X} ", buf[line_start + j]);
            }
            if self.options.dump_with_ascii {
                for _ in line_len..16 {
                    print!("   ");
                }
                for j in 0..line_len {
                    let c = buf[line_start + j];
                    print!(
                        "{}",
                        if c.is_ascii_graphic() || c == b' ' {
                            c as char
                        } else {
                            '.'
                        }
                    );
                }
            }
            println!();
        }
        Ok(())
    }

    /// `write <type> <addr> <value...>`: typed write to an arbitrary
    /// address, independent of the match store.
    pub fn write(&mut self, args: &[String]) -> Result<(), CommandError> {
        if args.len() < 3 {
            return Err(CommandError::BadArguments("write"));
        }
        let addr =
            parse_addr(&args[1]).ok_or_else(|| CommandError::BadAddress(args[1].clone()))?;
        let pid = self.require_pid()?;

        let type_str = args[0].to_ascii_lowercase();
        let buf: Vec<u8> = match type_str.as_str() {
            "i8" | "int8" | "i16" | "int16" | "i32" | "int32" | "i64" | "int64" => {
                if args.len() != 3 {
                    return Err(CommandError::BadArguments("write"));
                }
                let width = match type_str.as_str() {
                    "i8" | "int8" => 1,
                    "i16" | "int16" => 2,
                    "i32" | "int32" => 4,
                    _ => 8,
                };
                let n = parse_number(&args[2])
                    .map_err(|_| CommandError::BadWriteValue(args[2].clone()))?;
                let mut bytes = int_bytes(n.uint_value, width);
                if width > 1 && self.options.reverse_endianness {
                    swap_bytes_var(&mut bytes);
                }
                bytes
            }
            "f32" | "float32" | "f64" | "float64" => {
                if args.len() != 3 {
                    return Err(CommandError::BadArguments("write"));
                }
                let v: f64 = args[2]
                    .parse()
                    .map_err(|_| CommandError::BadWriteValue(args[2].clone()))?;
                let mut bytes = match type_str.as_str() {
                    "f32" | "float32" => (v as f32).to_ne_bytes().to_vec(),
                    _ => v.to_ne_bytes().to_vec(),
                };
                if self.options.reverse_endianness {
                    swap_bytes_var(&mut bytes);
                }
                bytes
            }
            "bytearray" => {
                let toks: Vec<&str> = args[2..].iter().map(String::as_str).collect();
                let elems = parse_bytearray(&toks)?;
                let mut bytes = if elems.iter().any(|e| e.wildcard) {
                    // wildcard positions keep whatever the target holds
                    let _target = AttachGuard::new(pid)?;
                    target::read_bytes(pid, addr, elems.len())?
                } else {
                    vec![0; elems.len()]
                };
                for (i, elem) in elems.iter().enumerate() {
                    if !elem.wildcard {
                        bytes[i] = elem.byte;
                    }
                }
                bytes
            }
            "string" => args[2..].join(" ").into_bytes(),
            _ => return Err(CommandError::BadWriteType(args[0].clone())),
        };

        let _target = AttachGuard::new(pid)?;
        target::write_bytes(pid, addr, &buf)?;
        Ok(())
    }

    /// `option <name> <value>` with the recognised settings.
    pub fn option(&mut self, name: &str, value: &str) -> Result<(), CommandError> {
        match name.to_ascii_lowercase().as_str() {
            "scan_data_type" => {
                self.options.scan_data_type = ScanDataType::from_option(value)
                    .ok_or(CommandError::BadOptionValue("scan_data_type"))?;
            }
            "region_scan_level" => {
                self.options.region_scan_level = match value {
                    "1" => RegionScanLevel::HeapStackExe,
                    "2" => RegionScanLevel::HeapStackExeBss,
                    "3" => RegionScanLevel::All,
                    _ => return Err(CommandError::BadOptionValue("region_scan_level")),
                };
            }
            "detect_reverse_change" => {
                self.options.detect_reverse_change = match value {
                    "0" => false,
                    "1" => true,
                    _ => return Err(CommandError::BadOptionValue("detect_reverse_change")),
                };
            }
            "dump_with_ascii" => {
                self.options.dump_with_ascii = match value {
                    "0" => false,
                    "1" => true,
                    _ => return Err(CommandError::BadOptionValue("dump_with_ascii")),
                };
            }
            "endianness" => {
                self.options.reverse_endianness = match value {
                    // 0: host order, 1: data is little endian, 2: big
                    "0" => false,
                    "1" => cfg!(target_endian = "big"),
                    "2" => cfg!(target_endian = "little"),
                    _ => return Err(CommandError::BadOptionValue("endianness")),
                };
            }
            _ => return Err(CommandError::UnknownOption(name.to_owned())),
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn with_store(
        store: MatchStore,
        num_matches: usize,
        regions: Vec<Region>,
    ) -> Self {
        Session {
            pid: None,
            regions,
            store: Some(store),
            num_matches,
            options: Options::default(),
            cancel: CancelFlag::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> Option<&MatchStore> {
        self.store.as_ref()
    }
}

fn timestamp() -> String {
    format!("[{}]", Local::now().format("%H:%M:%S"))
}

fn parse_usize(s: &str) -> Option<usize> {
    let s = s.trim();
    let (radix, digits) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(rest) => (16, rest),
        None => (10, s),
    };
    usize::from_str_radix(digits, radix).ok()
}

fn parse_addr(s: &str) -> Option<usize> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    usize::from_str_radix(digits, 16).ok()
}

fn int_bytes(bits: u64, width: usize) -> Vec<u8> {
    match width {
        1 => vec![bits as u8],
        2 => (bits as u16).to_ne_bytes().to_vec(),
        4 => (bits as u32).to_ne_bytes().to_vec(),
        _ => bits.to_ne_bytes().to_vec(),
    }
}

/// Pick the write width from the match's surviving flags and serialize the
/// user value at it, integer widths winning over floats at equal width.
fn encode_write_value(
    num: &UserNumber,
    flags: MatchFlags,
    reverse: bool,
) -> Option<([u8; 8], usize)> {
    let width = flags.max_width_in_bytes().min(8);
    if width == 0 {
        return None;
    }
    let mut bytes = [0u8; 8];
    if flags.widths & MatchFlags::int_widths_of(width) != 0 {
        bytes[..width].copy_from_slice(&int_bytes(num.uint_value, width));
    } else if width == 8 && flags.widths & MatchFlags::F64 != 0 {
        bytes.copy_from_slice(&num.float_value.to_ne_bytes());
    } else if width == 4 && flags.widths & MatchFlags::F32 != 0 {
        bytes[..4].copy_from_slice(&(num.float_value as f32).to_ne_bytes());
    } else {
        bytes[..width].copy_from_slice(&int_bytes(num.uint_value, width));
    }
    if reverse && width > 1 {
        swap_bytes_var(&mut bytes[..width]);
    }
    Some((bytes, width))
}

fn parse_set_blocks(args: &[String]) -> Result<(Vec<SetBlock>, bool), CommandError> {
    let mut blocks = Vec::new();
    let mut continuous = false;

    for arg in args {
        let (matchids, rest) = match arg.split_once('=') {
            Some((ids, v)) => (Some(ids.to_owned()), v),
            None => (None, arg.as_str()),
        };

        let (value_str, seconds) = match rest.split_once('/') {
            Some((v, delay)) => {
                if delay.is_empty() {
                    return Err(CommandError::EmptyDelay(rest.to_owned()));
                }
                let seconds: u64 = delay
                    .parse()
                    .map_err(|_| CommandError::DelayGarbage(rest.to_owned()))?;
                if seconds == 0 {
                    info!("you specified a zero delay, disabling continuous mode.");
                } else {
                    info!(
                        "setting {} every {} seconds until interrupted...",
                        matchids.as_deref().unwrap_or("all"),
                        seconds
                    );
                    continuous = true;
                }
                (v, seconds)
            }
            None => (rest, 0),
        };

        let value = parse_number(value_str)?;
        blocks.push(SetBlock {
            matchids,
            value,
            seconds,
        });
    }
    Ok((blocks, continuous))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::{RegionKind, RegionPerms};
    use crate::swath::Entry;

    fn test_region(id: usize, start: usize, size: usize) -> Region {
        Region {
            id,
            start,
            size,
            load_addr: start,
            perms: RegionPerms {
                read: true,
                write: true,
                exec: false,
            },
            kind: RegionKind::Heap,
            filename: String::new(),
        }
    }

    fn store_with_matches(addrs: &[usize]) -> MatchStore {
        let mut store = MatchStore::new(1 << 16).unwrap();
        let mut cur = store.begin_append();
        for addr in addrs {
            store
                .push(
                    &mut cur,
                    *addr,
                    Entry {
                        old_value: 1,
                        match_info: MatchFlags::with_widths(MatchFlags::U8),
                    },
                )
                .unwrap();
        }
        store.seal(&cur);
        store
    }

    #[test]
    fn options_round_trip() {
        let mut s = Session::new(CancelFlag::new());
        s.option("scan_data_type", "int32").unwrap();
        assert_eq!(s.options().scan_data_type, ScanDataType::Integer32);
        s.option("region_scan_level", "3").unwrap();
        assert_eq!(s.options().region_scan_level, RegionScanLevel::All);
        s.option("detect_reverse_change", "1").unwrap();
        assert!(s.options().detect_reverse_change);
        s.option("dump_with_ascii", "1").unwrap();
        assert!(s.options().dump_with_ascii);
        s.option("endianness", "0").unwrap();
        assert!(!s.options().reverse_endianness);

        assert!(s.option("scan_data_type", "int128").is_err());
        assert!(s.option("region_scan_level", "4").is_err());
        assert!(s.option("no_such_option", "1").is_err());
    }

    #[test]
    fn endianness_option_is_host_relative() {
        let mut s = Session::new(CancelFlag::new());
        s.option("endianness", "1").unwrap();
        assert_eq!(s.options().reverse_endianness, cfg!(target_endian = "big"));
        s.option("endianness", "2").unwrap();
        assert_eq!(
            s.options().reverse_endianness,
            cfg!(target_endian = "little")
        );
    }

    #[test]
    fn scans_without_a_target_fail() {
        let mut s = Session::new(CancelFlag::new());
        let err = s.default_scan(&["100".to_owned()]);
        assert!(matches!(err, Err(CommandError::NoTarget)));
        assert!(matches!(s.update(), Err(CommandError::NeedsMatches)));
        assert!(matches!(
            s.set(&["0=1".to_owned()]),
            Err(CommandError::NoMatches)
        ));
    }

    #[test]
    fn delete_clears_one_ordinal() {
        let store = store_with_matches(&[0x1000, 0x1001, 0x1002]);
        let mut s = Session::with_store(store, 3, vec![]);
        s.delete("1").unwrap();
        assert_eq!(s.num_matches(), 2);
        let left: Vec<usize> = {
            let store = s.store().unwrap();
            store
                .iter_matches()
                .map(|loc| store.remote_address(loc))
                .collect()
        };
        assert_eq!(left, vec![0x1000, 0x1002]);
        assert!(matches!(
            s.delete("7"),
            Err(CommandError::NoSuchMatch(_))
        ));
        assert!(matches!(s.delete("x"), Err(CommandError::BadMatchId(_))));
    }

    #[test]
    fn dregion_inverted_keeps_only_listed_regions() {
        let store = store_with_matches(&[0x1000, 0x2000, 0x3000]);
        let regions = vec![
            test_region(0, 0x1000, 0x100),
            test_region(1, 0x2000, 0x100),
            test_region(2, 0x3000, 0x100),
        ];
        let mut s = Session::with_store(store, 3, regions);
        s.pid = Some(1);
        s.dregion("!1").unwrap();
        assert_eq!(s.regions().len(), 1);
        assert_eq!(s.regions()[0].id, 1);
        assert_eq!(s.num_matches(), 1);
        let store = s.store().unwrap();
        let left: Vec<usize> = store
            .iter_matches()
            .map(|loc| store.remote_address(loc))
            .collect();
        assert_eq!(left, vec![0x2000]);
    }

    #[test]
    fn dregion_rejects_unknown_ids_without_side_effects() {
        let store = store_with_matches(&[0x1000]);
        let regions = vec![test_region(0, 0x1000, 0x100)];
        let mut s = Session::with_store(store, 1, regions);
        s.pid = Some(1);
        assert!(matches!(
            s.dregion("0,9"),
            Err(CommandError::NoSuchRegion(9))
        ));
        assert_eq!(s.regions().len(), 1);
        assert_eq!(s.num_matches(), 1);
        assert!(matches!(s.dregion("!"), Err(CommandError::InvertEmptySet)));
        assert!(matches!(
            s.dregion("0,abc"),
            Err(CommandError::BadRegionId(_))
        ));
    }

    #[test]
    fn set_block_parsing() {
        let args = vec!["1,3=42/5".to_owned(), "99".to_owned()];
        let (blocks, continuous) = parse_set_blocks(&args).unwrap();
        assert!(continuous);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].matchids.as_deref(), Some("1,3"));
        assert_eq!(blocks[0].value.uint_value, 42);
        assert_eq!(blocks[0].seconds, 5);
        assert_eq!(blocks[1].matchids, None);
        assert_eq!(blocks[1].value.uint_value, 99);
        assert_eq!(blocks[1].seconds, 0);

        assert!(matches!(
            parse_set_blocks(&["1=2/".to_owned()]),
            Err(CommandError::EmptyDelay(_))
        ));
        assert!(matches!(
            parse_set_blocks(&["1=2/9foo".to_owned()]),
            Err(CommandError::DelayGarbage(_))
        ));
        assert!(matches!(
            parse_set_blocks(&["1=notanumber".to_owned()]),
            Err(CommandError::Parse(_))
        ));
    }

    #[test]
    fn write_value_encoding_honours_width_and_endianness() {
        let num = parse_number("42").unwrap();

        let flags = MatchFlags::with_widths(MatchFlags::U32 | MatchFlags::S32);
        let (bytes, width) = encode_write_value(&num, flags, false).unwrap();
        assert_eq!(width, 4);
        assert_eq!(bytes[..4], 42u32.to_ne_bytes());

        let (bytes, width) = encode_write_value(&num, flags, true).unwrap();
        assert_eq!(width, 4);
        let mut expected = 42u32.to_ne_bytes();
        expected.reverse();
        assert_eq!(bytes[..4], expected);

        let fnum = parse_number("1.5").unwrap();
        let flags = MatchFlags::with_widths(MatchFlags::F32);
        let (bytes, width) = encode_write_value(&fnum, flags, false).unwrap();
        assert_eq!(width, 4);
        assert_eq!(bytes[..4], 1.5f32.to_ne_bytes());

        assert!(encode_write_value(&num, MatchFlags::default(), false).is_none());
    }

    #[test]
    #[ignore = "requires root"]
    fn end_to_end_scan_set_and_narrow() {
        use crate::utils::DemoTarget;

        let mut demo = DemoTarget::spawn("counter");
        let mut s = Session::new(CancelFlag::new());
        s.option("scan_data_type", "int32").unwrap();
        s.set_pid(demo.pid()).unwrap();
        assert!(!s.regions().is_empty());

        s.default_scan(&["100".to_owned()]).unwrap();
        assert!(s.num_matches() >= 1);
        let before = s.num_matches();

        // narrow after the target decrements
        demo.send("dec");
        demo.expect_line("99");
        s.shorthand("<", None).unwrap();
        assert!(s.num_matches() <= before);
        assert!(s.num_matches() >= 1);
        let addrs: Vec<usize> = {
            let store = s.store().unwrap();
            store
                .iter_matches()
                .map(|loc| store.remote_address(loc))
                .collect()
        };
        let ordinal = addrs
            .iter()
            .position(|a| *a == demo.address)
            .expect("known address survived");

        // write through the surviving match, then confirm in the target
        s.set(&[format!("{ordinal}=1337")]).unwrap();
        demo.send("read");
        demo.expect_line("1337");
    }

    #[test]
    #[ignore = "requires root"]
    fn snapshot_then_unchanged_keeps_everything() {
        use crate::utils::DemoTarget;

        let demo = DemoTarget::spawn("counter");
        let mut s = Session::new(CancelFlag::new());
        s.set_pid(demo.pid()).unwrap();
        s.snapshot().unwrap();
        let baseline = s.num_matches();
        assert!(baseline > 0);

        // nothing changed in the target, `=` with no operand keeps all
        s.shorthand("=", None).unwrap();
        assert!(s.num_matches() > 0);
        assert!(s.num_matches() <= baseline);
    }
}
