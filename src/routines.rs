use thiserror::Error;

use crate::uservalue::{UserNumber, UserValue};
use crate::value::{MatchFlags, MatchType, ScanDataType, Value};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutineError {
    #[error("match type {0:?} is not valid for scan data type {1}")]
    Unsupported(MatchType, ScanDataType),
}

/// Options the predicates consult while comparing.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutineCtx {
    pub reverse_endianness: bool,
    pub detect_reverse_change: bool,
}

/// One resolved predicate from the (scan data type, match type) family.
///
/// A routine looks at a recorded old value, a window of fresh target bytes
/// and an optional user operand, and narrows a flag set to the width
/// interpretations for which the predicate holds.
#[derive(Debug, Clone, Copy)]
pub struct ScanRoutine {
    data_type: ScanDataType,
    match_type: MatchType,
}

impl ScanRoutine {
    pub fn resolve(
        data_type: ScanDataType,
        match_type: MatchType,
    ) -> Result<Self, RoutineError> {
        if data_type.is_aggregate() && !matches!(match_type, MatchType::Any | MatchType::EqualTo) {
            return Err(RoutineError::Unsupported(match_type, data_type));
        }
        Ok(ScanRoutine {
            data_type,
            match_type,
        })
    }

    pub fn match_type(&self) -> MatchType {
        self.match_type
    }

    pub fn data_type(&self) -> ScanDataType {
        self.data_type
    }

    /// Evaluate the predicate. `out` receives the surviving flags; the
    /// return value says whether anything survived.
    pub fn matches(
        &self,
        old: &Value,
        window: &[u8],
        user: Option<&UserValue>,
        out: &mut MatchFlags,
        ctx: &RoutineCtx,
    ) -> bool {
        out.clear();

        if self.match_type == MatchType::Any {
            match self.data_type {
                ScanDataType::ByteArray => {
                    out.bytearray_length = old.flags.bytearray_length;
                    return out.bytearray_length as usize <= window.len()
                        && out.bytearray_length > 0;
                }
                ScanDataType::String => {
                    out.string_length = old.flags.string_length;
                    return out.string_length as usize <= window.len() && out.string_length > 0;
                }
                _ => {
                    out.widths = old.flags.widths
                        & self.data_type.admissible_widths()
                        & MatchFlags::capability_widths(window.len());
                    return out.widths != 0;
                }
            }
        }

        match self.data_type {
            ScanDataType::ByteArray => self.match_bytearray(old, window, user, out),
            ScanDataType::String => self.match_string(old, window, user, out),
            _ => self.match_number(old, window, user, out, ctx),
        }
    }

    fn match_bytearray(
        &self,
        old: &Value,
        window: &[u8],
        user: Option<&UserValue>,
        out: &mut MatchFlags,
    ) -> bool {
        let Some(UserValue::ByteArray(elems)) = user else {
            return false;
        };
        let len = elems.len();
        if old.flags.bytearray_length as usize != len || window.len() < len {
            return false;
        }
        for (i, elem) in elems.iter().enumerate() {
            if !elem.wildcard && window[i] != elem.byte {
                return false;
            }
        }
        out.bytearray_length = len as u16;
        true
    }

    fn match_string(
        &self,
        old: &Value,
        window: &[u8],
        user: Option<&UserValue>,
        out: &mut MatchFlags,
    ) -> bool {
        let Some(UserValue::String(text)) = user else {
            return false;
        };
        let len = text.len();
        if old.flags.string_length as usize != len || window.len() < len {
            return false;
        }
        if &window[..len] != text.as_slice() {
            return false;
        }
        out.string_length = len as u16;
        true
    }

    fn match_number(
        &self,
        old: &Value,
        window: &[u8],
        user: Option<&UserValue>,
        out: &mut MatchFlags,
        ctx: &RoutineCtx,
    ) -> bool {
        let new = Value::from_window(window);
        let rev = ctx.reverse_endianness;

        let mut cand = old.flags.widths & self.data_type.admissible_widths() & new.flags.widths;

        let user_num: Option<UserNumber> = match user {
            Some(UserValue::Number(n)) => Some(*n),
            _ => None,
        };
        let user_range: Option<(UserNumber, UserNumber)> = match user {
            Some(UserValue::Range(lo, hi)) => Some((*lo, *hi)),
            _ => None,
        };

        // operand-carrying predicates only see widths the literal fits
        match self.match_type {
            MatchType::EqualTo
            | MatchType::NotEqualTo
            | MatchType::GreaterThan
            | MatchType::LessThan
            | MatchType::IncreasedBy
            | MatchType::DecreasedBy => match user_num {
                Some(n) => cand &= n.flags.widths,
                None => return false,
            },
            MatchType::Range => match user_range {
                Some((lo, hi)) => cand &= lo.flags.widths & hi.flags.widths,
                None => return false,
            },
            _ => {}
        }
        if cand == 0 {
            return false;
        }

        let unum = user_num.unwrap_or_default();
        let (rlo, rhi) = user_range.unwrap_or_default();
        let mut kept: u16 = 0;

        macro_rules! int_width {
            ($flag:expr, $get:ident, $ity:ty, $uty:ty, $ufield:ident) => {
                if cand & $flag != 0 {
                    let n = new.$get(rev);
                    let o = old.$get(rev);
                    let u = unum.$ufield as $ity;
                    let half: $uty = (<$uty>::MAX >> 1) + 1;
                    let hit = match self.match_type {
                        MatchType::Any => true,
                        MatchType::EqualTo => n == u,
                        MatchType::NotEqualTo => n != u,
                        MatchType::GreaterThan => n > u,
                        MatchType::LessThan => n < u,
                        MatchType::Range => {
                            rlo.$ufield as $ity <= n && n <= rhi.$ufield as $ity
                        }
                        MatchType::Changed => n != o,
                        MatchType::NotChanged => n == o,
                        MatchType::Increased => {
                            if ctx.detect_reverse_change {
                                let d = (n as $uty).wrapping_sub(o as $uty);
                                d != 0 && d < half
                            } else {
                                n > o
                            }
                        }
                        MatchType::Decreased => {
                            if ctx.detect_reverse_change {
                                let d = (o as $uty).wrapping_sub(n as $uty);
                                d != 0 && d < half
                            } else {
                                n < o
                            }
                        }
                        MatchType::IncreasedBy => n.wrapping_sub(o) == u,
                        MatchType::DecreasedBy => o.wrapping_sub(n) == u,
                    };
                    if hit {
                        kept |= $flag;
                    }
                }
            };
        }

        macro_rules! float_width {
            ($flag:expr, $get:ident, $fty:ty) => {
                if cand & $flag != 0 {
                    let n = new.$get(rev);
                    let o = old.$get(rev);
                    let u = unum.float_value as $fty;
                    let hit = match self.match_type {
                        MatchType::Any => true,
                        MatchType::EqualTo => n == u,
                        MatchType::NotEqualTo => n != u,
                        MatchType::GreaterThan => n > u,
                        MatchType::LessThan => n < u,
                        MatchType::Range => {
                            rlo.float_value as $fty <= n && n <= rhi.float_value as $fty
                        }
                        MatchType::Changed => n != o,
                        MatchType::NotChanged => n == o,
                        MatchType::Increased => n > o,
                        MatchType::Decreased => n < o,
                        MatchType::IncreasedBy => n - o == u,
                        MatchType::DecreasedBy => o - n == u,
                    };
                    if hit {
                        kept |= $flag;
                    }
                }
            };
        }

        int_width!(MatchFlags::U8, u8, u8, u8, uint_value);
        int_width!(MatchFlags::S8, i8, i8, u8, int_value);
        int_width!(MatchFlags::U16, u16, u16, u16, uint_value);
        int_width!(MatchFlags::S16, i16, i16, u16, int_value);
        int_width!(MatchFlags::U32, u32, u32, u32, uint_value);
        int_width!(MatchFlags::S32, i32, i32, u32, int_value);
        int_width!(MatchFlags::U64, u64, u64, u64, uint_value);
        int_width!(MatchFlags::S64, i64, i64, u64, int_value);
        float_width!(MatchFlags::F32, f32, f32);
        float_width!(MatchFlags::F64, f64, f64);

        out.widths = kept;
        kept != 0
    }
}
