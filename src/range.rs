//! Parsing and emitting selection lists such as `0-3,7,10-12` or `all`.
//!
//! The grammar is a comma-separated list of tokens. A token is a non-negative integer, a
//! closed range `A-B` with `A <= B`, or the keyword `all`, which must be the only token.
//! Whitespace around tokens is ignored and duplicates collapse. The parser knows nothing about
//! topology, callers validate the numbers against whatever domain applies to them.

use crate::util::error::RangeError;
use std::collections::BTreeSet;
use std::fmt::Write;

pub const ALL: &str = "all";

/// The result of parsing a list before it is checked against a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeSpec {
    All,
    Values(BTreeSet<u32>),
}

/// The set of values a list may refer to.
#[derive(Debug, Clone, Copy)]
pub enum Domain<'a> {
    /// Every value from 0 up to and including the bound.
    UpTo(u32),
    /// An explicit enumeration, such as "all online CPUs".
    Values(&'a BTreeSet<u32>),
}

impl Domain<'_> {
    fn contains(&self, value: u32) -> bool {
        match self {
            Self::UpTo(max) => value <= *max,
            Self::Values(values) => values.contains(&value),
        }
    }

    /// The largest value in the domain, if any.
    fn max(&self) -> Option<u32> {
        match self {
            Self::UpTo(max) => Some(*max),
            Self::Values(values) => values.last().copied(),
        }
    }

    fn to_set(self) -> BTreeSet<u32> {
        match self {
            Self::UpTo(max) => (0..=max).collect(),
            Self::Values(values) => values.clone(),
        }
    }
}

/// Parse a selection list into either `all` or a set of numbers.
pub fn parse(input: &str) -> Result<RangeSpec, RangeError> {
    parse_limited(input, u32::MAX, String::new)
}

/// Like [`parse`], but any number above `max` is rejected before ranges are expanded, so a
/// list such as `0-4294967295` fails at once instead of building a huge set.
pub fn parse_bounded(input: &str, max: u32) -> Result<RangeSpec, RangeError> {
    parse_limited(input, max, || {
        if max == 0 {
            "0".to_string()
        } else {
            format!("0-{max}")
        }
    })
}

fn parse_limited(
    input: &str,
    max: u32,
    valid: impl Fn() -> String,
) -> Result<RangeSpec, RangeError> {
    let tokens: Vec<&str> = input.split(',').map(str::trim).collect();

    if tokens.len() == 1 && tokens[0].is_empty() {
        return Err(syntax_error(input, input, "the list is empty"));
    }

    if tokens.iter().any(|token| *token == ALL) {
        if tokens.len() != 1 {
            return Err(syntax_error(
                input,
                ALL,
                "'all' cannot be combined with other values",
            ));
        }
        return Ok(RangeSpec::All);
    }

    let mut values = BTreeSet::new();
    for token in tokens {
        let (start, end) = parse_token(input, token)?;
        if end > max {
            return Err(RangeError::OutOfDomain {
                input: input.to_string(),
                value: start.max(max.saturating_add(1)),
                valid: valid(),
            });
        }
        values.extend(start..=end);
    }

    Ok(RangeSpec::Values(values))
}

/// Parse a selection list and check every value against `domain`. `all` expands to the whole
/// domain.
pub fn parse_in(input: &str, domain: Domain<'_>) -> Result<BTreeSet<u32>, RangeError> {
    let spec = match domain.max() {
        Some(max) => parse_limited(input, max, || emit(domain.to_set()))?,
        None => parse_limited(input, 0, String::new)?,
    };
    match spec {
        RangeSpec::All => Ok(domain.to_set()),
        RangeSpec::Values(values) => {
            if let Some(&value) = values.iter().find(|value| !domain.contains(**value)) {
                return Err(RangeError::OutOfDomain {
                    input: input.to_string(),
                    value,
                    valid: emit(domain.to_set()),
                });
            }
            Ok(values)
        }
    }
}

/// Parse a list in the format the kernel uses in sysfs files, where an empty list is valid.
pub fn parse_cpulist(contents: &str) -> Result<BTreeSet<u32>, RangeError> {
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Ok(BTreeSet::new());
    }

    match parse(trimmed)? {
        RangeSpec::Values(values) => Ok(values),
        RangeSpec::All => Err(syntax_error(trimmed, ALL, "keywords are not allowed here")),
    }
}

/// Emit numbers in canonical form: ascending, with runs of consecutive numbers collapsed into
/// ranges (`0-3,7,10-12`).
pub fn emit(values: impl IntoIterator<Item = u32>) -> String {
    let sorted: BTreeSet<u32> = values.into_iter().collect();
    let mut out = String::new();
    let mut iter = sorted.into_iter().peekable();

    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(next) = end.checked_add(1).filter(|next| iter.peek() == Some(next)) {
            end = next;
            iter.next();
        }

        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            let _ = write!(out, "{start}");
        } else {
            let _ = write!(out, "{start}-{end}");
        }
    }

    out
}

/// Parse one token into the inclusive bounds it covers.
fn parse_token(input: &str, token: &str) -> Result<(u32, u32), RangeError> {
    if token.is_empty() {
        return Err(syntax_error(input, token, "empty element in the list"));
    }

    if token.starts_with('-') {
        return Err(syntax_error(input, token, "negative numbers are not allowed"));
    }

    match token.split_once('-') {
        Some((start, end)) => {
            let start = parse_number(input, token, start.trim(), "range start")?;
            let end = parse_number(input, token, end.trim(), "range end")?;
            if start > end {
                return Err(syntax_error(
                    input,
                    token,
                    "range start must not be greater than range end",
                ));
            }
            Ok((start, end))
        }
        None => {
            let value = parse_number(input, token, token, "value")?;
            Ok((value, value))
        }
    }
}

fn parse_number(input: &str, token: &str, number: &str, what: &str) -> Result<u32, RangeError> {
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        let problem = if number.starts_with('-') {
            format!("{what} must not be negative")
        } else {
            format!("{what} '{number}' is not a non-negative integer")
        };
        return Err(syntax_error(input, token, &problem));
    }

    number
        .parse::<u32>()
        .map_err(|e| syntax_error(input, token, &format!("{what} '{number}': {e}")))
}

fn syntax_error(input: &str, token: &str, problem: &str) -> RangeError {
    RangeError::InvalidSyntax {
        input: input.to_string(),
        token: token.to_string(),
        problem: problem.to_string(),
    }
}
