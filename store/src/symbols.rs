//! Structural parsing of SCIP symbol names.
//!
//! A global symbol is `<scheme> <manager> <package-name> <package-version> <descriptors>`.
//! Header fields are split on single spaces; a doubled space is an escaped
//! literal space and backtick-quoted spans are atomic. The descriptor tail is
//! split into components, each keeping its suffix punctuation, so that joining
//! the segments again yields the exact input.

use std::fmt;

use thiserror::Error;

const HEADER_FIELDS: [SegmentType; 4] = [
    SegmentType::Scheme,
    SegmentType::PackageManager,
    SegmentType::PackageName,
    SegmentType::PackageVersion,
];

const LOCAL_PREFIX: &str = "local ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SegmentType {
    Scheme,
    PackageManager,
    PackageName,
    PackageVersion,
    Descriptor,
}

impl SegmentType {
    pub const fn as_str(self) -> &'static str {
        match self {
            SegmentType::Scheme => "SCHEME",
            SegmentType::PackageManager => "PACKAGE_MANAGER",
            SegmentType::PackageName => "PACKAGE_NAME",
            SegmentType::PackageVersion => "PACKAGE_VERSION",
            SegmentType::Descriptor => "DESCRIPTOR",
        }
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a descriptor component, stored as the segment quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorKind {
    Namespace,
    Type,
    Term,
    Method,
    TypeParameter,
    Parameter,
    Meta,
    Macro,
    Local,
}

impl DescriptorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            DescriptorKind::Namespace => "NAMESPACE",
            DescriptorKind::Type => "TYPE",
            DescriptorKind::Term => "TERM",
            DescriptorKind::Method => "METHOD",
            DescriptorKind::TypeParameter => "TYPE_PARAMETER",
            DescriptorKind::Parameter => "PARAMETER",
            DescriptorKind::Meta => "META",
            DescriptorKind::Macro => "MACRO",
            DescriptorKind::Local => "LOCAL",
        }
    }

    fn from_suffix(suffix: u8) -> Option<Self> {
        match suffix {
            b'/' => Some(DescriptorKind::Namespace),
            b'#' => Some(DescriptorKind::Type),
            b'.' => Some(DescriptorKind::Term),
            b':' => Some(DescriptorKind::Meta),
            b'!' => Some(DescriptorKind::Macro),
            _ => None,
        }
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment<'a> {
    pub segment_type: SegmentType,
    pub quality: Option<DescriptorKind>,
    pub name: &'a str,
}

impl<'a> Segment<'a> {
    fn header(segment_type: SegmentType, name: &'a str) -> Self {
        Self {
            segment_type,
            quality: None,
            name,
        }
    }

    fn descriptor(quality: Option<DescriptorKind>, name: &'a str) -> Self {
        Self {
            segment_type: SegmentType::Descriptor,
            quality,
            name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid symbol {symbol:?}: {reason}")]
pub struct ParseError {
    pub symbol: String,
    pub reason: ParseErrorReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorReason {
    #[error("expected at least {expected} space-separated fields, found {found}")]
    TooFewFields { expected: usize, found: usize },
    #[error("empty {0} field")]
    EmptyField(SegmentType),
    #[error("empty local identifier")]
    EmptyLocalId,
    #[error("unterminated backtick quote opened at byte {0}")]
    UnterminatedQuote(usize),
    #[error("unterminated '{open}' opened at byte {offset}")]
    UnterminatedDelimiter { open: char, offset: usize },
    #[error("expected '.' after method disambiguator at byte {0}")]
    MissingMethodSuffix(usize),
    #[error("empty descriptor name at byte {0}")]
    EmptyDescriptorName(usize),
}

/// Splits a symbol name into its ordered structural segments.
pub fn parse_symbol(symbol: &str) -> Result<Vec<Segment<'_>>, ParseError> {
    let fail = |reason| ParseError {
        symbol: symbol.to_string(),
        reason,
    };

    if let Some(local_id) = symbol.strip_prefix(LOCAL_PREFIX) {
        if local_id.is_empty() {
            return Err(fail(ParseErrorReason::EmptyLocalId));
        }
        return Ok(vec![
            Segment::header(SegmentType::Scheme, &symbol[..LOCAL_PREFIX.len() - 1]),
            Segment::descriptor(Some(DescriptorKind::Local), local_id),
        ]);
    }

    let mut segments = Vec::with_capacity(HEADER_FIELDS.len() + 4);
    let mut cursor = 0;

    for segment_type in HEADER_FIELDS {
        let end = scan_header_field(symbol, cursor).map_err(fail)?;
        let Some(end) = end else {
            let found = segments.len() + usize::from(cursor < symbol.len());
            return Err(fail(ParseErrorReason::TooFewFields {
                expected: HEADER_FIELDS.len() + 1,
                found,
            }));
        };
        if end == cursor {
            return Err(fail(ParseErrorReason::EmptyField(segment_type)));
        }
        segments.push(Segment::header(segment_type, &symbol[cursor..end]));
        cursor = end + 1;
    }

    if cursor >= symbol.len() {
        return Err(fail(ParseErrorReason::TooFewFields {
            expected: HEADER_FIELDS.len() + 1,
            found: HEADER_FIELDS.len(),
        }));
    }

    parse_descriptors(symbol, cursor, &mut segments).map_err(fail)?;
    Ok(segments)
}

/// Inverse of [`parse_symbol`].
pub fn join_segments<'a, I>(segments: I) -> String
where
    I: IntoIterator<Item = (SegmentType, &'a str)>,
{
    let mut joined = String::new();
    let mut in_descriptors = false;

    for (idx, (segment_type, name)) in segments.into_iter().enumerate() {
        if segment_type == SegmentType::Descriptor {
            if !in_descriptors && idx > 0 {
                joined.push(' ');
            }
            in_descriptors = true;
        } else if idx > 0 {
            joined.push(' ');
        }
        joined.push_str(name);
    }

    joined
}

// Returns the byte offset of the space terminating the field that starts at
// `start`, or `None` when the field runs to the end of the input.
fn scan_header_field(symbol: &str, start: usize) -> Result<Option<usize>, ParseErrorReason> {
    let bytes = symbol.as_bytes();
    let mut idx = start;

    while idx < bytes.len() {
        match bytes[idx] {
            b'`' => idx = skip_quoted(bytes, idx)?,
            b' ' if bytes.get(idx + 1) == Some(&b' ') => idx += 2,
            b' ' => return Ok(Some(idx)),
            _ => idx += 1,
        }
    }

    Ok(None)
}

fn parse_descriptors<'a>(
    symbol: &'a str,
    mut cursor: usize,
    segments: &mut Vec<Segment<'a>>,
) -> Result<(), ParseErrorReason> {
    let bytes = symbol.as_bytes();

    while cursor < bytes.len() {
        let start = cursor;

        let enclosed = match bytes[start] {
            b'(' => Some((b')', DescriptorKind::Parameter)),
            b'[' => Some((b']', DescriptorKind::TypeParameter)),
            _ => None,
        };
        if let Some((close, kind)) = enclosed {
            let end = find_closing(bytes, start, close)?;
            if end == start + 1 {
                return Err(ParseErrorReason::EmptyDescriptorName(start));
            }
            cursor = end + 1;
            segments.push(Segment::descriptor(Some(kind), &symbol[start..cursor]));
            continue;
        }

        cursor = scan_name(bytes, start)?;
        if cursor == start {
            return Err(ParseErrorReason::EmptyDescriptorName(start));
        }
        if cursor == bytes.len() {
            segments.push(Segment::descriptor(None, &symbol[start..]));
            break;
        }

        let kind = if bytes[cursor] == b'(' {
            let end = find_closing(bytes, cursor, b')')?;
            if bytes.get(end + 1) != Some(&b'.') {
                return Err(ParseErrorReason::MissingMethodSuffix(end + 1));
            }
            cursor = end + 1;
            DescriptorKind::Method
        } else {
            DescriptorKind::from_suffix(bytes[cursor]).ok_or(ParseErrorReason::EmptyDescriptorName(start))?
        };

        cursor += 1;
        segments.push(Segment::descriptor(Some(kind), &symbol[start..cursor]));
    }

    Ok(())
}

// Advances over a descriptor name, stopping at the first suffix character
// outside of a quoted span.
fn scan_name(bytes: &[u8], start: usize) -> Result<usize, ParseErrorReason> {
    let mut idx = start;
    while idx < bytes.len() {
        match bytes[idx] {
            b'`' => idx = skip_quoted(bytes, idx)?,
            b'/' | b'#' | b'.' | b':' | b'!' | b'(' => return Ok(idx),
            _ => idx += 1,
        }
    }
    Ok(idx)
}

fn find_closing(bytes: &[u8], open: usize, close: u8) -> Result<usize, ParseErrorReason> {
    let mut idx = open + 1;
    while idx < bytes.len() {
        match bytes[idx] {
            b'`' => idx = skip_quoted(bytes, idx)?,
            byte if byte == close => return Ok(idx),
            _ => idx += 1,
        }
    }
    Err(ParseErrorReason::UnterminatedDelimiter {
        open: bytes[open] as char,
        offset: open,
    })
}

// Returns the offset just past the backtick closing the span opened at `open`.
// A doubled backtick inside the span is a literal backtick.
fn skip_quoted(bytes: &[u8], open: usize) -> Result<usize, ParseErrorReason> {
    let mut idx = open + 1;
    while idx < bytes.len() {
        if bytes[idx] == b'`' {
            if bytes.get(idx + 1) == Some(&b'`') {
                idx += 2;
                continue;
            }
            return Ok(idx + 1);
        }
        idx += 1;
    }
    Err(ParseErrorReason::UnterminatedQuote(open))
}
