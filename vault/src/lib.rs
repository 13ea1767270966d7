//! Vault library: items, groups and areas stored as plain-text files with a
//! YAML header and a free-form body.
//!
//! The modules keep a typed view of those files without ever dropping what the
//! types do not model: unknown header fields, the date-vs-timestamp shape a user
//! picked, the way a reference was spelled, and the body text all survive a
//! read-modify-write cycle unchanged.

pub mod error {
    use crate::model::EntityKind;
    use std::path::{Path, PathBuf};

    /// Every failure a vault operation can report.
    #[derive(Debug, thiserror::Error)]
    pub enum VaultError {
        #[error("not found: {path:?}")]
        NotFound { path: PathBuf },
        #[error("parse error in {path:?}: {message}")]
        Parse { path: PathBuf, message: String },
        #[error("{path:?}: missing required field `{field}`")]
        MissingField { path: PathBuf, field: String },
        #[error("{path:?}: invalid value {value:?} for `{field}`: {reason}")]
        InvalidField {
            path: PathBuf,
            field: String,
            value: String,
            reason: String,
        },
        #[error("{path:?}: {message}")]
        Validation { path: PathBuf, message: String },
        #[error("no {kind} matches {reference:?}")]
        UnresolvedReference { kind: EntityKind, reference: String },
        #[error("{reference:?} matches more than one {kind}")]
        AmbiguousReference {
            kind: EntityKind,
            reference: String,
            candidates: Vec<PathBuf>,
        },
        #[error("refusing to overwrite existing file {path:?}")]
        WriteConflict { path: PathBuf },
        #[error("i/o error on {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("configuration error: {0}")]
        Config(String),
    }

    impl VaultError {
        /// Classify an I/O failure on `path`; missing files and existing
        /// destinations get their own variants.
        pub fn io(path: &Path, source: std::io::Error) -> Self {
            let path = path.to_path_buf();
            match source.kind() {
                std::io::ErrorKind::NotFound => Self::NotFound { path },
                std::io::ErrorKind::AlreadyExists => Self::WriteConflict { path },
                _ => Self::Io { path, source },
            }
        }

        /// The file the error is about, when there is one.
        pub fn path(&self) -> Option<&Path> {
            match self {
                Self::NotFound { path }
                | Self::Parse { path, .. }
                | Self::MissingField { path, .. }
                | Self::InvalidField { path, .. }
                | Self::Validation { path, .. }
                | Self::WriteConflict { path }
                | Self::Io { path, .. } => Some(path),
                Self::UnresolvedReference { .. }
                | Self::AmbiguousReference { .. }
                | Self::Config(_) => None,
            }
        }
    }

    pub type Result<T, E = VaultError> = std::result::Result<T, E>;
}

pub mod values {
    //! Format-preserving value types.
    //!
    //! A `DateValue` remembers whether it was written as a plain date or as a
    //! timestamp (and in which shape); a `Reference` remembers whether it was a
    //! `[[link]]`, a relative path, or a bare filename. `Display` is the exact
    //! inverse of `parse` for every shape.

    use crate::config::normalize_path;
    use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::take_while_m_n,
        character::complete::{char, one_of},
        combinator::{all_consuming, map_opt, opt, value},
        sequence::{preceded, tuple},
    };
    use std::{
        fmt,
        path::{Path, PathBuf},
        str::FromStr,
    };

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ValueError {
        #[error("invalid date or timestamp {0:?}")]
        InvalidDate(String),
        #[error("invalid reference {0:?}")]
        InvalidReference(String),
    }

    /* --------------------------- Date or timestamp --------------------------- */

    /// A calendar date or a date+time, tagged with the shape it was read in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DateValue {
        Date(NaiveDate),
        Timestamp(Timestamp),
    }

    /// Date+time plus everything needed to print it back identically.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Timestamp {
        datetime: NaiveDateTime,
        offset: Option<UtcOffset>,
        style: TimestampStyle,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum UtcOffset {
        /// Written as `Z`.
        Utc,
        /// Written as `+HH:MM` / `-HH:MM`.
        Fixed(FixedOffset),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimestampStyle {
        /// `T` or a single space.
        pub separator: char,
        pub precision: Precision,
    }

    impl Default for TimestampStyle {
        fn default() -> Self {
            Self {
                separator: 'T',
                precision: Precision::Seconds,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Precision {
        Minutes,
        Seconds,
        /// Fractional seconds with this many digits (1..=9).
        Fraction(u8),
    }

    impl Precision {
        fn truncate(self, dt: NaiveDateTime) -> NaiveDateTime {
            let truncated = match self {
                Precision::Minutes => dt.with_second(0).and_then(|d| d.with_nanosecond(0)),
                Precision::Seconds => dt.with_nanosecond(0),
                Precision::Fraction(digits) => {
                    let step = 10u32.pow(9 - u32::from(digits.clamp(1, 9)));
                    dt.with_nanosecond(dt.nanosecond() - dt.nanosecond() % step)
                }
            };
            truncated.unwrap_or(dt)
        }
    }

    impl Timestamp {
        pub fn new(datetime: NaiveDateTime, offset: Option<UtcOffset>, style: TimestampStyle) -> Self {
            Self {
                datetime: style.precision.truncate(datetime),
                offset,
                style,
            }
        }

        pub fn datetime(&self) -> NaiveDateTime {
            self.datetime
        }

        pub fn offset(&self) -> Option<UtcOffset> {
            self.offset
        }

        pub fn style(&self) -> TimestampStyle {
            self.style
        }
    }

    impl DateValue {
        pub fn parse(text: &str) -> Result<Self, ValueError> {
            all_consuming(date_value)(text)
                .map(|(_, parsed)| parsed)
                .map_err(|_| ValueError::InvalidDate(text.to_string()))
        }

        /// The calendar date, ignoring any time component.
        pub fn date(&self) -> NaiveDate {
            match self {
                DateValue::Date(date) => *date,
                DateValue::Timestamp(ts) => ts.datetime.date(),
            }
        }

        pub fn is_timestamp(&self) -> bool {
            matches!(self, DateValue::Timestamp(_))
        }

        /// A fresh timestamp for `now` in the default shape (`YYYY-MM-DDTHH:MM:SS`).
        pub fn stamp(now: &DateTime<FixedOffset>) -> Self {
            DateValue::Timestamp(Timestamp::new(
                now.naive_local(),
                None,
                TimestampStyle::default(),
            ))
        }

        /// `now`, written in the same shape as `self`.
        pub fn restamp(&self, now: &DateTime<FixedOffset>) -> Self {
            match self {
                DateValue::Date(_) => DateValue::Date(now.date_naive()),
                DateValue::Timestamp(ts) => {
                    let local = match ts.offset {
                        None => now.naive_local(),
                        Some(UtcOffset::Utc) => now.naive_utc(),
                        Some(UtcOffset::Fixed(offset)) => now.with_timezone(&offset).naive_local(),
                    };
                    DateValue::Timestamp(Timestamp::new(local, ts.offset, ts.style))
                }
            }
        }

        /// Ordering key; plain dates sort as midnight.
        pub fn sort_key(&self) -> NaiveDateTime {
            match self {
                DateValue::Date(date) => date.and_time(NaiveTime::default()),
                DateValue::Timestamp(ts) => ts.datetime,
            }
        }
    }

    impl fmt::Display for DateValue {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                DateValue::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
                DateValue::Timestamp(ts) => write!(f, "{ts}"),
            }
        }
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let dt = self.datetime;
            write!(
                f,
                "{}{}{}",
                dt.format("%Y-%m-%d"),
                self.style.separator,
                dt.format("%H:%M")
            )?;
            match self.style.precision {
                Precision::Minutes => {}
                Precision::Seconds => write!(f, ":{:02}", dt.second())?,
                Precision::Fraction(digits) => {
                    let nanos = format!("{:09}", dt.nanosecond().min(999_999_999));
                    let digits = usize::from(digits.clamp(1, 9));
                    write!(f, ":{:02}.{}", dt.second(), &nanos[..digits])?;
                }
            }
            match self.offset {
                None => Ok(()),
                Some(UtcOffset::Utc) => f.write_str("Z"),
                Some(UtcOffset::Fixed(offset)) => {
                    let seconds = offset.local_minus_utc();
                    let sign = if seconds < 0 { '-' } else { '+' };
                    let seconds = seconds.abs();
                    write!(f, "{sign}{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60)
                }
            }
        }
    }

    impl FromStr for DateValue {
        type Err = ValueError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            DateValue::parse(s)
        }
    }

    /* ------------------------------ nom parsers ------------------------------ */

    fn digits<'a>(count: usize) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
        take_while_m_n(count, count, |c: char| c.is_ascii_digit())
    }

    fn calendar_date(i: &str) -> IResult<&str, NaiveDate> {
        map_opt(
            tuple((digits(4), char('-'), digits(2), char('-'), digits(2))),
            |(y, _, m, _, d)| {
                NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
            },
        )(i)
    }

    fn clock_time(i: &str) -> IResult<&str, (NaiveTime, Precision)> {
        map_opt(
            tuple((
                digits(2),
                preceded(char(':'), digits(2)),
                opt(tuple((
                    preceded(char(':'), digits(2)),
                    opt(preceded(
                        char('.'),
                        take_while_m_n(1, 9, |c: char| c.is_ascii_digit()),
                    )),
                ))),
            )),
            |(h, m, rest)| {
                let hour = h.parse().ok()?;
                let minute = m.parse().ok()?;
                let (second, nanos, precision) = match rest {
                    None => (0, 0, Precision::Minutes),
                    Some((s, None)) => (s.parse().ok()?, 0, Precision::Seconds),
                    Some((s, Some(frac))) => {
                        let padded = format!("{frac:0<9}");
                        let digits = u8::try_from(frac.len()).ok()?;
                        (s.parse().ok()?, padded.parse().ok()?, Precision::Fraction(digits))
                    }
                };
                NaiveTime::from_hms_nano_opt(hour, minute, second, nanos).map(|t| (t, precision))
            },
        )(i)
    }

    fn utc_offset(i: &str) -> IResult<&str, UtcOffset> {
        alt((
            value(UtcOffset::Utc, char('Z')),
            map_opt(
                tuple((one_of("+-"), digits(2), char(':'), digits(2))),
                |(sign, h, _, m)| {
                    let seconds = h.parse::<i32>().ok()? * 3600 + m.parse::<i32>().ok()? * 60;
                    let seconds = if sign == '-' { -seconds } else { seconds };
                    FixedOffset::east_opt(seconds).map(UtcOffset::Fixed)
                },
            ),
        ))(i)
    }

    fn date_value(i: &str) -> IResult<&str, DateValue> {
        let (i, date) = calendar_date(i)?;
        let (i, time) = opt(tuple((one_of("T "), clock_time, opt(utc_offset))))(i)?;
        let parsed = match time {
            None => DateValue::Date(date),
            Some((separator, (time, precision), offset)) => DateValue::Timestamp(Timestamp {
                datetime: date.and_time(time),
                offset,
                style: TimestampStyle {
                    separator,
                    precision,
                },
            }),
        };
        Ok((i, parsed))
    }

    /* ------------------------------- References ------------------------------- */

    /// A pointer from one vault file to another, in the spelling it was read in.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub enum Reference {
        /// `[[Name]]` or `[[Name|Alias]]`.
        Link { target: String, alias: Option<String> },
        /// Relative path containing a separator, e.g. `../groups/q1-plan.md`.
        Path(String),
        /// Bare filename, e.g. `q1-plan.md`.
        File(String),
    }

    impl Reference {
        /// Parse one reference. A `#heading` suffix inside a link is dropped.
        pub fn parse(text: &str) -> Result<Self, ValueError> {
            let invalid = || ValueError::InvalidReference(text.to_string());
            let trimmed = text.trim();
            if let Some(inner) = trimmed.strip_prefix("[[") {
                let inner = inner.strip_suffix("]]").ok_or_else(invalid)?;
                if inner.contains("[[") || inner.contains("]]") {
                    return Err(invalid());
                }
                let (left, alias) = match inner.split_once('|') {
                    Some((left, alias)) => {
                        let alias = alias.trim();
                        (left, (!alias.is_empty()).then(|| alias.to_string()))
                    }
                    None => (inner, None),
                };
                let target = left.split_once('#').map_or(left, |(target, _)| target).trim();
                if target.is_empty() {
                    return Err(invalid());
                }
                return Ok(Reference::Link {
                    target: target.to_string(),
                    alias,
                });
            }
            if trimmed.is_empty() || trimmed.contains("[[") || trimmed.contains("]]") {
                return Err(invalid());
            }
            if trimmed.contains(['/', '\\']) {
                Ok(Reference::Path(trimmed.to_string()))
            } else {
                Ok(Reference::File(trimmed.to_string()))
            }
        }

        pub fn link(target: impl Into<String>) -> Self {
            Reference::Link {
                target: target.into(),
                alias: None,
            }
        }

        /// Link target, path or filename as written.
        pub fn name(&self) -> &str {
            match self {
                Reference::Link { target, .. } => target,
                Reference::Path(path) | Reference::File(path) => path,
            }
        }

        pub fn alias(&self) -> Option<&str> {
            match self {
                Reference::Link { alias, .. } => alias.as_deref(),
                _ => None,
            }
        }

        /// Lower-cased last segment without extension; the matching key.
        pub fn stem(&self) -> String {
            match self {
                Reference::Link { target, .. } => {
                    let last = target.rsplit(['/', '\\']).next().unwrap_or(target);
                    strip_markdown_ext(last).to_lowercase()
                }
                Reference::Path(path) | Reference::File(path) => {
                    let last = path.rsplit(['/', '\\']).next().unwrap_or(path);
                    Path::new(last)
                        .file_stem()
                        .map(|stem| stem.to_string_lossy().to_lowercase())
                        .unwrap_or_else(|| last.to_lowercase())
                }
            }
        }

        /// Whether two references point at the same name, whatever their spelling.
        pub fn same_target(&self, other: &Reference) -> bool {
            self.stem() == other.stem()
        }

        /// Concrete path for path/filename references, resolved against `base`.
        pub fn resolve_against(&self, base: &Path) -> Option<PathBuf> {
            match self {
                Reference::Link { .. } => None,
                Reference::Path(path) | Reference::File(path) => {
                    Some(normalize_path(&base.join(path.replace('\\', "/"))))
                }
            }
        }
    }

    fn strip_markdown_ext(name: &str) -> &str {
        let split = name.len().checked_sub(3).filter(|&at| at > 0 && name.is_char_boundary(at));
        match split {
            Some(at) if name[at..].eq_ignore_ascii_case(".md") => &name[..at],
            _ => name,
        }
    }

    impl fmt::Display for Reference {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Reference::Link {
                    target,
                    alias: Some(alias),
                } => write!(f, "[[{target}|{alias}]]"),
                Reference::Link { target, alias: None } => write!(f, "[[{target}]]"),
                Reference::Path(path) | Reference::File(path) => f.write_str(path),
            }
        }
    }

    impl FromStr for Reference {
        type Err = ValueError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Reference::parse(s)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::TimeZone;

        fn now() -> DateTime<FixedOffset> {
            FixedOffset::east_opt(3600)
                .unwrap()
                .with_ymd_and_hms(2025, 3, 1, 9, 15, 42)
                .unwrap()
        }

        #[test]
        fn dates_and_timestamps_print_back_as_written() {
            for text in [
                "2025-01-15",
                "2025-01-15T14:30",
                "2025-01-15 14:30",
                "2025-01-15T14:30:05",
                "2025-01-15T14:30:05.120",
                "2025-01-15T14:30:05.000000001",
                "2025-01-15T14:30Z",
                "2025-01-15T14:30:05+02:00",
                "2025-01-15T09:00-05:30",
            ] {
                let parsed = DateValue::parse(text).expect("parse");
                assert_eq!(parsed.to_string(), text);
            }
        }

        #[test]
        fn date_portion_ignores_time() {
            let ts = DateValue::parse("2025-01-14T23:59").expect("parse");
            assert!(ts.is_timestamp());
            assert_eq!(ts.date(), NaiveDate::from_ymd_opt(2025, 1, 14).unwrap());
            assert!(!DateValue::parse("2025-01-14").expect("parse").is_timestamp());
        }

        #[test]
        fn rejects_malformed_dates() {
            for text in [
                "",
                "2025-1-15",
                "2025-02-30",
                "2025-01-15T25:00",
                "2025-01-15T14",
                "2025-01-15 ",
                "tomorrow",
            ] {
                assert!(DateValue::parse(text).is_err(), "{text:?} should not parse");
            }
        }

        #[test]
        fn restamp_keeps_the_shape() {
            let date = DateValue::parse("2025-01-15").expect("date");
            assert_eq!(date.restamp(&now()).to_string(), "2025-03-01");

            let spaced = DateValue::parse("2025-01-15 14:30").expect("spaced");
            assert_eq!(spaced.restamp(&now()).to_string(), "2025-03-01 09:15");

            let utc = DateValue::parse("2025-01-15T14:30:05Z").expect("utc");
            assert_eq!(utc.restamp(&now()).to_string(), "2025-03-01T08:15:42Z");

            assert_eq!(DateValue::stamp(&now()).to_string(), "2025-03-01T09:15:42");
        }

        #[test]
        fn references_print_back_as_written() {
            for text in [
                "[[Q1 Plan]]",
                "[[Q1 Plan|the plan]]",
                "../groups/q1-plan.md",
                "q1-plan.md",
            ] {
                let parsed = Reference::parse(text).expect("parse");
                assert_eq!(parsed.to_string(), text);
            }
            assert!(matches!(
                Reference::parse("groups/q1.md"),
                Ok(Reference::Path(_))
            ));
            assert!(matches!(Reference::parse("q1.md"), Ok(Reference::File(_))));
        }

        #[test]
        fn link_heading_is_dropped_and_alias_kept() {
            let parsed = Reference::parse("[[Q1 Plan#Goals|Plan]]").expect("parse");
            assert_eq!(
                parsed,
                Reference::Link {
                    target: "Q1 Plan".into(),
                    alias: Some("Plan".into())
                }
            );
            assert_eq!(parsed.to_string(), "[[Q1 Plan|Plan]]");
        }

        #[test]
        fn same_target_ignores_spelling() {
            let link = Reference::parse("[[Q1 Plan|whatever]]").expect("link");
            let path = Reference::parse("../groups/Q1 Plan.md").expect("path");
            let file = Reference::parse("q1 plan.md").expect("file");
            assert!(link.same_target(&path));
            assert!(path.same_target(&file));
            assert!(!link.same_target(&Reference::link("Q2 Plan")));
        }

        #[test]
        fn rejects_malformed_references() {
            for text in ["", "  ", "[[]]", "[[a]", "[[#heading]]", "a]]"] {
                assert!(Reference::parse(text).is_err(), "{text:?} should not parse");
            }
        }

        #[test]
        fn path_references_resolve_against_base() {
            let base = Path::new("/vault/groups");
            let reference = Reference::parse("../groups/q1.md").expect("parse");
            assert_eq!(
                reference.resolve_against(base),
                Some(PathBuf::from("/vault/groups/q1.md"))
            );
            assert_eq!(Reference::link("Q1").resolve_against(base), None);
        }
    }
}

pub mod codec {
    //! Header/body codec.
    //!
    //! The header is split line by line into entries so each field keeps its
    //! original text; serde_yaml still parses the whole header so syntax errors
    //! and duplicate keys are rejected. Encoding concatenates the stored pieces,
    //! which makes an untouched document byte-identical to its source.

    use indexmap::IndexMap;
    use serde_yaml::{Mapping, Value};

    pub const DELIMITER: &str = "---";

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum CodecError {
        #[error("file does not start with a `---` line")]
        MissingOpeningDelimiter,
        #[error("header is not closed by a `---` line")]
        MissingClosingDelimiter,
        #[error("header line {line}: {message}")]
        Layout { line: usize, message: String },
        #[error("header is not valid YAML: {0}")]
        Syntax(String),
        #[error("header is not a mapping")]
        NotAMapping,
    }

    /// One top-level header field with the exact lines it came from.
    #[derive(Debug, Clone, PartialEq)]
    pub struct HeaderEntry {
        pub key: String,
        /// Key line plus continuation lines, line breaks included.
        pub text: String,
        /// Blank and comment lines that follow the entry.
        pub trivia: String,
        pub value: Value,
    }

    impl HeaderEntry {
        /// Source text after `key:`, trimmed; used in error messages.
        pub fn raw_value(&self) -> &str {
            let key_len = if self.text.starts_with(['"', '\'']) {
                self.key.len() + 2
            } else {
                self.key.len()
            };
            self.text
                .get(key_len..)
                .and_then(|rest| rest.trim_start().strip_prefix(':'))
                .unwrap_or("")
                .trim()
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Document {
        open: String,
        leading: String,
        entries: Vec<HeaderEntry>,
        close: String,
        pub body: String,
    }

    impl Document {
        /// An empty header in front of `body`, using `\n` line breaks.
        pub fn new(body: impl Into<String>) -> Self {
            Self {
                open: format!("{DELIMITER}\n"),
                leading: String::new(),
                entries: Vec::new(),
                close: format!("{DELIMITER}\n"),
                body: body.into(),
            }
        }

        pub fn decode(text: &str) -> Result<Self, CodecError> {
            let mut lines = text.split_inclusive('\n');
            let open = lines
                .next()
                .filter(|line| is_delimiter(line))
                .ok_or(CodecError::MissingOpeningDelimiter)?;
            let mut consumed = open.len();
            let mut header_lines = Vec::new();
            let mut close = None;
            for line in lines {
                consumed += line.len();
                if is_delimiter(line) {
                    close = Some(line);
                    break;
                }
                header_lines.push(line);
            }
            let close = close.ok_or(CodecError::MissingClosingDelimiter)?;
            let body = &text[consumed..];

            let mut leading = String::new();
            let mut entries: Vec<HeaderEntry> = Vec::new();
            for (idx, line) in header_lines.iter().enumerate() {
                let bare = line.trim_end_matches(['\r', '\n']);
                if is_trivia(bare) {
                    match entries.last_mut() {
                        Some(entry) => entry.trivia.push_str(line),
                        None => leading.push_str(line),
                    }
                } else if let Some(key) = entry_key(bare) {
                    entries.push(HeaderEntry {
                        key,
                        text: line.to_string(),
                        trivia: String::new(),
                        value: Value::Null,
                    });
                } else {
                    let Some(entry) = entries.last_mut() else {
                        return Err(CodecError::Layout {
                            line: idx + 2,
                            message: "continuation line before the first field".into(),
                        });
                    };
                    // blank or comment lines inside a block belong to the value
                    let trivia = std::mem::take(&mut entry.trivia);
                    entry.text.push_str(&trivia);
                    entry.text.push_str(line);
                }
            }

            if !entries.is_empty() {
                let mapping = match serde_yaml::from_str::<Value>(&header_lines.concat()) {
                    Ok(Value::Mapping(mapping)) => mapping,
                    Ok(_) => return Err(CodecError::NotAMapping),
                    Err(err) => return Err(CodecError::Syntax(err.to_string())),
                };
                if mapping.len() != entries.len() {
                    return Err(CodecError::Layout {
                        line: 2,
                        message: format!(
                            "found {} field lines but the header holds {} keys",
                            entries.len(),
                            mapping.len()
                        ),
                    });
                }
                for entry in &mut entries {
                    entry.value = lookup(&mapping, &entry.key).cloned().ok_or_else(|| {
                        CodecError::Layout {
                            line: 2,
                            message: format!("cannot attribute key `{}`", entry.key),
                        }
                    })?;
                }
            }

            Ok(Self {
                open: open.to_string(),
                leading,
                entries,
                close: close.to_string(),
                body: body.to_string(),
            })
        }

        pub fn encode(&self) -> String {
            let mut out = String::with_capacity(
                self.open.len() + self.close.len() + self.body.len() + 64 * self.entries.len(),
            );
            out.push_str(&self.open);
            out.push_str(&self.leading);
            for entry in &self.entries {
                out.push_str(&entry.text);
                out.push_str(&entry.trivia);
            }
            out.push_str(&self.close);
            if !self.body.is_empty() && !self.close.ends_with('\n') {
                out.push_str(self.newline());
            }
            out.push_str(&self.body);
            out
        }

        /// Line break used by the file, taken from its opening delimiter.
        pub fn newline(&self) -> &'static str {
            if self.open.ends_with("\r\n") { "\r\n" } else { "\n" }
        }

        pub fn entries(&self) -> &[HeaderEntry] {
            &self.entries
        }

        pub fn entry(&self, key: &str) -> Option<&HeaderEntry> {
            self.entries.iter().find(|entry| entry.key == key)
        }

        pub fn get(&self, key: &str) -> Option<&Value> {
            self.entry(key).map(|entry| &entry.value)
        }

        pub fn contains_key(&self, key: &str) -> bool {
            self.entry(key).is_some()
        }

        pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
            self.entries.iter().map(|entry| entry.key.as_str())
        }

        /// Rewrite `key` in place, or append it after the last field.
        pub fn set(&mut self, key: &str, field: FieldValue) {
            let text = field.render(key, self.newline());
            let value = field.into_value();
            if let Some(entry) = self.entries.iter_mut().find(|entry| entry.key == key) {
                entry.text = text;
                entry.value = value;
                return;
            }
            // trailing blank lines stay at the end of the header
            let trivia = self
                .entries
                .last_mut()
                .map(|last| std::mem::take(&mut last.trivia))
                .unwrap_or_default();
            self.entries.push(HeaderEntry {
                key: key.to_string(),
                text,
                trivia,
                value,
            });
        }

        /// Drop `key`; its trivia moves to the previous entry.
        pub fn remove(&mut self, key: &str) -> Option<HeaderEntry> {
            let idx = self.entries.iter().position(|entry| entry.key == key)?;
            let mut entry = self.entries.remove(idx);
            let trivia = std::mem::take(&mut entry.trivia);
            match idx.checked_sub(1).and_then(|prev| self.entries.get_mut(prev)) {
                Some(prev) => prev.trivia.push_str(&trivia),
                None => self.leading.push_str(&trivia),
            }
            Some(entry)
        }

        /// Fields whose key is not in `known`, in file order.
        pub fn unrecognized(&self, known: &[&str]) -> IndexMap<String, Value> {
            self.entries
                .iter()
                .filter(|entry| !known.contains(&entry.key.as_str()))
                .map(|entry| (entry.key.clone(), entry.value.clone()))
                .collect()
        }
    }

    /// A new value for a header field.
    #[derive(Debug, Clone, PartialEq)]
    pub enum FieldValue {
        Text(String),
        List(Vec<String>),
        Yaml(Value),
    }

    impl FieldValue {
        fn render(&self, key: &str, newline: &str) -> String {
            let rendered_key = render_scalar(key);
            match self {
                FieldValue::Text(text) => {
                    format!("{rendered_key}: {}{newline}", render_scalar(text))
                }
                FieldValue::List(items) if items.is_empty() => {
                    format!("{rendered_key}: []{newline}")
                }
                FieldValue::List(items) => {
                    let mut out = format!("{rendered_key}:{newline}");
                    for item in items {
                        out.push_str("  - ");
                        out.push_str(&render_scalar(item));
                        out.push_str(newline);
                    }
                    out
                }
                FieldValue::Yaml(value) => render_yaml(key, &rendered_key, value, newline),
            }
        }

        fn into_value(self) -> Value {
            match self {
                FieldValue::Text(text) => Value::String(text),
                FieldValue::List(items) => {
                    Value::Sequence(items.into_iter().map(Value::String).collect())
                }
                FieldValue::Yaml(value) => value,
            }
        }
    }

    fn render_yaml(key: &str, rendered_key: &str, value: &Value, newline: &str) -> String {
        let inline = match value {
            Value::Null => Some(String::new()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(render_scalar(s)),
            Value::Sequence(items) if items.is_empty() => Some("[]".to_string()),
            Value::Mapping(map) if map.is_empty() => Some("{}".to_string()),
            _ => None,
        };
        match inline {
            Some(text) if text.is_empty() => format!("{rendered_key}:{newline}"),
            Some(text) => format!("{rendered_key}: {text}{newline}"),
            None => {
                let mut single = Mapping::new();
                single.insert(Value::String(key.to_string()), value.clone());
                match serde_yaml::to_string(&single) {
                    Ok(text) => text.lines().map(|line| format!("{line}{newline}")).collect(),
                    Err(err) => {
                        tracing::warn!(key, error = %err, "cannot render header value; writing null");
                        format!("{rendered_key}:{newline}")
                    }
                }
            }
        }
    }

    /// `text` as a YAML scalar: plain when YAML reads it back as the same
    /// string, double-quoted otherwise.
    pub fn render_scalar(text: &str) -> String {
        if !needs_quotes(text) {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len() + 2);
        out.push('"');
        for c in text.chars() {
            match c {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => out.push_str(&format!("\\u{:04x}", u32::from(c))),
                c => out.push(c),
            }
        }
        out.push('"');
        out
    }

    fn needs_quotes(text: &str) -> bool {
        let Some(first) = text.chars().next() else {
            return true;
        };
        if text.trim() != text || "-?:,[]{}#&*!|>'\"%@`".contains(first) {
            return true;
        }
        if text.contains(": ")
            || text.contains(" #")
            || text.ends_with(':')
            || text.chars().any(char::is_control)
        {
            return true;
        }
        let lower = text.to_ascii_lowercase();
        matches!(
            lower.as_str(),
            "~" | "null" | "true" | "false" | "yes" | "no" | "on" | "off" | "y" | "n"
                | ".inf" | "-.inf" | "+.inf" | ".nan"
        ) || text.parse::<f64>().is_ok()
            || lower.starts_with("0x")
            || lower.starts_with("0o")
    }

    fn is_delimiter(line: &str) -> bool {
        line.trim_end() == DELIMITER
    }

    fn is_trivia(line: &str) -> bool {
        let trimmed = line.trim_start();
        trimmed.is_empty() || trimmed.starts_with('#')
    }

    /// Key of a top-level `key: value` line, or `None` for continuation lines.
    fn entry_key(line: &str) -> Option<String> {
        let first = line.chars().next()?;
        if first.is_whitespace() || matches!(first, '-' | '#' | '[' | '{' | '?' | ']' | '}') {
            return None;
        }
        if first == '"' || first == '\'' {
            let close = line[1..].find(first)? + 1;
            let rest = line[close + 1..].trim_start();
            return rest.starts_with(':').then(|| line[1..close].to_string());
        }
        let (idx, _) = line.char_indices().find(|&(i, c)| {
            c == ':' && line[i + 1..].chars().next().map_or(true, char::is_whitespace)
        })?;
        Some(line[..idx].trim_end().to_string())
    }

    fn lookup<'m>(mapping: &'m Mapping, key: &str) -> Option<&'m Value> {
        mapping.iter().find_map(|(candidate, value)| {
            let matches = match candidate {
                Value::String(s) => s == key,
                Value::Number(n) => n.to_string() == key,
                Value::Bool(b) => b.to_string() == key,
                Value::Null => key == "~" || key.eq_ignore_ascii_case("null"),
                _ => false,
            };
            matches.then_some(value)
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const SAMPLE: &str = "---\n\
# planning notes\n\
title: Buy milk\n\
status: ready\n\
\n\
tags:\n  - errands\n  - home\n\
priority: 2   # bump later\n\
---\n\
Body text\n\n- [ ] step\n";

        #[test]
        fn untouched_documents_encode_byte_for_byte() {
            let inputs = [
                SAMPLE,
                "---\ntitle: x\n---\n",
                "---\r\ntitle: x\r\nstatus: ready\r\n---\r\nbody\r\n",
                "---\n---\n",
                "---\ntitle: x\n---",
                "---\ntitle: x\n---\n\n\nleading blank body",
                "---\nnotes: |\n  line one\n\n  line two\n---\n",
            ];
            for input in inputs {
                let doc = Document::decode(input).expect("decode");
                assert_eq!(doc.encode(), input);
                let again = Document::decode(&doc.encode()).expect("re-decode");
                assert_eq!(again, doc);
            }
        }

        #[test]
        fn entries_keep_order_values_and_trivia() {
            let doc = Document::decode(SAMPLE).expect("decode");
            let keys: Vec<_> = doc.keys().collect();
            assert_eq!(keys, ["title", "status", "tags", "priority"]);
            assert_eq!(doc.get("title"), Some(&Value::String("Buy milk".into())));
            assert_eq!(doc.entry("status").expect("status").trivia, "\n");
            assert_eq!(doc.entry("priority").expect("priority").raw_value(), "2   # bump later");
            assert_eq!(doc.body, "Body text\n\n- [ ] step\n");
        }

        #[test]
        fn set_rewrites_only_the_touched_field() {
            let mut doc = Document::decode(SAMPLE).expect("decode");
            doc.set("status", FieldValue::Text("done".into()));
            assert_eq!(doc.encode(), SAMPLE.replace("status: ready", "status: done"));
        }

        #[test]
        fn set_appends_before_trailing_blank_lines() {
            let mut doc = Document::decode("---\ntitle: x\n\n---\nbody\n").expect("decode");
            doc.set("due", FieldValue::Text("2025-01-15".into()));
            assert_eq!(doc.encode(), "---\ntitle: x\ndue: 2025-01-15\n\n---\nbody\n");
        }

        #[test]
        fn remove_keeps_surrounding_trivia() {
            let mut doc = Document::decode(SAMPLE).expect("decode");
            doc.remove("tags").expect("tags present");
            assert_eq!(
                doc.encode(),
                "---\n# planning notes\ntitle: Buy milk\nstatus: ready\n\npriority: 2   # bump later\n---\nBody text\n\n- [ ] step\n"
            );
            doc.remove("title").expect("title present");
            assert!(doc.encode().starts_with("---\n# planning notes\nstatus: ready\n"));
        }

        #[test]
        fn generated_lines_follow_the_file_newline() {
            let mut doc = Document::decode("---\r\ntitle: x\r\n---\r\nbody\r\n").expect("decode");
            doc.set("blocked-by", FieldValue::List(vec!["[[A]]".into(), "b.md".into()]));
            assert_eq!(
                doc.encode(),
                "---\r\ntitle: x\r\nblocked-by:\r\n  - \"[[A]]\"\r\n  - b.md\r\n---\r\nbody\r\n"
            );
        }

        #[test]
        fn closing_delimiter_without_newline_gets_one_before_a_body() {
            let mut doc = Document::decode("---\ntitle: x\n---").expect("decode");
            doc.body = "hello\n".into();
            assert_eq!(doc.encode(), "---\ntitle: x\n---\nhello\n");
        }

        #[test]
        fn scalars_are_quoted_only_when_needed() {
            assert_eq!(render_scalar("Buy milk"), "Buy milk");
            assert_eq!(render_scalar("2025-01-15T14:30"), "2025-01-15T14:30");
            assert_eq!(render_scalar("[[Q1 Plan]]"), "\"[[Q1 Plan]]\"");
            assert_eq!(render_scalar("yes"), "\"yes\"");
            assert_eq!(render_scalar("2024"), "\"2024\"");
            assert_eq!(render_scalar("a: b"), "\"a: b\"");
            assert_eq!(render_scalar("say \"hi\""), "say \"hi\"");
            assert_eq!(render_scalar("\"quoted\""), "\"\\\"quoted\\\"\"");
            assert_eq!(render_scalar(""), "\"\"");
        }

        #[test]
        fn rendered_values_read_back_identically() {
            for text in ["[[Q1 Plan]]", "yes", "2024", "a: b", "#tag", " padded", "tab\there"] {
                let mut doc = Document::new("");
                doc.set("k", FieldValue::Text(text.into()));
                let back = Document::decode(&doc.encode()).expect("decode");
                assert_eq!(back.get("k"), Some(&Value::String(text.into())), "{text:?}");
            }
        }

        #[test]
        fn nested_yaml_values_render_as_blocks() {
            let value: Value = serde_yaml::from_str("a: 1\nb: [x, y]").expect("yaml");
            let mut doc = Document::new("");
            doc.set("meta", FieldValue::Yaml(value.clone()));
            let back = Document::decode(&doc.encode()).expect("decode");
            assert_eq!(back.get("meta"), Some(&value));
        }

        #[test]
        fn unrecognized_lists_unknown_fields_in_order() {
            let doc = Document::decode(SAMPLE).expect("decode");
            let extra = doc.unrecognized(&["title", "status"]);
            let keys: Vec<_> = extra.keys().map(String::as_str).collect();
            assert_eq!(keys, ["tags", "priority"]);
        }

        #[test]
        fn decode_errors() {
            assert_eq!(Document::decode("title: x\n"), Err(CodecError::MissingOpeningDelimiter));
            assert_eq!(Document::decode(""), Err(CodecError::MissingOpeningDelimiter));
            assert_eq!(
                Document::decode("---\ntitle: x\n"),
                Err(CodecError::MissingClosingDelimiter)
            );
            assert!(matches!(
                Document::decode("---\ntitle: [unclosed\n---\n"),
                Err(CodecError::Syntax(_))
            ));
            assert!(matches!(
                Document::decode("---\ntitle: a\ntitle: b\n---\n"),
                Err(CodecError::Syntax(_))
            ));
            assert!(matches!(
                Document::decode("---\n  indented: x\n---\n"),
                Err(CodecError::Layout { .. })
            ));
            assert!(matches!(
                Document::decode("---\n- a\n- b\n---\n"),
                Err(CodecError::Layout { .. }) | Err(CodecError::NotAMapping)
            ));
        }

        #[test]
        fn quoted_keys_and_unquoted_links() {
            let doc = Document::decode("---\n\"odd key\": 1\ngroup: [[Q1 Plan]]\n---\n")
                .expect("decode");
            assert_eq!(doc.get("odd key"), Some(&Value::Number(1.into())));
            let group = doc.get("group").expect("group");
            assert!(matches!(group, Value::Sequence(outer) if outer.len() == 1));
        }
    }
}

pub mod model {
    //! Typed items, groups and areas, built from decoded documents.
    //!
    //! Decoding reports fatal problems as `VaultError` and advisory ones as
    //! `Warning`s next to the entity. Encoding starts from the document the
    //! entity was read from and only touches fields whose typed value changed.

    use crate::codec::{Document, FieldValue};
    use crate::error::{Result, VaultError};
    use crate::values::{DateValue, Reference};
    use chrono::{DateTime, FixedOffset};
    use indexmap::IndexMap;
    use serde::Serialize;
    use serde_with::{DisplayFromStr, serde_as};
    use serde_yaml::Value;
    use std::{
        fmt,
        path::{Path, PathBuf},
        str::FromStr,
    };

    /// On-disk header field names.
    pub mod fields {
        pub const TITLE: &str = "title";
        pub const STATUS: &str = "status";
        pub const CREATED_AT: &str = "created-at";
        pub const UPDATED_AT: &str = "updated-at";
        pub const COMPLETED_AT: &str = "completed-at";
        pub const DUE: &str = "due";
        pub const SCHEDULED: &str = "scheduled";
        pub const DEFER_UNTIL: &str = "defer-until";
        pub const GROUP: &str = "group";
        pub const AREA: &str = "area";
        pub const START_DATE: &str = "start-date";
        pub const END_DATE: &str = "end-date";
        pub const BLOCKED_BY: &str = "blocked-by";
        pub const TYPE: &str = "type";
    }

    use fields::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum EntityKind {
        Item,
        Group,
        Area,
    }

    impl EntityKind {
        pub const ALL: [EntityKind; 3] = [EntityKind::Item, EntityKind::Group, EntityKind::Area];

        pub fn as_str(self) -> &'static str {
            match self {
                EntityKind::Item => "item",
                EntityKind::Group => "group",
                EntityKind::Area => "area",
            }
        }
    }

    impl fmt::Display for EntityKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /* -------------------------------- Statuses -------------------------------- */

    /// Lower-case with `-`, `_` and spaces removed, so `In Progress`,
    /// `in_progress` and `InProgress` all compare equal.
    fn squash(token: &str) -> String {
        token
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect()
    }

    /// Shared surface of the status enums, used by generic decoding.
    pub trait StatusToken: Sized + fmt::Display {
        fn from_token(token: &str) -> Self;
        fn unknown(&self) -> bool;
    }

    macro_rules! status_enum {
        ($(#[$meta:meta])* $name:ident { $($variant:ident => $token:literal),+ $(,)? }) => {
            $(#[$meta])*
            #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub enum $name {
                $($variant,)+
                /// A token no variant matches; rejected by validation.
                Unknown(String),
            }

            impl $name {
                pub const KNOWN: &'static [$name] = &[$($name::$variant),+];

                /// Never fails; unrecognized tokens land in `Unknown`.
                pub fn parse(token: &str) -> Self {
                    let wanted = squash(token);
                    $(if wanted == squash($token) {
                        return $name::$variant;
                    })+
                    $name::Unknown(token.trim().to_string())
                }

                pub fn as_str(&self) -> &str {
                    match self {
                        $($name::$variant => $token,)+
                        $name::Unknown(raw) => raw,
                    }
                }

                pub fn is_unknown(&self) -> bool {
                    matches!(self, $name::Unknown(_))
                }

                /// Known tokens, comma separated.
                pub fn tokens() -> String {
                    Self::KNOWN.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.pad(self.as_str())
                }
            }

            impl FromStr for $name {
                type Err = String;

                fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                    match $name::parse(s) {
                        $name::Unknown(raw) => Err(format!(
                            "unknown status {raw:?}; expected one of: {}",
                            $name::tokens()
                        )),
                        known => Ok(known),
                    }
                }
            }

            impl StatusToken for $name {
                fn from_token(token: &str) -> Self {
                    $name::parse(token)
                }

                fn unknown(&self) -> bool {
                    self.is_unknown()
                }
            }
        };
    }

    status_enum!(
        /// Lifecycle of an item.
        ItemStatus {
            Inbox => "inbox",
            Icebox => "icebox",
            Ready => "ready",
            InProgress => "in-progress",
            Blocked => "blocked",
            Dropped => "dropped",
            Done => "done",
        }
    );

    status_enum!(
        GroupStatus {
            Planning => "planning",
            Ready => "ready",
            Blocked => "blocked",
            InProgress => "in-progress",
            Paused => "paused",
            Done => "done",
        }
    );

    status_enum!(
        AreaStatus {
            Active => "active",
            Archived => "archived",
        }
    );

    impl ItemStatus {
        /// Done or dropped.
        pub fn is_closed(&self) -> bool {
            matches!(self, ItemStatus::Done | ItemStatus::Dropped)
        }

        pub fn open() -> Vec<ItemStatus> {
            Self::KNOWN.iter().filter(|s| !s.is_closed()).cloned().collect()
        }
    }

    /* -------------------------------- Warnings -------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "warning", rename_all = "kebab-case")]
    pub enum Warning {
        /// Only the first group reference is used.
        MultipleGroups { count: usize },
        /// Only the first area reference is used.
        MultipleAreas { count: usize },
        MissingCompletion { status: String },
    }

    impl fmt::Display for Warning {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Warning::MultipleGroups { count } => {
                    write!(f, "{count} group references; only the first is used")
                }
                Warning::MultipleAreas { count } => {
                    write!(f, "{count} area references; only the first is used")
                }
                Warning::MissingCompletion { status } => {
                    write!(f, "status {status} without {COMPLETED_AT}")
                }
            }
        }
    }

    /// An entity together with the advisory findings from decoding it.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct Validated<T> {
        pub entity: T,
        pub warnings: Vec<Warning>,
    }

    impl<T> Validated<T> {
        pub fn into_inner(self) -> T {
            self.entity
        }

        pub fn is_clean(&self) -> bool {
            self.warnings.is_empty()
        }
    }

    /* -------------------------------- Decoding -------------------------------- */

    /// `Ok(None)` means absent: empty string, null and empty list all count.
    type Decoded<T> = std::result::Result<Option<T>, String>;

    fn decode_text(value: &Value) -> Decoded<String> {
        match value {
            Value::Null => Ok(None),
            Value::String(s) => {
                let s = s.trim();
                Ok((!s.is_empty()).then(|| s.to_string()))
            }
            Value::Bool(b) => Ok(Some(b.to_string())),
            Value::Number(n) => Ok(Some(n.to_string())),
            Value::Sequence(items) if items.is_empty() => Ok(None),
            Value::Mapping(map) if map.is_empty() => Ok(None),
            Value::Tagged(tagged) => decode_text(&tagged.value),
            Value::Sequence(_) => Err("expected a single value, found a list".to_string()),
            Value::Mapping(_) => Err("expected a single value, found a mapping".to_string()),
        }
    }

    fn decode_date(value: &Value) -> Decoded<DateValue> {
        decode_text(value)?
            .map(|text| DateValue::parse(&text).map_err(|err| err.to_string()))
            .transpose()
    }

    fn decode_status<S: StatusToken>(value: &Value) -> Decoded<S> {
        let Some(text) = decode_text(value)? else {
            return Ok(None);
        };
        let status = S::from_token(&text);
        if status.unknown() {
            Err(format!("unknown status {text:?}"))
        } else {
            Ok(Some(status))
        }
    }

    fn decode_references(value: &Value) -> std::result::Result<Vec<Reference>, String> {
        reference_texts(value)?
            .iter()
            .map(|text| Reference::parse(text).map_err(|err| err.to_string()))
            .collect()
    }

    fn decode_first_reference(value: &Value) -> Decoded<Reference> {
        Ok(decode_references(value)?.into_iter().next())
    }

    fn decode_reference_list(value: &Value) -> Decoded<Vec<Reference>> {
        let refs = decode_references(value)?;
        Ok((!refs.is_empty()).then_some(refs))
    }

    fn reference_texts(value: &Value) -> std::result::Result<Vec<String>, String> {
        if let Some(link) = flow_link(value) {
            return Ok(vec![link]);
        }
        match value {
            Value::Sequence(items) => items
                .iter()
                .map(|item| match flow_link(item) {
                    Some(link) => Ok(Some(link)),
                    None => decode_text(item),
                })
                .filter_map(|decoded| decoded.transpose())
                .collect(),
            other => Ok(decode_text(other)?.into_iter().collect()),
        }
    }

    /// `[[Name]]` written without quotes reads as a list holding a list.
    fn flow_link(value: &Value) -> Option<String> {
        let Value::Sequence(outer) = value else {
            return None;
        };
        let [Value::Sequence(inner)] = outer.as_slice() else {
            return None;
        };
        let [Value::String(name)] = inner.as_slice() else {
            return None;
        };
        Some(format!("[[{name}]]"))
    }

    struct FieldReader<'a> {
        path: &'a Path,
        doc: &'a Document,
    }

    impl FieldReader<'_> {
        fn optional<T>(&self, field: &str, decode: impl Fn(&Value) -> Decoded<T>) -> Result<Option<T>> {
            let Some(entry) = self.doc.entry(field) else {
                return Ok(None);
            };
            decode(&entry.value).map_err(|reason| VaultError::InvalidField {
                path: self.path.to_path_buf(),
                field: field.to_string(),
                value: entry.raw_value().to_string(),
                reason,
            })
        }

        fn required<T>(&self, field: &str, decode: impl Fn(&Value) -> Decoded<T>) -> Result<T> {
            self.optional(field, decode)?.ok_or_else(|| VaultError::MissingField {
                path: self.path.to_path_buf(),
                field: field.to_string(),
            })
        }

        fn references(&self, field: &str) -> Result<Vec<Reference>> {
            Ok(self.optional(field, decode_reference_list)?.unwrap_or_default())
        }
    }

    /* -------------------------------- Encoding -------------------------------- */

    /// Leave the field alone when the document already decodes to `value`.
    fn write_field<T: PartialEq>(
        doc: &mut Document,
        field: &str,
        value: Option<&T>,
        decode: impl Fn(&Value) -> Decoded<T>,
        render: impl Fn(&T) -> FieldValue,
    ) {
        let current = doc.get(field).and_then(|raw| decode(raw).ok().flatten());
        if current.as_ref() == value {
            return;
        }
        match value {
            Some(value) => doc.set(field, render(value)),
            None => {
                doc.remove(field);
            }
        }
    }

    fn display_field<T: fmt::Display>(value: &T) -> FieldValue {
        FieldValue::Text(value.to_string())
    }

    fn reference_list_field(refs: &Vec<Reference>) -> FieldValue {
        FieldValue::List(refs.iter().map(ToString::to_string).collect())
    }

    fn write_extras(doc: &mut Document, known: &[&str], extra: &IndexMap<String, Value>) {
        let stale: Vec<String> = doc
            .keys()
            .filter(|key| !known.contains(key) && !extra.contains_key(*key))
            .map(str::to_string)
            .collect();
        for key in stale {
            doc.remove(&key);
        }
        for (key, value) in extra {
            if known.contains(&key.as_str()) || doc.get(key) == Some(value) {
                continue;
            }
            doc.set(key, FieldValue::Yaml(value.clone()));
        }
    }

    /* -------------------------------- Entities -------------------------------- */

    /// Behaviour shared by items, groups and areas.
    pub trait Entity: Clone + Send + Sync + 'static {
        const KIND: EntityKind;
        /// Schema fields in the order new ones are appended.
        const FIELDS: &'static [&'static str];

        fn path(&self) -> &Path;
        fn set_path(&mut self, path: PathBuf);
        fn title(&self) -> &str;
        fn from_document(path: &Path, doc: Document) -> Result<Validated<Self>>;
        fn to_document(&self) -> Document;

        fn parse(path: &Path, text: &str) -> Result<Validated<Self>> {
            let doc = Document::decode(text).map_err(|err| VaultError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
            Self::from_document(path, doc)
        }

        fn render(&self) -> String {
            self.to_document().encode()
        }
    }

    pub fn read_document(path: &Path) -> Result<Document> {
        let text = std::fs::read_to_string(path).map_err(|err| VaultError::io(path, err))?;
        Document::decode(&text).map_err(|err| VaultError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn load<T: Entity>(path: &Path) -> Result<Validated<T>> {
        T::from_document(path, read_document(path)?)
    }

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct Item {
        pub path: PathBuf,
        pub title: String,
        #[serde_as(as = "DisplayFromStr")]
        pub status: ItemStatus,
        #[serde_as(as = "DisplayFromStr")]
        pub created_at: DateValue,
        #[serde_as(as = "DisplayFromStr")]
        pub updated_at: DateValue,
        #[serde_as(as = "Option<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub completed_at: Option<DateValue>,
        #[serde_as(as = "Option<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub due: Option<DateValue>,
        #[serde_as(as = "Option<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub scheduled: Option<DateValue>,
        #[serde_as(as = "Option<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub defer_until: Option<DateValue>,
        #[serde_as(as = "Option<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub group: Option<Reference>,
        #[serde_as(as = "Option<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub area: Option<Reference>,
        #[serde(skip_serializing_if = "IndexMap::is_empty")]
        pub extra: IndexMap<String, Value>,
        pub body: String,
        #[serde(skip)]
        source: Document,
    }

    impl Item {
        /// A fresh item stamped at `now`; not yet on disk.
        pub fn new(
            path: PathBuf,
            title: impl Into<String>,
            status: ItemStatus,
            now: &DateTime<FixedOffset>,
        ) -> Self {
            let stamp = DateValue::stamp(now);
            Self {
                path,
                title: title.into(),
                status,
                created_at: stamp,
                updated_at: stamp,
                completed_at: None,
                due: None,
                scheduled: None,
                defer_until: None,
                group: None,
                area: None,
                extra: IndexMap::new(),
                body: String::new(),
                source: Document::new(""),
            }
        }
    }

    impl Entity for Item {
        const KIND: EntityKind = EntityKind::Item;
        const FIELDS: &'static [&'static str] = &[
            TITLE,
            STATUS,
            CREATED_AT,
            UPDATED_AT,
            COMPLETED_AT,
            DUE,
            SCHEDULED,
            DEFER_UNTIL,
            GROUP,
            AREA,
        ];

        fn path(&self) -> &Path {
            &self.path
        }

        fn set_path(&mut self, path: PathBuf) {
            self.path = path;
        }

        fn title(&self) -> &str {
            &self.title
        }

        fn from_document(path: &Path, doc: Document) -> Result<Validated<Self>> {
            let reader = FieldReader { path, doc: &doc };
            let title = reader.required(TITLE, decode_text)?;
            let status = reader.required(STATUS, decode_status::<ItemStatus>)?;
            let created_at = reader.required(CREATED_AT, decode_date)?;
            let updated_at = reader.required(UPDATED_AT, decode_date)?;
            let completed_at = reader.optional(COMPLETED_AT, decode_date)?;
            let due = reader.optional(DUE, decode_date)?;
            let scheduled = reader.optional(SCHEDULED, decode_date)?;
            let defer_until = reader.optional(DEFER_UNTIL, decode_date)?;
            let groups = reader.references(GROUP)?;
            let areas = reader.references(AREA)?;

            let mut warnings = Vec::new();
            if groups.len() > 1 {
                warnings.push(Warning::MultipleGroups { count: groups.len() });
            }
            if areas.len() > 1 {
                warnings.push(Warning::MultipleAreas { count: areas.len() });
            }
            if status.is_closed() && completed_at.is_none() {
                warnings.push(Warning::MissingCompletion {
                    status: status.to_string(),
                });
            }

            let item = Item {
                path: path.to_path_buf(),
                title,
                status,
                created_at,
                updated_at,
                completed_at,
                due,
                scheduled,
                defer_until,
                group: groups.into_iter().next(),
                area: areas.into_iter().next(),
                extra: doc.unrecognized(Self::FIELDS),
                body: doc.body.clone(),
                source: doc,
            };
            Ok(Validated { entity: item, warnings })
        }

        fn to_document(&self) -> Document {
            let mut doc = self.source.clone();
            write_field(&mut doc, TITLE, Some(&self.title), decode_text, display_field);
            write_field(&mut doc, STATUS, Some(&self.status), decode_status::<ItemStatus>, display_field);
            write_field(&mut doc, CREATED_AT, Some(&self.created_at), decode_date, display_field);
            write_field(&mut doc, UPDATED_AT, Some(&self.updated_at), decode_date, display_field);
            write_field(&mut doc, COMPLETED_AT, self.completed_at.as_ref(), decode_date, display_field);
            write_field(&mut doc, DUE, self.due.as_ref(), decode_date, display_field);
            write_field(&mut doc, SCHEDULED, self.scheduled.as_ref(), decode_date, display_field);
            write_field(&mut doc, DEFER_UNTIL, self.defer_until.as_ref(), decode_date, display_field);
            write_field(&mut doc, GROUP, self.group.as_ref(), decode_first_reference, display_field);
            write_field(&mut doc, AREA, self.area.as_ref(), decode_first_reference, display_field);
            write_extras(&mut doc, Self::FIELDS, &self.extra);
            doc.body.clone_from(&self.body);
            doc
        }
    }

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct Group {
        pub path: PathBuf,
        pub title: String,
        #[serde_as(as = "Option<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub status: Option<GroupStatus>,
        #[serde_as(as = "Option<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub area: Option<Reference>,
        #[serde_as(as = "Option<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub start_date: Option<DateValue>,
        #[serde_as(as = "Option<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub end_date: Option<DateValue>,
        #[serde_as(as = "Vec<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub blocked_by: Vec<Reference>,
        #[serde(skip_serializing_if = "IndexMap::is_empty")]
        pub extra: IndexMap<String, Value>,
        pub body: String,
        #[serde(skip)]
        source: Document,
    }

    impl Group {
        pub fn new(path: PathBuf, title: impl Into<String>) -> Self {
            Self {
                path,
                title: title.into(),
                status: None,
                area: None,
                start_date: None,
                end_date: None,
                blocked_by: Vec::new(),
                extra: IndexMap::new(),
                body: String::new(),
                source: Document::new(""),
            }
        }
    }

    impl Entity for Group {
        const KIND: EntityKind = EntityKind::Group;
        const FIELDS: &'static [&'static str] =
            &[TITLE, STATUS, AREA, START_DATE, END_DATE, BLOCKED_BY];

        fn path(&self) -> &Path {
            &self.path
        }

        fn set_path(&mut self, path: PathBuf) {
            self.path = path;
        }

        fn title(&self) -> &str {
            &self.title
        }

        fn from_document(path: &Path, doc: Document) -> Result<Validated<Self>> {
            let reader = FieldReader { path, doc: &doc };
            let title = reader.required(TITLE, decode_text)?;
            let status = reader.optional(STATUS, decode_status::<GroupStatus>)?;
            let areas = reader.references(AREA)?;
            let start_date = reader.optional(START_DATE, decode_date)?;
            let end_date = reader.optional(END_DATE, decode_date)?;
            let blocked_by = reader.references(BLOCKED_BY)?;

            let mut warnings = Vec::new();
            if areas.len() > 1 {
                warnings.push(Warning::MultipleAreas { count: areas.len() });
            }
            let group = Group {
                path: path.to_path_buf(),
                title,
                status,
                area: areas.into_iter().next(),
                start_date,
                end_date,
                blocked_by,
                extra: doc.unrecognized(Self::FIELDS),
                body: doc.body.clone(),
                source: doc,
            };
            Ok(Validated { entity: group, warnings })
        }

        fn to_document(&self) -> Document {
            let mut doc = self.source.clone();
            write_field(&mut doc, TITLE, Some(&self.title), decode_text, display_field);
            write_field(&mut doc, STATUS, self.status.as_ref(), decode_status::<GroupStatus>, display_field);
            write_field(&mut doc, AREA, self.area.as_ref(), decode_first_reference, display_field);
            write_field(&mut doc, START_DATE, self.start_date.as_ref(), decode_date, display_field);
            write_field(&mut doc, END_DATE, self.end_date.as_ref(), decode_date, display_field);
            let blocked_by = (!self.blocked_by.is_empty()).then_some(&self.blocked_by);
            write_field(&mut doc, BLOCKED_BY, blocked_by, decode_reference_list, reference_list_field);
            write_extras(&mut doc, Self::FIELDS, &self.extra);
            doc.body.clone_from(&self.body);
            doc
        }
    }

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct Area {
        pub path: PathBuf,
        pub title: String,
        #[serde_as(as = "Option<DisplayFromStr>")]
        #[serde(skip_serializing_if = "Option::is_none")]
        pub status: Option<AreaStatus>,
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        pub area_type: Option<String>,
        #[serde(skip_serializing_if = "IndexMap::is_empty")]
        pub extra: IndexMap<String, Value>,
        pub body: String,
        #[serde(skip)]
        source: Document,
    }

    impl Area {
        pub fn new(path: PathBuf, title: impl Into<String>) -> Self {
            Self {
                path,
                title: title.into(),
                status: None,
                area_type: None,
                extra: IndexMap::new(),
                body: String::new(),
                source: Document::new(""),
            }
        }
    }

    impl Entity for Area {
        const KIND: EntityKind = EntityKind::Area;
        const FIELDS: &'static [&'static str] = &[TITLE, STATUS, TYPE];

        fn path(&self) -> &Path {
            &self.path
        }

        fn set_path(&mut self, path: PathBuf) {
            self.path = path;
        }

        fn title(&self) -> &str {
            &self.title
        }

        fn from_document(path: &Path, doc: Document) -> Result<Validated<Self>> {
            let reader = FieldReader { path, doc: &doc };
            let title = reader.required(TITLE, decode_text)?;
            let status = reader.optional(STATUS, decode_status::<AreaStatus>)?;
            let area_type = reader.optional(TYPE, decode_text)?;
            let area = Area {
                path: path.to_path_buf(),
                title,
                status,
                area_type,
                extra: doc.unrecognized(Self::FIELDS),
                body: doc.body.clone(),
                source: doc,
            };
            Ok(Validated { entity: area, warnings: Vec::new() })
        }

        fn to_document(&self) -> Document {
            let mut doc = self.source.clone();
            write_field(&mut doc, TITLE, Some(&self.title), decode_text, display_field);
            write_field(&mut doc, STATUS, self.status.as_ref(), decode_status::<AreaStatus>, display_field);
            write_field(&mut doc, TYPE, self.area_type.as_ref(), decode_text, display_field);
            write_extras(&mut doc, Self::FIELDS, &self.extra);
            doc.body.clone_from(&self.body);
            doc
        }
    }

    /// Any of the three kinds, as produced by change events.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(tag = "kind", rename_all = "lowercase")]
    pub enum AnyEntity {
        Item(Validated<Item>),
        Group(Validated<Group>),
        Area(Validated<Area>),
    }

    impl AnyEntity {
        pub fn kind(&self) -> EntityKind {
            match self {
                AnyEntity::Item(_) => EntityKind::Item,
                AnyEntity::Group(_) => EntityKind::Group,
                AnyEntity::Area(_) => EntityKind::Area,
            }
        }

        pub fn path(&self) -> &Path {
            match self {
                AnyEntity::Item(v) => v.entity.path(),
                AnyEntity::Group(v) => v.entity.path(),
                AnyEntity::Area(v) => v.entity.path(),
            }
        }

        pub fn title(&self) -> &str {
            match self {
                AnyEntity::Item(v) => v.entity.title(),
                AnyEntity::Group(v) => v.entity.title(),
                AnyEntity::Area(v) => v.entity.title(),
            }
        }
    }

}

pub mod filter {
    //! Composable predicates over items, groups and areas.
    //!
    //! Every populated criterion must hold (AND); a status set matches any of
    //! its members (OR). Date criteria compare the date portion only.

    use crate::model::{Area, AreaStatus, Group, GroupStatus, Item, ItemStatus};
    use crate::values::{DateValue, Reference};
    use chrono::{Days, NaiveDate};

    pub trait Filter<T> {
        fn matches(&self, entity: &T) -> bool;

        fn apply<'a, I>(&self, entities: I) -> Vec<&'a T>
        where
            I: IntoIterator<Item = &'a T>,
            T: 'a,
        {
            entities.into_iter().filter(|entity| self.matches(entity)).collect()
        }
    }

    /// Bounds on a date field. `before` and `after` are strict.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DateRange {
        pub before: Option<NaiveDate>,
        pub after: Option<NaiveDate>,
        pub on: Option<NaiveDate>,
    }

    impl DateRange {
        pub fn before(date: NaiveDate) -> Self {
            Self { before: Some(date), ..Self::default() }
        }

        pub fn after(date: NaiveDate) -> Self {
            Self { after: Some(date), ..Self::default() }
        }

        pub fn on(date: NaiveDate) -> Self {
            Self { on: Some(date), ..Self::default() }
        }

        /// Strictly after `after` and strictly before `before`.
        pub fn between(after: NaiveDate, before: NaiveDate) -> Self {
            Self { before: Some(before), after: Some(after), on: None }
        }

        pub fn is_unbounded(&self) -> bool {
            self.before.is_none() && self.after.is_none() && self.on.is_none()
        }

        /// An unbounded range matches anything; a bounded one needs a value.
        pub fn matches(&self, value: Option<&DateValue>) -> bool {
            if self.is_unbounded() {
                return true;
            }
            let Some(date) = value.map(DateValue::date) else {
                return false;
            };
            self.before.map_or(true, |before| date < before)
                && self.after.map_or(true, |after| date > after)
                && self.on.map_or(true, |on| date == on)
        }
    }

    fn reference_matches(wanted: Option<&Reference>, actual: Option<&Reference>) -> bool {
        match (wanted, actual) {
            (None, _) => true,
            (Some(wanted), Some(actual)) => wanted.same_target(actual),
            (Some(_), None) => false,
        }
    }

    fn title_matches(needle: Option<&str>, title: &str) -> bool {
        needle.map_or(true, |needle| title.to_lowercase().contains(&needle.to_lowercase()))
    }

    fn status_matches<S: PartialEq>(wanted: Option<&Vec<S>>, actual: Option<&S>) -> bool {
        match (wanted, actual) {
            (None, _) => true,
            (Some(set), Some(actual)) => set.contains(actual),
            (Some(_), None) => false,
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ItemFilter {
        pub statuses: Option<Vec<ItemStatus>>,
        pub group: Option<Reference>,
        pub area: Option<Reference>,
        pub due: DateRange,
        pub scheduled: DateRange,
        pub completed: DateRange,
        pub created: DateRange,
        pub updated: DateRange,
        /// Hide items deferred past this date.
        pub visible_on: Option<NaiveDate>,
        pub title_contains: Option<String>,
    }

    impl ItemFilter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_status(mut self, status: ItemStatus) -> Self {
            self.statuses.get_or_insert_with(Vec::new).push(status);
            self
        }

        pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = ItemStatus>) -> Self {
            self.statuses.get_or_insert_with(Vec::new).extend(statuses);
            self
        }

        pub fn in_group(mut self, group: Reference) -> Self {
            self.group = Some(group);
            self
        }

        pub fn in_area(mut self, area: Reference) -> Self {
            self.area = Some(area);
            self
        }

        pub fn due(mut self, range: DateRange) -> Self {
            self.due = range;
            self
        }

        pub fn scheduled(mut self, range: DateRange) -> Self {
            self.scheduled = range;
            self
        }

        pub fn completed(mut self, range: DateRange) -> Self {
            self.completed = range;
            self
        }

        pub fn visible_on(mut self, day: NaiveDate) -> Self {
            self.visible_on = Some(day);
            self
        }

        pub fn title_contains(mut self, needle: impl Into<String>) -> Self {
            self.title_contains = Some(needle.into());
            self
        }

        /// Everything not done or dropped.
        pub fn open() -> Self {
            Self::new().with_statuses(ItemStatus::open())
        }

        /// Open items due strictly before `today`.
        pub fn overdue(today: NaiveDate) -> Self {
            Self::open().due(DateRange::before(today))
        }

        /// Items due after `today` and no later than `today + days`.
        pub fn upcoming(today: NaiveDate, days: u64) -> Self {
            let end = today
                .checked_add_days(Days::new(days.saturating_add(1)))
                .unwrap_or(NaiveDate::MAX);
            Self::new().due(DateRange::between(today, end))
        }

        /// Ready or in progress, and not deferred past `today`.
        pub fn actionable(today: NaiveDate) -> Self {
            Self::new()
                .with_statuses([ItemStatus::Ready, ItemStatus::InProgress])
                .visible_on(today)
        }
    }

    impl Filter<Item> for ItemFilter {
        fn matches(&self, item: &Item) -> bool {
            status_matches(self.statuses.as_ref(), Some(&item.status))
                && reference_matches(self.group.as_ref(), item.group.as_ref())
                && reference_matches(self.area.as_ref(), item.area.as_ref())
                && self.due.matches(item.due.as_ref())
                && self.scheduled.matches(item.scheduled.as_ref())
                && self.completed.matches(item.completed_at.as_ref())
                && self.created.matches(Some(&item.created_at))
                && self.updated.matches(Some(&item.updated_at))
                && self.visible_on.map_or(true, |day| {
                    item.defer_until.as_ref().map_or(true, |defer| defer.date() <= day)
                })
                && title_matches(self.title_contains.as_deref(), &item.title)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct GroupFilter {
        pub statuses: Option<Vec<GroupStatus>>,
        pub area: Option<Reference>,
        pub start: DateRange,
        pub end: DateRange,
        pub title_contains: Option<String>,
    }

    impl GroupFilter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_status(mut self, status: GroupStatus) -> Self {
            self.statuses.get_or_insert_with(Vec::new).push(status);
            self
        }

        pub fn in_area(mut self, area: Reference) -> Self {
            self.area = Some(area);
            self
        }

        pub fn title_contains(mut self, needle: impl Into<String>) -> Self {
            self.title_contains = Some(needle.into());
            self
        }
    }

    impl Filter<Group> for GroupFilter {
        fn matches(&self, group: &Group) -> bool {
            status_matches(self.statuses.as_ref(), group.status.as_ref())
                && reference_matches(self.area.as_ref(), group.area.as_ref())
                && self.start.matches(group.start_date.as_ref())
                && self.end.matches(group.end_date.as_ref())
                && title_matches(self.title_contains.as_deref(), &group.title)
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct AreaFilter {
        pub statuses: Option<Vec<AreaStatus>>,
        pub area_type: Option<String>,
        pub title_contains: Option<String>,
    }

    impl AreaFilter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_status(mut self, status: AreaStatus) -> Self {
            self.statuses.get_or_insert_with(Vec::new).push(status);
            self
        }

        pub fn of_type(mut self, area_type: impl Into<String>) -> Self {
            self.area_type = Some(area_type.into());
            self
        }
    }

    impl Filter<Area> for AreaFilter {
        fn matches(&self, area: &Area) -> bool {
            status_matches(self.statuses.as_ref(), area.status.as_ref())
                && self.area_type.as_ref().map_or(true, |wanted| {
                    area.area_type.as_ref().is_some_and(|t| t.eq_ignore_ascii_case(wanted))
                })
                && title_matches(self.title_contains.as_deref(), &area.title)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::model::Entity;
        use std::path::Path;

        fn day(d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
        }

        fn item(name: &str, status: &str, extra: &str) -> Item {
            let text = format!(
                "---\ntitle: {name}\nstatus: {status}\ncreated-at: 2025-01-01\nupdated-at: 2025-01-01\n{extra}---\n"
            );
            Item::parse(Path::new(&format!("/vault/items/{name}.md")), &text)
                .expect("item")
                .into_inner()
        }

        fn titles<'a>(items: Vec<&'a Item>) -> Vec<&'a str> {
            items.into_iter().map(|item| item.title.as_str()).collect()
        }

        #[test]
        fn overdue_excludes_closed_and_today() {
            let items = [
                item("a", "ready", "due: 2025-01-14\n"),
                item("b", "ready", "due: 2025-01-15\n"),
                item("c", "done", "due: 2025-01-10\ncompleted-at: 2025-01-11\n"),
                item("d", "ready", ""),
            ];
            assert_eq!(titles(ItemFilter::overdue(day(15)).apply(&items)), ["a"]);
        }

        #[test]
        fn date_ranges_compare_the_date_portion() {
            let late = item("late", "ready", "due: 2025-01-14T23:59\n");
            assert!(ItemFilter::new().due(DateRange::before(day(15))).matches(&late));
            assert!(ItemFilter::new().due(DateRange::on(day(14))).matches(&late));
            assert!(!ItemFilter::new().due(DateRange::after(day(14))).matches(&late));
        }

        #[test]
        fn upcoming_window_is_inclusive_of_the_last_day() {
            let items = [
                item("today", "ready", "due: 2025-01-10\n"),
                item("soon", "ready", "due: 2025-01-11\n"),
                item("edge", "ready", "due: 2025-01-17\n"),
                item("later", "ready", "due: 2025-01-18\n"),
            ];
            assert_eq!(titles(ItemFilter::upcoming(day(10), 7).apply(&items)), ["soon", "edge"]);
        }

        #[test]
        fn criteria_and_together_statuses_or_together() {
            let items = [
                item("a", "ready", "group: \"[[Q1 Plan]]\"\n"),
                item("b", "in-progress", "group: ../groups/q1 plan.md\n"),
                item("c", "blocked", "group: \"[[Q1 Plan]]\"\n"),
                item("d", "ready", "group: \"[[Q2 Plan]]\"\n"),
            ];
            let filter = ItemFilter::new()
                .with_statuses([ItemStatus::Ready, ItemStatus::InProgress])
                .in_group(Reference::link("Q1 Plan"));
            assert_eq!(titles(filter.apply(&items)), ["a", "b"]);

            let both = items.iter().filter(|i| {
                ItemFilter::new().with_status(ItemStatus::Ready).matches(i)
                    && ItemFilter::new().in_group(Reference::link("Q1 Plan")).matches(i)
            });
            let combined = ItemFilter::new()
                .with_status(ItemStatus::Ready)
                .in_group(Reference::link("Q1 Plan"));
            assert_eq!(
                both.map(|i| i.title.as_str()).collect::<Vec<_>>(),
                titles(combined.apply(&items))
            );
        }

        #[test]
        fn status_sets_select_any_listed_status() {
            let items = [
                item("one", "ready", ""),
                item("two", "done", "completed-at: 2025-01-02\n"),
                item("three", "in-progress", ""),
                item("four", "blocked", ""),
                item("five", "ready", ""),
            ];
            let either = ItemFilter::new().with_statuses([ItemStatus::Ready, ItemStatus::InProgress]);
            assert_eq!(titles(either.apply(&items)), ["one", "three", "five"]);
        }

        #[test]
        fn status_set_is_the_union_of_single_statuses() {
            let items = [
                item("a", "ready", ""),
                item("b", "in-progress", ""),
                item("c", "blocked", ""),
                item("d", "done", "completed-at: 2025-01-02\n"),
                item("e", "InProgress", ""),
            ];
            let pairs = [
                (ItemStatus::Ready, ItemStatus::InProgress),
                (ItemStatus::Blocked, ItemStatus::Done),
                (ItemStatus::Ready, ItemStatus::Dropped),
            ];
            for (first, second) in pairs {
                let union: Vec<&str> = items
                    .iter()
                    .filter(|i| {
                        ItemFilter::new().with_status(first.clone()).matches(i)
                            || ItemFilter::new().with_status(second.clone()).matches(i)
                    })
                    .map(|i| i.title.as_str())
                    .collect();
                let both = ItemFilter::new().with_statuses([first, second]);
                assert_eq!(titles(both.apply(&items)), union);
            }
        }

        #[test]
        fn presets_match_their_primitive_spelling() {
            let items = [
                item("a", "ready", "due: 2025-01-02\n"),
                item("b", "inbox", "due: 2025-01-20\n"),
                item("c", "dropped", "due: 2025-01-02\ncompleted-at: 2025-01-03\n"),
            ];
            let spelled_out = ItemFilter {
                statuses: Some(ItemStatus::open()),
                due: DateRange::before(day(10)),
                ..ItemFilter::default()
            };
            assert_eq!(
                titles(ItemFilter::overdue(day(10)).apply(&items)),
                titles(spelled_out.apply(&items))
            );
        }

        #[test]
        fn deferred_items_are_hidden_until_their_day() {
            let items = [
                item("now", "ready", ""),
                item("deferred", "ready", "defer-until: 2025-01-20\n"),
                item("waiting", "blocked", ""),
            ];
            assert_eq!(titles(ItemFilter::actionable(day(10)).apply(&items)), ["now"]);
            assert_eq!(
                titles(ItemFilter::actionable(day(20)).apply(&items)),
                ["now", "deferred"]
            );
        }

        #[test]
        fn title_search_is_case_insensitive() {
            let items = [item("Buy Milk", "ready", ""), item("Sell car", "ready", "")];
            assert_eq!(titles(ItemFilter::new().title_contains("milk").apply(&items)), ["Buy Milk"]);
        }

        #[test]
        fn group_and_area_filters() {
            let groups = [
                Group::parse(Path::new("/g/a.md"), "---\ntitle: A\nstatus: paused\narea: \"[[Home]]\"\n---\n")
                    .expect("a")
                    .into_inner(),
                Group::parse(Path::new("/g/b.md"), "---\ntitle: B\n---\n").expect("b").into_inner(),
            ];
            let paused = GroupFilter::new().with_status(GroupStatus::Paused);
            assert_eq!(paused.apply(&groups).len(), 1);
            assert_eq!(GroupFilter::new().in_area(Reference::link("home")).apply(&groups).len(), 1);

            let areas = [
                Area::parse(Path::new("/a/h.md"), "---\ntitle: Home\ntype: Personal\n---\n")
                    .expect("h")
                    .into_inner(),
                Area::parse(Path::new("/a/w.md"), "---\ntitle: Work\nstatus: archived\n---\n")
                    .expect("w")
                    .into_inner(),
            ];
            assert_eq!(AreaFilter::new().of_type("personal").apply(&areas).len(), 1);
            assert_eq!(AreaFilter::new().with_status(AreaStatus::Active).apply(&areas).len(), 0);
        }
    }
}

pub mod config {
    //! Vault layout and tunables, optionally read from `vault.toml`.

    use crate::error::{Result, VaultError};
    use crate::model::EntityKind;
    use serde::{Deserialize, Serialize};
    use std::path::{Component, Path, PathBuf};

    pub const CONFIG_FILE: &str = "vault.toml";

    /// Floor for `filename-max-len`: the length of the `untitled` fallback slug.
    pub const MIN_FILENAME_LEN: usize = 8;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
    pub struct VaultConfig {
        pub items_dir: PathBuf,
        pub groups_dir: PathBuf,
        pub areas_dir: PathBuf,
        /// Subdirectory of `items_dir` holding archived items.
        pub archive_dir: String,
        /// Entity file extension, without the dot.
        pub extension: String,
        /// Header field that tags a file with its kind. Required in a directory
        /// shared by several kinds; elsewhere a single marked file makes it
        /// required for that kind.
        pub marker_field: String,
        pub scan_workers: usize,
        /// Longest slug derived from a title, before the extension. At least
        /// `MIN_FILENAME_LEN`.
        pub filename_max_len: usize,
    }

    impl Default for VaultConfig {
        fn default() -> Self {
            Self {
                items_dir: PathBuf::from("items"),
                groups_dir: PathBuf::from("groups"),
                areas_dir: PathBuf::from("areas"),
                archive_dir: "archive".to_string(),
                extension: "md".to_string(),
                marker_field: "kind".to_string(),
                scan_workers: default_scan_workers(),
                filename_max_len: 60,
            }
        }
    }

    fn default_scan_workers() -> usize {
        std::thread::available_parallelism().map_or(4, |n| n.get()).min(8)
    }

    /// Where a path sits in the vault layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Location {
        pub kind: EntityKind,
        pub archived: bool,
    }

    impl VaultConfig {
        /// Default layout under `root`.
        pub fn for_root(root: impl AsRef<Path>) -> Self {
            Self::default().resolved_against(root.as_ref())
        }

        /// Read a config file; relative directories resolve against its parent.
        pub fn load(path: &Path) -> Result<Self> {
            let text = std::fs::read_to_string(path).map_err(|err| VaultError::io(path, err))?;
            let config: Self = toml::from_str(&text)
                .map_err(|err| VaultError::Config(format!("{}: {err}", path.display())))?;
            let base = path.parent().unwrap_or(Path::new("."));
            let config = config.resolved_against(base);
            config.validate()?;
            tracing::debug!(path = %path.display(), "loaded vault config");
            Ok(config)
        }

        /// `root/vault.toml` when it exists, defaults otherwise.
        pub fn discover(root: &Path) -> Result<Self> {
            let candidate = root.join(CONFIG_FILE);
            if candidate.is_file() {
                Self::load(&candidate)
            } else {
                Ok(Self::for_root(root))
            }
        }

        pub fn validate(&self) -> Result<()> {
            if self.scan_workers == 0 {
                return Err(VaultError::Config("scan-workers must be at least 1".into()));
            }
            if self.filename_max_len < MIN_FILENAME_LEN {
                return Err(VaultError::Config(format!(
                    "filename-max-len must be at least {MIN_FILENAME_LEN}"
                )));
            }
            if self.extension.is_empty() || self.extension.starts_with('.') {
                return Err(VaultError::Config(format!(
                    "extension {:?} must be non-empty and given without a dot",
                    self.extension
                )));
            }
            if self.marker_field.trim().is_empty() {
                if let Some(kind) = EntityKind::ALL.into_iter().find(|kind| self.is_shared(self.dir(*kind))) {
                    return Err(VaultError::Config(format!(
                        "marker-field is required when the {kind} directory is shared"
                    )));
                }
            }
            if self.archive_dir.is_empty() || self.archive_dir.contains(['/', '\\']) {
                return Err(VaultError::Config(format!(
                    "archive-dir {:?} must be a single directory name",
                    self.archive_dir
                )));
            }
            Ok(())
        }

        fn resolved_against(mut self, base: &Path) -> Self {
            for dir in [&mut self.items_dir, &mut self.groups_dir, &mut self.areas_dir] {
                *dir = absolutize(&base.join(&*dir));
            }
            self
        }

        pub fn dir(&self, kind: EntityKind) -> &Path {
            match kind {
                EntityKind::Item => &self.items_dir,
                EntityKind::Group => &self.groups_dir,
                EntityKind::Area => &self.areas_dir,
            }
        }

        pub fn archive_path(&self) -> PathBuf {
            self.items_dir.join(&self.archive_dir)
        }

        pub fn file_name(&self, stem: &str) -> String {
            format!("{stem}.{}", self.extension)
        }

        pub fn has_extension(&self, path: &Path) -> bool {
            path.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
        }

        /// Every configured role of the directory directly containing `path`.
        /// Several kinds may share one directory.
        pub fn locate(&self, path: &Path) -> Vec<Location> {
            let path = absolutize(path);
            match path.parent() {
                Some(parent) => self.roles(parent),
                None => Vec::new(),
            }
        }

        /// Every configured role of `dir` itself.
        pub fn roles(&self, dir: &Path) -> Vec<Location> {
            let mut found: Vec<Location> = EntityKind::ALL
                .into_iter()
                .filter(|kind| self.dir(*kind) == dir)
                .map(|kind| Location { kind, archived: false })
                .collect();
            if dir == self.archive_path() {
                found.push(Location { kind: EntityKind::Item, archived: true });
            }
            found
        }

        /// Whether `dir` holds files of more than one kind.
        pub fn is_shared(&self, dir: &Path) -> bool {
            self.roles(dir).len() > 1
        }
    }

    /// Absolute and lexically normalized; falls back to normalizing as-is.
    pub fn absolutize(path: &Path) -> PathBuf {
        match std::path::absolute(path) {
            Ok(absolute) => normalize_path(&absolute),
            Err(_) => normalize_path(path),
        }
    }

    /// Resolve `.` and `..` without touching the filesystem.
    pub fn normalize_path(path: &Path) -> PathBuf {
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => match out.components().next_back() {
                    Some(Component::Normal(_)) => {
                        out.pop();
                    }
                    Some(Component::RootDir | Component::Prefix(_)) => {}
                    _ => out.push(".."),
                },
                other => out.push(other.as_os_str()),
            }
        }
        out
    }

}

pub mod session {
    //! Point-in-time scan of the vault and the relationship indices built from it.
    //!
    //! A session never refreshes itself; open a new one to see later changes.

    use crate::config::{VaultConfig, normalize_path};
    use crate::error::{Result, VaultError};
    use crate::filter::Filter;
    use crate::model::{self, Area, Entity, EntityKind, Group, Item, ItemStatus, Validated, Warning};
    use crate::values::Reference;
    use rayon::prelude::*;
    use serde::Serialize;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use uuid::Uuid;
    use walkdir::WalkDir;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(transparent)]
    pub struct SessionId(pub Uuid);

    impl SessionId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ScanOptions {
        /// Also load items from the archive subdirectory.
        pub include_archived: bool,
    }

    /// A file that could not be loaded; it is left out of the session.
    #[derive(Debug)]
    pub struct ScanFailure {
        pub path: PathBuf,
        pub error: VaultError,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
    pub struct Progress {
        pub total: usize,
        pub done: usize,
        pub dropped: usize,
    }

    impl Progress {
        pub fn open(&self) -> usize {
            self.total - self.done - self.dropped
        }
    }

    /// Lookup tables for one entity kind.
    #[derive(Debug, Default)]
    pub struct NameIndex {
        by_path: HashMap<PathBuf, usize>,
        by_stem: HashMap<String, Vec<usize>>,
        by_title: HashMap<String, Vec<usize>>,
    }

    impl NameIndex {
        fn build<T: Entity>(entities: &[T]) -> Self {
            let mut index = NameIndex::default();
            for (idx, entity) in entities.iter().enumerate() {
                let path = normalize_path(entity.path());
                if let Some(stem) = path.file_stem() {
                    index
                        .by_stem
                        .entry(stem.to_string_lossy().to_lowercase())
                        .or_default()
                        .push(idx);
                }
                index
                    .by_title
                    .entry(entity.title().to_lowercase())
                    .or_default()
                    .push(idx);
                index.by_path.insert(path, idx);
            }
            index
        }

        fn position(&self, path: &Path) -> Option<usize> {
            self.by_path.get(&normalize_path(path)).copied()
        }

        /// Entities a reference could mean, in scan order. An exact path hit wins;
        /// otherwise filename stems, plus titles for `[[links]]`.
        fn candidates(&self, reference: &Reference, base: &Path) -> Vec<usize> {
            if let Some(idx) = reference
                .resolve_against(base)
                .and_then(|path| self.by_path.get(&path))
            {
                return vec![*idx];
            }
            let mut hits = self.by_stem.get(&reference.stem()).cloned().unwrap_or_default();
            if let Reference::Link { target, .. } = reference {
                for idx in self.by_title.get(&target.to_lowercase()).into_iter().flatten() {
                    if !hits.contains(idx) {
                        hits.push(*idx);
                    }
                }
            }
            hits.sort_unstable();
            hits
        }

        fn first_match(&self, reference: &Reference, base: &Path) -> Option<usize> {
            let hits = self.candidates(reference, base);
            if hits.len() > 1 {
                tracing::debug!(%reference, candidates = hits.len(), "ambiguous reference; using the first match");
            }
            hits.first().copied()
        }
    }

    /// Session access for each entity kind.
    pub trait Indexed: Entity {
        fn collection(session: &Session) -> &[Self];
        fn names(session: &Session) -> &NameIndex;
    }

    impl Indexed for Item {
        fn collection(session: &Session) -> &[Self] {
            &session.items
        }

        fn names(session: &Session) -> &NameIndex {
            &session.item_names
        }
    }

    impl Indexed for Group {
        fn collection(session: &Session) -> &[Self] {
            &session.groups
        }

        fn names(session: &Session) -> &NameIndex {
            &session.group_names
        }
    }

    impl Indexed for Area {
        fn collection(session: &Session) -> &[Self] {
            &session.areas
        }

        fn names(session: &Session) -> &NameIndex {
            &session.area_names
        }
    }

    /// Resolved links by position in the session's entity lists.
    #[derive(Debug, Default)]
    struct Relations {
        item_group: Vec<Option<usize>>,
        item_area: Vec<Option<usize>>,
        group_area: Vec<Option<usize>>,
        group_items: Vec<Vec<usize>>,
        area_groups: Vec<Vec<usize>>,
        area_items_via_group: Vec<Vec<usize>>,
        area_items_direct: Vec<Vec<usize>>,
    }

    impl Relations {
        fn build(
            config: &VaultConfig,
            items: &[Item],
            groups: &[Group],
            areas: &[Area],
            group_names: &NameIndex,
            area_names: &NameIndex,
        ) -> Self {
            let item_group: Vec<_> = items
                .iter()
                .map(|item| item.group.as_ref().and_then(|r| group_names.first_match(r, &config.groups_dir)))
                .collect();
            let item_area: Vec<_> = items
                .iter()
                .map(|item| item.area.as_ref().and_then(|r| area_names.first_match(r, &config.areas_dir)))
                .collect();
            let group_area: Vec<_> = groups
                .iter()
                .map(|group| group.area.as_ref().and_then(|r| area_names.first_match(r, &config.areas_dir)))
                .collect();

            let group_items = invert(&item_group, groups.len());
            let area_groups = invert(&group_area, areas.len());
            let area_items_direct = invert(&item_area, areas.len());
            let area_items_via_group = area_groups
                .iter()
                .map(|member_groups| {
                    let mut via: Vec<usize> = member_groups
                        .iter()
                        .flat_map(|&g| group_items[g].iter().copied())
                        .collect();
                    via.sort_unstable();
                    via
                })
                .collect();

            Self {
                item_group,
                item_area,
                group_area,
                group_items,
                area_groups,
                area_items_via_group,
                area_items_direct,
            }
        }
    }

    fn invert(links: &[Option<usize>], targets: usize) -> Vec<Vec<usize>> {
        let mut inverted = vec![Vec::new(); targets];
        for (source, target) in links.iter().enumerate() {
            if let Some(target) = target {
                inverted[*target].push(source);
            }
        }
        inverted
    }

    #[derive(Debug)]
    pub struct Session {
        id: SessionId,
        config: VaultConfig,
        options: ScanOptions,
        items: Vec<Item>,
        groups: Vec<Group>,
        areas: Vec<Area>,
        item_names: NameIndex,
        group_names: NameIndex,
        area_names: NameIndex,
        relations: Relations,
        warnings: Vec<(PathBuf, Warning)>,
        failures: Vec<ScanFailure>,
    }

    impl Session {
        /// Scan all three directories and build the indices.
        pub fn open(config: VaultConfig, options: ScanOptions) -> Result<Self> {
            let id = SessionId::new();
            let span = tracing::debug_span!("session", id = %id.0);
            let _guard = span.enter();

            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.scan_workers.max(1))
                .thread_name(|i| format!("vault-scan-{i}"))
                .build()
                .map_err(|err| VaultError::Config(format!("cannot start scan workers: {err}")))?;

            let mut warnings = Vec::new();
            let mut failures = Vec::new();
            let mut items = scan::<Item>(&pool, &config, &config.items_dir).finish(&mut warnings, &mut failures);
            if options.include_archived {
                let archived = scan::<Item>(&pool, &config, &config.archive_path());
                items.extend(archived.finish(&mut warnings, &mut failures));
            }
            let groups = scan::<Group>(&pool, &config, &config.groups_dir).finish(&mut warnings, &mut failures);
            let areas = scan::<Area>(&pool, &config, &config.areas_dir).finish(&mut warnings, &mut failures);
            // a broken file in a shared directory fails once per kind
            failures.sort_by(|a, b| a.path.cmp(&b.path));
            failures.dedup_by(|a, b| a.path == b.path);

            let item_names = NameIndex::build(&items);
            let group_names = NameIndex::build(&groups);
            let area_names = NameIndex::build(&areas);
            let relations = Relations::build(&config, &items, &groups, &areas, &group_names, &area_names);

            tracing::info!(
                items = items.len(),
                groups = groups.len(),
                areas = areas.len(),
                skipped = failures.len(),
                "vault scanned"
            );
            Ok(Self {
                id,
                config,
                options,
                items,
                groups,
                areas,
                item_names,
                group_names,
                area_names,
                relations,
                warnings,
                failures,
            })
        }

        pub fn id(&self) -> SessionId {
            self.id
        }

        pub fn config(&self) -> &VaultConfig {
            &self.config
        }

        pub fn options(&self) -> ScanOptions {
            self.options
        }

        pub fn all<T: Indexed>(&self) -> &[T] {
            T::collection(self)
        }

        pub fn items(&self) -> &[Item] {
            &self.items
        }

        pub fn groups(&self) -> &[Group] {
            &self.groups
        }

        pub fn areas(&self) -> &[Area] {
            &self.areas
        }

        /// Advisory findings for the loaded entities.
        pub fn warnings(&self) -> &[(PathBuf, Warning)] {
            &self.warnings
        }

        /// Files left out because they failed to load.
        pub fn failures(&self) -> &[ScanFailure] {
            &self.failures
        }

        pub fn get<T: Indexed>(&self, path: &Path) -> Option<&T> {
            let idx = T::names(self).position(path)?;
            T::collection(self).get(idx)
        }

        /// Case-insensitive substring match on titles, in scan order.
        pub fn find_by_title_fuzzy<T: Indexed>(&self, query: &str) -> Vec<&T> {
            let needle = query.trim().to_lowercase();
            T::collection(self)
                .iter()
                .filter(|entity| entity.title().to_lowercase().contains(&needle))
                .collect()
        }

        /// One entity by title: an exact (case-insensitive) title wins over
        /// substring hits.
        pub fn find_unique<T: Indexed>(&self, query: &str) -> Result<&T> {
            let hits = self.find_by_title_fuzzy::<T>(query);
            let wanted = query.trim().to_lowercase();
            let exact: Vec<&T> = hits
                .iter()
                .copied()
                .filter(|entity| entity.title().to_lowercase() == wanted)
                .collect();
            match (exact.as_slice(), hits.as_slice()) {
                ([one], _) | ([], [one]) => Ok(*one),
                (_, []) => Err(VaultError::UnresolvedReference {
                    kind: T::KIND,
                    reference: query.to_string(),
                }),
                (exact, hits) => {
                    let pool = if exact.is_empty() { hits } else { exact };
                    Err(VaultError::AmbiguousReference {
                        kind: T::KIND,
                        reference: query.to_string(),
                        candidates: pool.iter().map(|e| e.path().to_path_buf()).collect(),
                    })
                }
            }
        }

        /// The single entity a reference points at.
        pub fn resolve<T: Indexed>(&self, reference: &Reference) -> Result<&T> {
            let all = T::collection(self);
            let candidates = T::names(self).candidates(reference, self.config.dir(T::KIND));
            match candidates.as_slice() {
                [] => Err(VaultError::UnresolvedReference {
                    kind: T::KIND,
                    reference: reference.to_string(),
                }),
                [idx] => Ok(&all[*idx]),
                many => Err(VaultError::AmbiguousReference {
                    kind: T::KIND,
                    reference: reference.to_string(),
                    candidates: many.iter().map(|&idx| all[idx].path().to_path_buf()).collect(),
                }),
            }
        }

        fn position<T: Indexed>(&self, entity: &T) -> Option<usize> {
            T::names(self).position(entity.path())
        }

        fn pick<'s, T>(all: &'s [T], positions: &[usize]) -> Vec<&'s T> {
            positions.iter().map(|&idx| &all[idx]).collect()
        }

        pub fn items_in_group(&self, group: &Group) -> Vec<&Item> {
            self.position(group)
                .map(|g| Self::pick(&self.items, &self.relations.group_items[g]))
                .unwrap_or_default()
        }

        pub fn groups_in_area(&self, area: &Area) -> Vec<&Group> {
            self.position(area)
                .map(|a| Self::pick(&self.groups, &self.relations.area_groups[a]))
                .unwrap_or_default()
        }

        /// Items whose group belongs to `area`.
        pub fn items_in_area_via_group(&self, area: &Area) -> Vec<&Item> {
            self.position(area)
                .map(|a| Self::pick(&self.items, &self.relations.area_items_via_group[a]))
                .unwrap_or_default()
        }

        /// Items assigned to `area` directly or through their group.
        pub fn items_in_area(&self, area: &Area) -> Vec<&Item> {
            let Some(a) = self.position(area) else {
                return Vec::new();
            };
            let mut positions = self.relations.area_items_direct[a].clone();
            positions.extend(&self.relations.area_items_via_group[a]);
            positions.sort_unstable();
            positions.dedup();
            Self::pick(&self.items, &positions)
        }

        pub fn group_of(&self, item: &Item) -> Option<&Group> {
            let g = self.relations.item_group[self.position(item)?]?;
            self.groups.get(g)
        }

        pub fn area_of_group(&self, group: &Group) -> Option<&Area> {
            let a = self.relations.group_area[self.position(group)?]?;
            self.areas.get(a)
        }

        /// The item's own area, else its group's.
        pub fn area_of(&self, item: &Item) -> Option<&Area> {
            let i = self.position(item)?;
            let direct = self.relations.item_area[i];
            let via_group = self.relations.item_group[i].and_then(|g| self.relations.group_area[g]);
            self.areas.get(direct.or(via_group)?)
        }

        pub fn group_progress(&self, group: &Group) -> Progress {
            let items = self.items_in_group(group);
            Progress {
                total: items.len(),
                done: items.iter().filter(|i| i.status == ItemStatus::Done).count(),
                dropped: items.iter().filter(|i| i.status == ItemStatus::Dropped).count(),
            }
        }

        pub fn filter<T: Indexed, F: Filter<T>>(&self, filter: &F) -> Vec<&T> {
            filter.apply(T::collection(self))
        }
    }

    /* --------------------------------- Scanning -------------------------------- */

    struct DirScan<T> {
        loaded: Vec<Validated<T>>,
        failures: Vec<ScanFailure>,
    }

    impl<T: Entity> DirScan<T> {
        fn finish(self, warnings: &mut Vec<(PathBuf, Warning)>, failures: &mut Vec<ScanFailure>) -> Vec<T> {
            failures.extend(self.failures);
            self.loaded
                .into_iter()
                .map(|validated| {
                    for warning in validated.warnings {
                        tracing::debug!(path = %validated.entity.path().display(), %warning, "advisory warning");
                        warnings.push((validated.entity.path().to_path_buf(), warning));
                    }
                    validated.entity
                })
                .collect()
        }
    }

    /// Parse the entity files of `dir` on `pool`. Files that cannot be read or
    /// decoded are always recorded; marker membership only filters readable ones.
    fn scan<T: Entity>(pool: &rayon::ThreadPool, config: &VaultConfig, dir: &Path) -> DirScan<T> {
        let kind = T::KIND;
        let field = config.marker_field.as_str();
        let files = list_entity_files(dir, &config.extension);
        let parsed: Vec<(PathBuf, Result<(bool, Result<Validated<T>>)>)> = pool.install(|| {
            files
                .par_iter()
                .map(|path| {
                    let read = model::read_document(path).map(|doc| {
                        let marked = carries_marker(&doc, field, kind.as_str());
                        (marked, T::from_document(path, doc))
                    });
                    (path.clone(), read)
                })
                .collect()
        });

        let any_marked = parsed.iter().any(|(_, read)| matches!(read, Ok((true, _))));
        let required = markers_required(config, dir, any_marked);
        let mut out = DirScan { loaded: Vec::new(), failures: Vec::new() };
        for (path, read) in parsed {
            let result = match read {
                Ok((marked, _)) if required && !marked => {
                    tracing::debug!(path = %path.display(), %kind, "skipping file without marker");
                    continue;
                }
                Ok((_, result)) => result,
                Err(error) => Err(error),
            };
            match result {
                Ok(validated) => out.loaded.push(validated),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping {} file", kind);
                    out.failures.push(ScanFailure { path, error });
                }
            }
        }
        out
    }

    /// Files in `dir` count as one kind only when they carry `marker: <kind>`
    /// once the directory is shared by several kinds or any file there is marked.
    pub(crate) fn markers_required(config: &VaultConfig, dir: &Path, any_marked: bool) -> bool {
        any_marked || config.is_shared(dir)
    }

    /// Whether any readable entity file in `dir` carries `marker: <kind>`.
    pub(crate) fn directory_marked(config: &VaultConfig, dir: &Path, kind: EntityKind) -> bool {
        list_entity_files(dir, &config.extension).iter().any(|path| {
            model::read_document(path)
                .is_ok_and(|doc| carries_marker(&doc, &config.marker_field, kind.as_str()))
        })
    }

    pub(crate) fn carries_marker(doc: &crate::codec::Document, field: &str, kind: &str) -> bool {
        doc.get(field)
            .and_then(|value| value.as_str())
            .is_some_and(|value| value.trim().eq_ignore_ascii_case(kind))
    }

    /// Files directly inside `dir` with the given extension, sorted by name.
    fn list_entity_files(dir: &Path, extension: &str) -> Vec<PathBuf> {
        if !dir.is_dir() {
            tracing::debug!(dir = %dir.display(), "directory missing; nothing to scan");
            return Vec::new();
        }
        WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable directory entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
            })
            .map(walkdir::DirEntry::into_path)
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::filter::ItemFilter;
        use std::fs;

        struct Fixture {
            _dir: tempfile::TempDir,
            config: VaultConfig,
        }

        impl Fixture {
            fn new() -> Self {
                let dir = tempfile::tempdir().expect("tempdir");
                let config = VaultConfig::for_root(dir.path());
                for kind in EntityKind::ALL {
                    fs::create_dir_all(config.dir(kind)).expect("mkdir");
                }
                fs::create_dir_all(config.archive_path()).expect("mkdir archive");
                Self { _dir: dir, config }
            }

            fn write(&self, dir: &Path, name: &str, text: &str) -> PathBuf {
                let path = dir.join(name);
                fs::write(&path, text).expect("write fixture");
                path
            }

            fn item(&self, name: &str, status: &str, extra: &str) -> PathBuf {
                let text = format!(
                    "---\ntitle: {name}\nstatus: {status}\ncreated-at: 2025-01-01\nupdated-at: 2025-01-01\n{extra}---\n"
                );
                self.write(&self.config.items_dir, &format!("{name}.md"), &text)
            }

            fn group(&self, file: &str, title: &str, extra: &str) -> PathBuf {
                let text = format!("---\ntitle: {title}\n{extra}---\n");
                self.write(&self.config.groups_dir, file, &text)
            }

            fn area(&self, file: &str, title: &str, extra: &str) -> PathBuf {
                let text = format!("---\ntitle: {title}\n{extra}---\n");
                self.write(&self.config.areas_dir, file, &text)
            }

            fn open(&self) -> Session {
                Session::open(self.config.clone(), ScanOptions::default()).expect("session")
            }
        }

        fn titles<T: Entity>(entities: Vec<&T>) -> Vec<String> {
            entities.into_iter().map(|e| e.title().to_string()).collect()
        }

        #[test]
        fn broken_files_are_skipped_and_recorded() {
            let fx = Fixture::new();
            fx.item("one", "ready", "");
            fx.item("two", "inbox", "");
            fx.item("three", "done", "completed-at: 2025-01-02\n");
            fx.write(&fx.config.items_dir, "broken.md", "---\ntitle: no closing\n");
            fx.write(&fx.config.items_dir, "notes.txt", "not an item");
            fx.write(&fx.config.items_dir, ".hidden.md", "---\n---\n");

            let session = fx.open();
            assert_eq!(session.items().len(), 3);
            assert_eq!(session.failures().len(), 1);
            assert!(session.failures()[0].path.ends_with("broken.md"));
            assert!(matches!(session.failures()[0].error, VaultError::Parse { .. }));
        }

        #[test]
        fn archived_items_only_when_asked() {
            let fx = Fixture::new();
            fx.item("live", "ready", "");
            fx.write(
                &fx.config.archive_path(),
                "old.md",
                "---\ntitle: old\nstatus: done\ncreated-at: 2024-01-01\nupdated-at: 2024-01-01\ncompleted-at: 2024-02-01\n---\n",
            );
            assert_eq!(fx.open().items().len(), 1);
            let session = Session::open(fx.config.clone(), ScanOptions { include_archived: true })
                .expect("session");
            assert_eq!(session.items().len(), 2);
        }

        #[test]
        fn relationships_follow_every_reference_spelling() {
            let fx = Fixture::new();
            fx.area("home.md", "Home", "");
            fx.group("q1-plan.md", "Q1 Plan", "area: \"[[Home]]\"\n");
            fx.group("other.md", "Other", "");
            fx.item("a", "ready", "group: \"[[Q1 Plan]]\"\n");
            fx.item("b", "done", "group: ../groups/q1-plan.md\ncompleted-at: 2025-01-03\n");
            fx.item("c", "dropped", "group: q1-plan.md\ncompleted-at: 2025-01-03\n");
            fx.item("d", "ready", "area: \"[[home]]\"\n");
            fx.item("e", "ready", "group: \"[[Missing]]\"\n");

            let session = fx.open();
            let group = session.find_unique::<Group>("q1 plan").expect("group");
            let area = session.find_unique::<Area>("home").expect("area");

            assert_eq!(titles(session.items_in_group(group)), ["a", "b", "c"]);
            assert_eq!(titles(session.groups_in_area(area)), ["Q1 Plan"]);
            assert_eq!(titles(session.items_in_area_via_group(area)), ["a", "b", "c"]);
            assert_eq!(titles(session.items_in_area(area)), ["a", "b", "c", "d"]);

            let a = session.find_unique::<Item>("a").expect("a");
            assert_eq!(session.group_of(a).map(|g| g.title.as_str()), Some("Q1 Plan"));
            assert_eq!(session.area_of(a).map(|g| g.title.as_str()), Some("Home"));
            let e = session.find_unique::<Item>("e").expect("e");
            assert!(session.group_of(e).is_none());

            assert_eq!(
                session.group_progress(group),
                Progress { total: 3, done: 1, dropped: 1 }
            );
            assert_eq!(session.group_progress(group).open(), 1);
        }

        #[test]
        fn fuzzy_and_unique_lookup() {
            let fx = Fixture::new();
            fx.group("plan.md", "Plan", "");
            fx.group("q1.md", "Q1 Plan", "");
            fx.group("q2.md", "Q2 Plan", "");
            let session = fx.open();

            assert_eq!(session.find_by_title_fuzzy::<Group>("PLAN").len(), 3);
            assert_eq!(session.find_unique::<Group>("plan").expect("exact").title, "Plan");
            assert_eq!(session.find_unique::<Group>("q2").expect("single").title, "Q2 Plan");
            assert!(matches!(
                session.find_unique::<Group>("q"),
                Err(VaultError::AmbiguousReference { ref candidates, .. }) if candidates.len() == 2
            ));
            assert!(matches!(
                session.find_unique::<Group>("nope"),
                Err(VaultError::UnresolvedReference { kind: EntityKind::Group, .. })
            ));
        }

        #[test]
        fn resolve_reports_missing_and_ambiguous_targets() {
            let fx = Fixture::new();
            fx.group("alpha.md", "Shared", "");
            fx.group("beta.md", "Shared", "");
            let session = fx.open();

            let by_file = session.resolve::<Group>(&Reference::parse("alpha.md").expect("ref"));
            assert_eq!(by_file.expect("alpha").path, fx.config.groups_dir.join("alpha.md"));
            assert!(matches!(
                session.resolve::<Group>(&Reference::link("Shared")),
                Err(VaultError::AmbiguousReference { .. })
            ));
            assert!(matches!(
                session.resolve::<Group>(&Reference::link("gamma")),
                Err(VaultError::UnresolvedReference { .. })
            ));
        }

        #[test]
        fn marker_field_separates_shared_directories() {
            let mut fx = Fixture::new();
            fx.config.areas_dir = fx.config.groups_dir.clone();
            fx.group("q1.md", "Q1 Plan", "kind: group\n");
            fx.group("home.md", "Home", "kind: area\n");
            fx.group("loose.md", "Loose", "");

            let session = fx.open();
            assert_eq!(titles(session.groups().iter().collect()), ["Q1 Plan"]);
            assert_eq!(titles(session.areas().iter().collect()), ["Home"]);
            assert_eq!(session.groups()[0].extra.get("kind").and_then(|v| v.as_str()), Some("group"));
        }

        #[test]
        fn broken_files_are_recorded_in_marked_directories() {
            let fx = Fixture::new();
            fx.group("a.md", "A", "kind: group\n");
            fx.group("broken.md", "[oops", "kind: group\n");
            let session = fx.open();
            assert_eq!(titles(session.groups().iter().collect()), ["A"]);
            assert_eq!(session.failures().len(), 1);
            assert!(session.failures()[0].path.ends_with("broken.md"));
        }

        #[test]
        fn broken_files_in_shared_directories_fail_once() {
            let mut fx = Fixture::new();
            fx.config.areas_dir = fx.config.groups_dir.clone();
            fx.group("q1.md", "Q1 Plan", "kind: group\n");
            fx.group("broken.md", "[oops", "kind: area\n");
            let session = fx.open();
            assert_eq!(session.groups().len(), 1);
            assert!(session.areas().is_empty());
            assert_eq!(session.failures().len(), 1);
        }

        #[test]
        fn unmarked_directories_keep_every_file() {
            let fx = Fixture::new();
            fx.group("a.md", "A", "");
            fx.group("b.md", "B", "");
            assert_eq!(fx.open().groups().len(), 2);
        }

        #[test]
        fn warnings_and_filters_are_exposed() {
            let fx = Fixture::new();
            fx.item("closed", "done", "");
            fx.item("open", "ready", "due: 2025-01-02\n");
            let session = fx.open();
            assert_eq!(session.warnings().len(), 1);
            assert!(matches!(session.warnings()[0].1, Warning::MissingCompletion { .. }));

            let today = chrono::NaiveDate::from_ymd_opt(2025, 1, 10).expect("date");
            let overdue: Vec<&Item> = session.filter(&ItemFilter::overdue(today));
            assert_eq!(titles(overdue), ["open"]);
            assert!(session.get::<Item>(&fx.config.items_dir.join("open.md")).is_some());
        }
    }
}

pub mod mutation {
    //! Every write to the vault goes through here: create, update, archive,
    //! delete. Writes re-parse what they are about to store, so a file on disk
    //! always decodes.

    use crate::config::{VaultConfig, absolutize};
    use crate::error::{Result, VaultError};
    use crate::model::{
        self, Area, AreaStatus, Entity, EntityKind, Group, GroupStatus, Item, ItemStatus, Validated,
        fields,
    };
    use crate::session::{ScanOptions, Session};
    use crate::values::{DateValue, Reference};
    use chrono::{DateTime, FixedOffset, Local};
    use indexmap::IndexMap;
    use serde_yaml::Value;
    use std::{
        fs,
        io::Write,
        path::{Path, PathBuf},
    };

    /* ------------------------------ Field updates ------------------------------ */

    /// Three-way update: leave alone, clear, or set.
    #[derive(Debug, Clone, PartialEq)]
    pub enum FieldUpdate<T> {
        Keep,
        Clear,
        Set(T),
    }

    impl<T> Default for FieldUpdate<T> {
        fn default() -> Self {
            FieldUpdate::Keep
        }
    }

    impl<T> From<Option<T>> for FieldUpdate<T> {
        /// `None` keeps the field.
        fn from(value: Option<T>) -> Self {
            value.map_or(FieldUpdate::Keep, FieldUpdate::Set)
        }
    }

    impl<T> FieldUpdate<T> {
        pub fn is_keep(&self) -> bool {
            matches!(self, FieldUpdate::Keep)
        }

        pub fn apply(self, slot: &mut Option<T>) {
            match self {
                FieldUpdate::Keep => {}
                FieldUpdate::Clear => *slot = None,
                FieldUpdate::Set(value) => *slot = Some(value),
            }
        }

        fn apply_required(self, slot: &mut T, path: &Path, field: &str) -> Result<()> {
            match self {
                FieldUpdate::Keep => Ok(()),
                FieldUpdate::Clear => Err(cannot_clear(path, field)),
                FieldUpdate::Set(value) => {
                    *slot = value;
                    Ok(())
                }
            }
        }
    }

    fn cannot_clear(path: &Path, field: &str) -> VaultError {
        VaultError::InvalidField {
            path: path.to_path_buf(),
            field: field.to_string(),
            value: String::new(),
            reason: "required field cannot be cleared".to_string(),
        }
    }

    fn set_title(update: FieldUpdate<String>, title: &mut String, path: &Path) -> Result<()> {
        if let FieldUpdate::Set(new) = &update {
            if new.trim().is_empty() {
                return Err(cannot_clear(path, fields::TITLE));
            }
        }
        update.apply_required(title, path, fields::TITLE)?;
        *title = title.trim().to_string();
        Ok(())
    }

    fn set_body(update: FieldUpdate<String>, body: &mut String) {
        match update {
            FieldUpdate::Keep => {}
            FieldUpdate::Clear => body.clear(),
            FieldUpdate::Set(text) => *body = text,
        }
    }

    fn apply_extra(
        extra: &mut IndexMap<String, Value>,
        updates: IndexMap<String, FieldUpdate<Value>>,
        known: &[&str],
        path: &Path,
    ) -> Result<()> {
        for (key, update) in updates {
            if known.contains(&key.as_str()) {
                return Err(VaultError::InvalidField {
                    path: path.to_path_buf(),
                    field: key,
                    value: String::new(),
                    reason: "schema fields are updated through their typed slot".to_string(),
                });
            }
            match update {
                FieldUpdate::Keep => {}
                FieldUpdate::Clear => {
                    extra.shift_remove(&key);
                }
                FieldUpdate::Set(value) => {
                    extra.insert(key, value);
                }
            }
        }
        Ok(())
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct ItemUpdate {
        pub title: FieldUpdate<String>,
        pub status: FieldUpdate<ItemStatus>,
        pub due: FieldUpdate<DateValue>,
        pub scheduled: FieldUpdate<DateValue>,
        pub defer_until: FieldUpdate<DateValue>,
        pub group: FieldUpdate<Reference>,
        pub area: FieldUpdate<Reference>,
        pub body: FieldUpdate<String>,
        /// Unrecognized header fields.
        pub extra: IndexMap<String, FieldUpdate<Value>>,
    }

    impl ItemUpdate {
        pub fn status(status: ItemStatus) -> Self {
            Self {
                status: FieldUpdate::Set(status),
                ..Self::default()
            }
        }
    }

    /// Apply `update` to `item` as of `now`.
    ///
    /// `updated-at` always moves to `now` in its existing shape. Setting a
    /// done/dropped status stamps `completed-at` when the status actually
    /// changes or no completion time was recorded yet.
    pub fn apply_item_update(item: &mut Item, update: ItemUpdate, now: &DateTime<FixedOffset>) -> Result<()> {
        let ItemUpdate {
            title,
            status,
            due,
            scheduled,
            defer_until,
            group,
            area,
            body,
            extra,
        } = update;
        let path = item.path.clone();

        let stamps_completion = match &status {
            FieldUpdate::Set(next) => {
                next.is_closed() && (*next != item.status || item.completed_at.is_none())
            }
            _ => false,
        };
        if let FieldUpdate::Set(next) = &status {
            if next.is_unknown() {
                return Err(VaultError::InvalidField {
                    path,
                    field: fields::STATUS.to_string(),
                    value: next.to_string(),
                    reason: format!("expected one of: {}", ItemStatus::tokens()),
                });
            }
        }

        set_title(title, &mut item.title, &path)?;
        status.apply_required(&mut item.status, &path, fields::STATUS)?;
        due.apply(&mut item.due);
        scheduled.apply(&mut item.scheduled);
        defer_until.apply(&mut item.defer_until);
        group.apply(&mut item.group);
        area.apply(&mut item.area);
        set_body(body, &mut item.body);
        apply_extra(&mut item.extra, extra, Item::FIELDS, &path)?;

        item.updated_at = item.updated_at.restamp(now);
        if stamps_completion {
            let shape = item.completed_at.unwrap_or(item.created_at);
            item.completed_at = Some(shape.restamp(now));
        }
        Ok(())
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct GroupUpdate {
        pub title: FieldUpdate<String>,
        pub status: FieldUpdate<GroupStatus>,
        pub area: FieldUpdate<Reference>,
        pub start_date: FieldUpdate<DateValue>,
        pub end_date: FieldUpdate<DateValue>,
        pub blocked_by: FieldUpdate<Vec<Reference>>,
        pub body: FieldUpdate<String>,
        pub extra: IndexMap<String, FieldUpdate<Value>>,
    }

    pub fn apply_group_update(group: &mut Group, update: GroupUpdate) -> Result<()> {
        let path = group.path.clone();
        set_title(update.title, &mut group.title, &path)?;
        update.status.apply(&mut group.status);
        update.area.apply(&mut group.area);
        update.start_date.apply(&mut group.start_date);
        update.end_date.apply(&mut group.end_date);
        match update.blocked_by {
            FieldUpdate::Keep => {}
            FieldUpdate::Clear => group.blocked_by.clear(),
            FieldUpdate::Set(refs) => group.blocked_by = refs,
        }
        set_body(update.body, &mut group.body);
        apply_extra(&mut group.extra, update.extra, Group::FIELDS, &path)
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct AreaUpdate {
        pub title: FieldUpdate<String>,
        pub status: FieldUpdate<AreaStatus>,
        pub area_type: FieldUpdate<String>,
        pub body: FieldUpdate<String>,
        pub extra: IndexMap<String, FieldUpdate<Value>>,
    }

    pub fn apply_area_update(area: &mut Area, update: AreaUpdate) -> Result<()> {
        let path = area.path.clone();
        set_title(update.title, &mut area.title, &path)?;
        update.status.apply(&mut area.status);
        update.area_type.apply(&mut area.area_type);
        set_body(update.body, &mut area.body);
        apply_extra(&mut area.extra, update.extra, Area::FIELDS, &path)
    }

    /* -------------------------------- Creation -------------------------------- */

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct NewItem {
        pub title: String,
        /// Defaults to inbox.
        pub status: Option<ItemStatus>,
        pub due: Option<DateValue>,
        pub scheduled: Option<DateValue>,
        pub defer_until: Option<DateValue>,
        pub group: Option<Reference>,
        pub area: Option<Reference>,
        pub body: String,
        /// Explicit file name; derived from the title otherwise.
        pub filename: Option<String>,
        pub extra: IndexMap<String, Value>,
    }

    impl NewItem {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                ..Self::default()
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct NewGroup {
        pub title: String,
        pub status: Option<GroupStatus>,
        pub area: Option<Reference>,
        pub start_date: Option<DateValue>,
        pub end_date: Option<DateValue>,
        pub blocked_by: Vec<Reference>,
        pub body: String,
        pub filename: Option<String>,
        pub extra: IndexMap<String, Value>,
    }

    impl NewGroup {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                ..Self::default()
            }
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct NewArea {
        pub title: String,
        pub status: Option<AreaStatus>,
        pub area_type: Option<String>,
        pub body: String,
        pub filename: Option<String>,
        pub extra: IndexMap<String, Value>,
    }

    impl NewArea {
        pub fn new(title: impl Into<String>) -> Self {
            Self {
                title: title.into(),
                ..Self::default()
            }
        }
    }

    /// File stem for a title: lower-case alphanumerics joined by single
    /// dashes, at most `max_len` bytes.
    pub fn slugify(title: &str, max_len: usize) -> String {
        let mut slug = String::with_capacity(title.len());
        for c in title.chars().flat_map(char::to_lowercase) {
            if c.is_alphanumeric() {
                slug.push(c);
            } else if !slug.is_empty() && !slug.ends_with('-') {
                slug.push('-');
            }
        }
        if slug.len() > max_len {
            let mut end = max_len;
            while !slug.is_char_boundary(end) {
                end -= 1;
            }
            slug.truncate(end);
        }
        let slug = slug.trim_end_matches('-');
        if slug.is_empty() { "untitled".to_string() } else { slug.to_string() }
    }

    /* ---------------------------------- Vault ---------------------------------- */

    /// Source of "now" for timestamps.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum Clock {
        #[default]
        System,
        Fixed(DateTime<FixedOffset>),
    }

    impl Clock {
        pub fn now(&self) -> DateTime<FixedOffset> {
            match self {
                Clock::System => Local::now().fixed_offset(),
                Clock::Fixed(now) => *now,
            }
        }
    }

    /// Outcome of a batch: every input is attempted.
    #[derive(Debug)]
    pub struct BatchResult<T> {
        pub succeeded: Vec<T>,
        pub failed: Vec<(PathBuf, VaultError)>,
    }

    impl<T> BatchResult<T> {
        fn run<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>, mut op: impl FnMut(&Path) -> Result<T>) -> Self {
            let mut result = BatchResult { succeeded: Vec::new(), failed: Vec::new() };
            for path in paths {
                let path = path.as_ref();
                match op(path) {
                    Ok(value) => result.succeeded.push(value),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "batch step failed");
                        result.failed.push((path.to_path_buf(), err));
                    }
                }
            }
            result
        }

        pub fn is_complete(&self) -> bool {
            self.failed.is_empty()
        }
    }

    /// Entry point for reading and writing one vault.
    #[derive(Debug, Clone)]
    pub struct Vault {
        config: VaultConfig,
        clock: Clock,
    }

    impl Vault {
        pub fn new(config: VaultConfig) -> Self {
            Self { config, clock: Clock::System }
        }

        pub fn with_clock(mut self, clock: Clock) -> Self {
            self.clock = clock;
            self
        }

        pub fn config(&self) -> &VaultConfig {
            &self.config
        }

        pub fn clock(&self) -> Clock {
            self.clock
        }

        pub fn session(&self) -> Result<Session> {
            self.session_with(ScanOptions::default())
        }

        pub fn session_with(&self, options: ScanOptions) -> Result<Session> {
            Session::open(self.config.clone(), options)
        }

        pub fn load<T: Entity>(&self, path: &Path) -> Result<Validated<T>> {
            model::load(path)
        }

        pub fn create_item(&self, new: NewItem) -> Result<Validated<Item>> {
            let NewItem {
                title,
                status,
                due,
                scheduled,
                defer_until,
                group,
                area,
                body,
                filename,
                extra,
            } = new;
            let path = self.new_path(EntityKind::Item, &title, filename.as_deref())?;
            let mut item = Item::new(path, title.trim(), status.unwrap_or(ItemStatus::Inbox), &self.clock.now());
            if item.status.is_closed() {
                item.completed_at = Some(item.created_at);
            }
            item.due = due;
            item.scheduled = scheduled;
            item.defer_until = defer_until;
            item.group = group;
            item.area = area;
            item.body = body;
            item.extra = extra;
            self.store_new(item)
        }

        pub fn create_group(&self, new: NewGroup) -> Result<Validated<Group>> {
            let path = self.new_path(EntityKind::Group, &new.title, new.filename.as_deref())?;
            let mut group = Group::new(path, new.title.trim());
            group.status = new.status;
            group.area = new.area;
            group.start_date = new.start_date;
            group.end_date = new.end_date;
            group.blocked_by = new.blocked_by;
            group.body = new.body;
            group.extra = new.extra;
            self.store_new(group)
        }

        pub fn create_area(&self, new: NewArea) -> Result<Validated<Area>> {
            let path = self.new_path(EntityKind::Area, &new.title, new.filename.as_deref())?;
            let mut area = Area::new(path, new.title.trim());
            area.status = new.status;
            area.area_type = new.area_type;
            area.body = new.body;
            area.extra = new.extra;
            self.store_new(area)
        }

        pub fn update_item(&self, path: &Path, update: ItemUpdate) -> Result<Validated<Item>> {
            let mut item = model::load::<Item>(path)?.into_inner();
            apply_item_update(&mut item, update, &self.clock.now())?;
            self.store(item)
        }

        pub fn update_group(&self, path: &Path, update: GroupUpdate) -> Result<Validated<Group>> {
            let mut group = model::load::<Group>(path)?.into_inner();
            apply_group_update(&mut group, update)?;
            self.store(group)
        }

        pub fn update_area(&self, path: &Path, update: AreaUpdate) -> Result<Validated<Area>> {
            let mut area = model::load::<Area>(path)?.into_inner();
            apply_area_update(&mut area, update)?;
            self.store(area)
        }

        pub fn set_status(&self, path: &Path, status: ItemStatus) -> Result<Validated<Item>> {
            self.update_item(path, ItemUpdate::status(status))
        }

        pub fn complete(&self, path: &Path) -> Result<Validated<Item>> {
            self.set_status(path, ItemStatus::Done)
        }

        pub fn drop_item(&self, path: &Path) -> Result<Validated<Item>> {
            self.set_status(path, ItemStatus::Dropped)
        }

        pub fn set_status_many<P: AsRef<Path>>(
            &self,
            paths: impl IntoIterator<Item = P>,
            status: ItemStatus,
        ) -> BatchResult<Validated<Item>> {
            BatchResult::run(paths, |path| self.set_status(path, status.clone()))
        }

        /// Where `archive` would move an item.
        pub fn archive_path(&self, path: &Path) -> Result<PathBuf> {
            self.move_target(path, true).map(|(_, target)| target)
        }

        /// Move an item into the archive subdirectory. No fields change.
        pub fn archive(&self, path: &Path) -> Result<Validated<Item>> {
            self.move_item(path, true)
        }

        pub fn unarchive(&self, path: &Path) -> Result<Validated<Item>> {
            self.move_item(path, false)
        }

        pub fn archive_many<P: AsRef<Path>>(&self, paths: impl IntoIterator<Item = P>) -> BatchResult<Validated<Item>> {
            BatchResult::run(paths, |path| self.archive(path))
        }

        pub fn unarchive_many<P: AsRef<Path>>(&self, paths: impl IntoIterator<Item = P>) -> BatchResult<Validated<Item>> {
            BatchResult::run(paths, |path| self.unarchive(path))
        }

        /// Remove an entity file; refuses paths outside the vault directories.
        pub fn delete(&self, path: &Path) -> Result<()> {
            let path = absolutize(path);
            if self.config.locate(&path).is_empty() || !self.config.has_extension(&path) {
                return Err(VaultError::Validation {
                    path,
                    message: "not an entity file inside the vault".to_string(),
                });
            }
            fs::remove_file(&path).map_err(|err| VaultError::io(&path, err))?;
            tracing::info!(path = %path.display(), "deleted");
            Ok(())
        }

        fn new_path(&self, kind: EntityKind, title: &str, filename: Option<&str>) -> Result<PathBuf> {
            let dir = self.config.dir(kind);
            if title.trim().is_empty() {
                return Err(VaultError::MissingField {
                    path: dir.to_path_buf(),
                    field: fields::TITLE.to_string(),
                });
            }
            let name = match filename.map(str::trim) {
                Some(name) => {
                    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
                        return Err(VaultError::Validation {
                            path: dir.join(name),
                            message: "file name must be a plain name inside the directory".to_string(),
                        });
                    }
                    if self.config.has_extension(Path::new(name)) {
                        name.to_string()
                    } else {
                        self.config.file_name(name)
                    }
                }
                None => self.config.file_name(&slugify(title, self.config.filename_max_len)),
            };
            Ok(dir.join(name))
        }

        /// Validate the rendered text, then write it to a file that must not exist.
        fn store_new<T: Entity>(&self, entity: T) -> Result<Validated<T>> {
            let path = entity.path().to_path_buf();
            let text = entity.render();
            let validated = T::parse(&path, &text)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| VaultError::io(parent, err))?;
            }
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|err| VaultError::io(&path, err))?;
            file.write_all(text.as_bytes()).map_err(|err| VaultError::io(&path, err))?;
            tracing::info!(path = %path.display(), kind = %T::KIND, "created");
            Ok(validated)
        }

        /// Validate the rendered text, then overwrite the entity's file.
        fn store<T: Entity>(&self, entity: T) -> Result<Validated<T>> {
            let path = entity.path();
            let text = entity.render();
            let validated = T::parse(path, &text)?;
            fs::write(path, text.as_bytes()).map_err(|err| VaultError::io(path, err))?;
            tracing::debug!(path = %path.display(), kind = %T::KIND, "updated");
            Ok(validated)
        }

        fn move_target(&self, path: &Path, to_archive: bool) -> Result<(PathBuf, PathBuf)> {
            let source = absolutize(path);
            let archive = self.config.archive_path();
            let (from, to, place) = if to_archive {
                (self.config.items_dir.as_path(), archive.as_path(), "items")
            } else {
                (archive.as_path(), self.config.items_dir.as_path(), "archive")
            };
            let file_name = match (source.parent(), source.file_name()) {
                (Some(parent), Some(name)) if parent == from => name.to_owned(),
                _ => {
                    return Err(VaultError::Validation {
                        path: source,
                        message: format!("not in the {place} directory"),
                    });
                }
            };
            let target = to.join(file_name);
            Ok((source, target))
        }

        fn move_item(&self, path: &Path, to_archive: bool) -> Result<Validated<Item>> {
            let (source, target) = self.move_target(path, to_archive)?;
            model::load::<Item>(&source)?;
            if target.exists() {
                return Err(VaultError::WriteConflict { path: target });
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|err| VaultError::io(parent, err))?;
            }
            fs::rename(&source, &target).map_err(|err| VaultError::io(&source, err))?;
            tracing::info!(from = %source.display(), to = %target.display(), "moved item");
            model::load::<Item>(&target)
        }
    }

}

pub mod events {
    //! Turns raw filesystem notifications into typed vault events.

    use crate::config::{Location, VaultConfig, absolutize};
    use crate::error::Result;
    use crate::model::{self, AnyEntity, Area, Entity, EntityKind, Group, Item};
    use crate::session::{carries_marker, directory_marked, markers_required};
    use serde::Serialize;
    use std::path::{Path, PathBuf};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum ChangeKind {
        Created,
        Modified,
        Deleted,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(tag = "event", rename_all = "lowercase")]
    pub enum VaultEvent {
        Created { entity: AnyEntity },
        Modified { entity: AnyEntity },
        /// `kind` is `None` when several kinds share the directory.
        Deleted { path: PathBuf, kind: Option<EntityKind> },
    }

    impl VaultEvent {
        pub fn path(&self) -> &Path {
            match self {
                VaultEvent::Created { entity } | VaultEvent::Modified { entity } => entity.path(),
                VaultEvent::Deleted { path, .. } => path,
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct ChangeTranslator {
        config: VaultConfig,
        include_archived: bool,
    }

    impl ChangeTranslator {
        pub fn new(config: VaultConfig) -> Self {
            Self { config, include_archived: false }
        }

        pub fn include_archived(mut self, include: bool) -> Self {
            self.include_archived = include;
            self
        }

        /// `Ok(None)` for paths the vault does not track.
        pub fn translate(&self, path: &Path, change: ChangeKind) -> Result<Option<VaultEvent>> {
            let path = absolutize(path);
            let hidden = path
                .file_name()
                .is_none_or(|name| name.to_string_lossy().starts_with('.'));
            if hidden || !self.config.has_extension(&path) {
                return Ok(None);
            }
            let locations: Vec<Location> = self
                .config
                .locate(&path)
                .into_iter()
                .filter(|location| !location.archived || self.include_archived)
                .collect();
            if locations.is_empty() {
                return Ok(None);
            }

            if change == ChangeKind::Deleted {
                let kind = match locations.as_slice() {
                    [only] => Some(only.kind),
                    _ => None,
                };
                tracing::debug!(path = %path.display(), ?kind, "entity file deleted");
                return Ok(Some(VaultEvent::Deleted { path, kind }));
            }

            let doc = model::read_document(&path)?;
            let Some(dir) = path.parent() else {
                return Ok(None);
            };
            let field = &self.config.marker_field;
            let member = locations.iter().map(|location| location.kind).find(|kind| {
                let marked = carries_marker(&doc, field, kind.as_str());
                marked || !markers_required(&self.config, dir, directory_marked(&self.config, dir, *kind))
            });
            let Some(kind) = member else {
                tracing::debug!(path = %path.display(), "file lacks the marker its directory requires; ignoring");
                return Ok(None);
            };
            let entity = match kind {
                EntityKind::Item => AnyEntity::Item(Item::from_document(&path, doc)?),
                EntityKind::Group => AnyEntity::Group(Group::from_document(&path, doc)?),
                EntityKind::Area => AnyEntity::Area(Area::from_document(&path, doc)?),
            };
            Ok(Some(match change {
                ChangeKind::Created => VaultEvent::Created { entity },
                _ => VaultEvent::Modified { entity },
            }))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::error::VaultError;
        use crate::session::{ScanOptions, Session};
        use std::fs;

        fn setup() -> (tempfile::TempDir, VaultConfig) {
            let dir = tempfile::tempdir().expect("tempdir");
            let config = VaultConfig::for_root(dir.path());
            fs::create_dir_all(config.archive_path()).expect("items");
            fs::create_dir_all(&config.groups_dir).expect("groups");
            (dir, config)
        }

        const ITEM: &str = "---\ntitle: t\nstatus: ready\ncreated-at: 2025-01-01\nupdated-at: 2025-01-01\n---\n";

        #[test]
        fn irrelevant_paths_are_ignored() {
            let (dir, config) = setup();
            let translator = ChangeTranslator::new(config.clone());
            for path in [
                config.items_dir.join("notes.txt"),
                config.items_dir.join(".draft.md"),
                dir.path().join("stray.md"),
                config.items_dir.join("nested/deep.md"),
                config.archive_path().join("old.md"),
            ] {
                let event = translator.translate(&path, ChangeKind::Modified).expect("translate");
                assert!(event.is_none(), "{path:?}");
            }
        }

        #[test]
        fn created_and_modified_files_are_parsed() {
            let (_dir, config) = setup();
            let path = config.items_dir.join("t.md");
            fs::write(&path, ITEM).expect("write");
            let translator = ChangeTranslator::new(config);
            match translator.translate(&path, ChangeKind::Created).expect("translate") {
                Some(VaultEvent::Created { entity: AnyEntity::Item(item) }) => {
                    assert_eq!(item.entity.title, "t")
                }
                other => panic!("unexpected {other:?}"),
            }
            let modified = translator.translate(&path, ChangeKind::Modified).expect("translate");
            assert!(matches!(modified, Some(VaultEvent::Modified { .. })));
        }

        #[test]
        fn deleted_files_carry_their_kind() {
            let (_dir, mut config) = setup();
            let group = config.groups_dir.join("gone.md");
            let translator = ChangeTranslator::new(config.clone());
            assert_eq!(
                translator.translate(&group, ChangeKind::Deleted).expect("translate"),
                Some(VaultEvent::Deleted { path: group.clone(), kind: Some(EntityKind::Group) })
            );

            config.areas_dir = config.groups_dir.clone();
            let shared = ChangeTranslator::new(config);
            assert_eq!(
                shared.translate(&group, ChangeKind::Deleted).expect("translate"),
                Some(VaultEvent::Deleted { path: group, kind: None })
            );
        }

        #[test]
        fn archive_events_need_opting_in() {
            let (_dir, config) = setup();
            let path = config.archive_path().join("old.md");
            fs::write(&path, ITEM).expect("write");
            let translator = ChangeTranslator::new(config).include_archived(true);
            let event = translator.translate(&path, ChangeKind::Modified).expect("translate");
            assert_eq!(event.map(|e| e.path().to_path_buf()), Some(path));
        }

        #[test]
        fn shared_directories_use_the_marker() {
            let (_dir, mut config) = setup();
            config.areas_dir = config.groups_dir.clone();
            let marked = config.groups_dir.join("home.md");
            fs::write(&marked, "---\ntitle: Home\nkind: area\n---\n").expect("write");
            let unmarked = config.groups_dir.join("loose.md");
            fs::write(&unmarked, "---\ntitle: Loose\n---\n").expect("write");

            let translator = ChangeTranslator::new(config);
            let event = translator.translate(&marked, ChangeKind::Created).expect("translate");
            assert!(matches!(
                event,
                Some(VaultEvent::Created { entity: AnyEntity::Area(_) })
            ));
            assert_eq!(translator.translate(&unmarked, ChangeKind::Created).expect("translate"), None);
        }

        #[test]
        fn translator_follows_the_session_on_marked_directories() {
            let (_dir, config) = setup();
            let marked = config.groups_dir.join("a.md");
            fs::write(&marked, "---\ntitle: A\nkind: group\n---\n").expect("write");
            let loose = config.groups_dir.join("loose.md");
            fs::write(&loose, "---\ntitle: Loose\n---\n").expect("write");

            let session = Session::open(config.clone(), ScanOptions::default()).expect("session");
            let loaded: Vec<&Path> = session.groups().iter().map(|g| g.path.as_path()).collect();
            assert_eq!(loaded, [marked.as_path()]);

            let translator = ChangeTranslator::new(config.clone());
            assert!(translator.translate(&marked, ChangeKind::Modified).expect("translate").is_some());
            assert_eq!(translator.translate(&loose, ChangeKind::Modified).expect("translate"), None);

            // without any marker the directory keeps every file again
            fs::remove_file(&marked).expect("remove");
            assert!(translator.translate(&loose, ChangeKind::Modified).expect("translate").is_some());
            let session = Session::open(config, ScanOptions::default()).expect("session");
            assert_eq!(session.groups().len(), 1);
        }

        #[test]
        fn invalid_files_surface_errors() {
            let (_dir, config) = setup();
            let path = config.items_dir.join("bad.md");
            fs::write(&path, "---\ntitle: t\n---\n").expect("write");
            let err = ChangeTranslator::new(config)
                .translate(&path, ChangeKind::Modified)
                .expect_err("missing fields");
            assert!(matches!(err, VaultError::MissingField { .. }));
        }
    }
}

pub use codec::Document;
pub use config::VaultConfig;
pub use error::{Result, VaultError};
pub use events::{ChangeKind, ChangeTranslator, VaultEvent};
pub use filter::{AreaFilter, DateRange, Filter, GroupFilter, ItemFilter};
pub use model::{AnyEntity, Area, AreaStatus, Entity, EntityKind, Group, GroupStatus, Item, ItemStatus, Validated, Warning};
pub use mutation::{BatchResult, Clock, FieldUpdate, ItemUpdate, Vault};
pub use session::{ScanOptions, Session};
pub use values::{DateValue, Reference};
