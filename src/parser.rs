//! Parser for the line-oriented metrics exposition format.
//!
//! Each data line has the shape `name{key="value",...} value`. Comment lines
//! (`# HELP`, `# TYPE`, ...) and blank lines are skipped. A line that does not
//! match the grammar is dropped on its own; it never fails the whole document,
//! so one bad line from a third-party exporter costs exactly one sample.

use std::collections::BTreeMap;
use std::fmt;

/// Label set attached to a sample.
pub type Labels = BTreeMap<String, String>;

/// A single parsed data point.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub value: f64,
    pub labels: Labels,
}

impl Sample {
    /// Returns the value of label `key`, if present.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Renders the sample back into exposition format.
impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.labels.is_empty() {
            f.write_str("{")?;
            for (i, (key, value)) in self.labels.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}=\"{}\"", key, escape_label_value(value))?;
            }
            f.write_str("}")?;
        }
        write!(f, " {}", format_value(self.value))
    }
}

/// All samples from one scrape, in document order.
///
/// No deduplication is done: when the same name and labels appear twice,
/// lookups return the first occurrence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleSet {
    samples: Vec<Sample>,
}

impl SampleSet {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// Returns all samples named `name`.
    pub fn metrics_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Sample> + 'a {
        self.samples.iter().filter(move |s| s.name == name)
    }

    /// Returns the value of the first sample named `name`.
    pub fn metric_value(&self, name: &str) -> Option<f64> {
        self.metrics_by_name(name).next().map(|s| s.value)
    }

    /// Returns the value of the first sample named `name` whose labels contain
    /// every `(key, value)` pair in `labels`.
    pub fn metric_value_matching(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.metrics_by_name(name)
            .find(|s| labels.iter().all(|(k, v)| s.label(k) == Some(*v)))
            .map(|s| s.value)
    }

    /// Returns `(labels, value)` for every sample named `name`.
    pub fn all_values<'a>(&'a self, name: &'a str) -> Vec<(&'a Labels, f64)> {
        self.metrics_by_name(name)
            .map(|s| (&s.labels, s.value))
            .collect()
    }
}

impl IntoIterator for SampleSet {
    type Item = Sample;
    type IntoIter = std::vec::IntoIter<Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.into_iter()
    }
}

/// Parses an exposition-format document.
pub fn parse_exposition(text: &str) -> SampleSet {
    let samples = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_line)
        .collect();
    SampleSet::new(samples)
}

/// Parses a single data line. Returns `None` if it does not match the grammar.
pub fn parse_line(line: &str) -> Option<Sample> {
    let line = line.trim();
    let name_len = metric_name_len(line)?;
    let name = &line[..name_len];
    let mut rest = &line[name_len..];

    let labels = if let Some(after_brace) = rest.strip_prefix('{') {
        let (labels, consumed) = parse_labels(after_brace)?;
        rest = &after_brace[consumed..];
        labels
    } else {
        Labels::new()
    };

    // The value must be separated from the name/labels by whitespace and be
    // the last token on the line.
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let value = parse_value(rest.trim())?;

    Some(Sample {
        name: name.to_string(),
        value,
        labels,
    })
}

/// Parses a sample value: a float literal, `+Inf`/`Inf`, `-Inf` or `NaN`.
pub fn parse_value(s: &str) -> Option<f64> {
    match s {
        "+Inf" | "Inf" => return Some(f64::INFINITY),
        "-Inf" => return Some(f64::NEG_INFINITY),
        "NaN" => return Some(f64::NAN),
        _ => {}
    }

    // `f64::from_str` also accepts spellings like "inf" or "infinity" that
    // are not part of the format, so restrict the alphabet first.
    let valid_chars = s
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !valid_chars || !s.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Length of the metric name prefix `[A-Za-z_:][A-Za-z0-9_:]*`, if any.
fn metric_name_len(line: &str) -> Option<usize> {
    let mut chars = line.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return None,
    }
    let end = chars
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_' || *c == ':'))
        .map(|(i, _)| i)
        .unwrap_or(line.len());
    Some(end)
}

/// Parses `key="value",...}` (the opening brace already consumed).
///
/// Returns the labels and the number of bytes consumed including the closing
/// brace.
fn parse_labels(input: &str) -> Option<(Labels, usize)> {
    let bytes = input.as_bytes();
    let mut labels = Labels::new();
    let mut pos = 0;

    loop {
        while pos < bytes.len() && (bytes[pos] == b',' || bytes[pos].is_ascii_whitespace()) {
            pos += 1;
        }
        match bytes.get(pos) {
            None => return None,
            Some(b'}') => return Some((labels, pos + 1)),
            Some(_) => {}
        }

        let key_start = pos;
        match bytes.get(pos) {
            Some(c) if c.is_ascii_alphabetic() || *c == b'_' => pos += 1,
            _ => return None,
        }
        while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
            pos += 1;
        }
        let key = &input[key_start..pos];

        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if bytes.get(pos) != Some(&b'=') {
            return None;
        }
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if bytes.get(pos) != Some(&b'"') {
            return None;
        }
        pos += 1;

        let (value, consumed) = parse_quoted(&input[pos..])?;
        pos += consumed;
        labels.insert(key.to_string(), value);
    }
}

/// Reads a quoted label value up to the closing quote, unescaping `\"`, `\\`
/// and `\n`. Returns the value and bytes consumed including the closing quote.
fn parse_quoted(input: &str) -> Option<(String, usize)> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((value, i + 1)),
            '\\' => match chars.next() {
                Some((_, '"')) => value.push('"'),
                Some((_, '\\')) => value.push('\\'),
                Some((_, 'n')) => value.push('\n'),
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => return None,
            },
            _ => value.push(c),
        }
    }
    None
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}
