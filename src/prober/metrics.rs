//! Parsing of the Prometheus text exposition format returned by the prober.

use std::collections::HashMap;

use super::ProberError;

/// One sample line: `name{label="value",...} value [timestamp]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
}

impl Sample {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// Parse every sample in `body`, skipping comments and blank lines.
pub fn parse_samples(body: &str) -> Result<Vec<Sample>, ProberError> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Result<Sample, ProberError> {
    let malformed = |what: &str| ProberError::Malformed(format!("{}: {:?}", what, line));

    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or_else(|| malformed("missing sample value"))?;
    let name = &line[..name_end];
    if name.is_empty() {
        return Err(malformed("missing metric name"));
    }

    let mut rest = &line[name_end..];
    let mut labels = HashMap::new();
    if let Some(body) = rest.strip_prefix('{') {
        let (parsed, remainder) = parse_labels(body).ok_or_else(|| malformed("bad label set"))?;
        labels = parsed;
        rest = remainder;
    }

    let value = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| malformed("missing sample value"))?;
    let value = parse_value(value).ok_or_else(|| malformed("bad sample value"))?;

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
    })
}

/// Parse `k="v",...}` and return the labels plus the text after `}`.
fn parse_labels(input: &str) -> Option<(HashMap<String, String>, &str)> {
    let mut labels = HashMap::new();
    let mut rest = input.trim_start();

    loop {
        if let Some(after) = rest.strip_prefix('}') {
            return Some((labels, after));
        }

        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        if key.is_empty() {
            return None;
        }
        rest = rest[eq + 1..].trim_start().strip_prefix('"')?;

        let mut value = String::new();
        let mut chars = rest.char_indices();
        let end = loop {
            let (i, c) = chars.next()?;
            match c {
                '"' => break i,
                '\\' => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                c => value.push(c),
            }
        };
        labels.insert(key.to_string(), value);

        rest = rest[end + 1..].trim_start();
        if let Some(after) = rest.strip_prefix(',') {
            rest = after.trim_start();
        }
    }
}

fn parse_value(value: &str) -> Option<f64> {
    match value {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}
