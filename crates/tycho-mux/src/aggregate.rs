//! Stream buffer summarization.
//!
//! # Purpose
//! Consumers draining a stream faster than they can render collapse a buffer
//! into one point: numeric domains get mean/min/max, discrete domains get the
//! most frequent rendering plus a stable per-value color derived from an MD5
//! hash of the text.

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tycho_client::types::{ParameterValue, Value};

/// Buffers at or below this length are emitted point by point.
pub const STREAM_AVERAGE_THRESHOLD: usize = 3;

pub fn should_aggregate(buffered: usize) -> bool {
    buffered > STREAM_AVERAGE_THRESHOLD
}

/// One collapsed numeric bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedPoint {
    pub time: DateTime<Utc>,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

/// Collapsed discrete bucket: the dominant rendering and its color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscretePoint {
    pub time: DateTime<Utc>,
    pub value: String,
    pub color: String,
}

/// Component of an engineering value addressed by a dotted path such as
/// `sensors[2].temperature`. Member names match case-insensitively; a miss
/// at any step yields a zero integer so mixed telemetry keeps flowing.
pub fn component_value(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in split_path(path) {
        let next = match segment {
            Segment::Member(member) => match current {
                Value::Aggregate { name, value } => name
                    .iter()
                    .position(|n| n.eq_ignore_ascii_case(member))
                    .and_then(|index| value.get(index)),
                _ => None,
            },
            Segment::Index(index) => match current {
                Value::Array { value } => value.get(index),
                _ => None,
            },
        };
        match next {
            Some(next) => current = next,
            None => return Value::Sint64 { value: 0 },
        }
    }
    current.clone()
}

enum Segment<'a> {
    Member(&'a str),
    Index(usize),
}

fn split_path(path: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    for part in path.split('.').filter(|part| !part.is_empty()) {
        let mut rest = part;
        if let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(Segment::Member(&rest[..bracket]));
            }
            rest = &rest[bracket..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let Some(close) = stripped.find(']') else {
                    break;
                };
                if let Ok(index) = stripped[..close].parse() {
                    segments.push(Segment::Index(index));
                }
                rest = &stripped[close + 1..];
            }
        } else {
            segments.push(Segment::Member(rest));
        }
    }
    segments
}

fn point_time(buffer: &[ParameterValue]) -> DateTime<Utc> {
    buffer
        .last()
        .and_then(|value| value.generation_time)
        .unwrap_or_else(Utc::now)
}

/// Mean/min/max over the numeric component at `path`. Components without a
/// numeric view count as zero.
pub fn numeric_summary(buffer: &[ParameterValue], path: &str) -> Option<AggregatedPoint> {
    if buffer.is_empty() {
        return None;
    }
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for value in buffer {
        let number = value
            .eng_value
            .as_ref()
            .map(|eng| component_value(eng, path))
            .and_then(|component| component.as_f64())
            .unwrap_or(0.0);
        sum += number;
        min = min.min(number);
        max = max.max(number);
    }
    Some(AggregatedPoint {
        time: point_time(buffer),
        avg: sum / buffer.len() as f64,
        min,
        max,
        count: buffer.len(),
    })
}

/// Dominant rendering of the discrete component at `path`, colored by its
/// text hash.
pub fn discrete_summary(buffer: &[ParameterValue], path: &str) -> Option<DiscretePoint> {
    let renderings: Vec<String> = buffer
        .iter()
        .filter_map(|value| value.eng_value.as_ref())
        .map(|eng| component_value(eng, path).display_string())
        .collect();
    let value = most_frequent(&renderings)?.to_string();
    let color = hash_to_rgb(&value);
    Some(DiscretePoint {
        time: point_time(buffer),
        value,
        color,
    })
}

/// Most frequent entry; ties resolve to the one seen first.
pub fn most_frequent(values: &[String]) -> Option<&str> {
    let mut best: Option<&str> = None;
    let mut best_count = 0usize;
    for value in values {
        let count = values.iter().filter(|other| *other == value).count();
        if count > best_count {
            best = Some(value);
            best_count = count;
        }
    }
    best
}

/// Stable `#RRGGBB` color for a piece of text. The hue comes from the first
/// four MD5 bytes, saturation and lightness are fixed.
pub fn hash_to_rgb(text: &str) -> String {
    let digest = Md5::digest(text.as_bytes());
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let hue = (hash % 360) as f64;
    let (r, g, b) = hsl_to_rgb(hue, 70.0, 50.0);
    format!("#{r:02X}{g:02X}{b:02X}")
}

fn hsl_to_rgb(h: f64, s: f64, l: f64) -> (u8, u8, u8) {
    let s = s / 100.0;
    let l = l / 100.0;
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = l - c / 2.0;
    let (r, g, b) = match h as u32 {
        0..=59 => (c, x, 0.0),
        60..=119 => (x, c, 0.0),
        120..=179 => (0.0, c, x),
        180..=239 => (0.0, x, c),
        240..=299 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    )
}
