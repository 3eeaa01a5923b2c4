// src/resources.rs
//
// =============================================================================
// REPX-LAB: RESOURCE HINTS
// =============================================================================
//
// Scheduler hints attached to jobs.
//
// Responsibilities:
// 1. Parse author-facing strings ("4G", "01:30:00") into integers.
// 2. Merge hints: mem/cpus/time take the maximum, partition and extra
//    scheduler options are last-writer-wins.
// 3. Render hints back into the scheduler form the execution engine reads.

use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const KIB: u64 = 1024;

// ============================================================================
// 1. DATA STRUCTURES
// ============================================================================

/// Normalised resource hint. `mem` is in bytes, `time` in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_opts: Option<Vec<String>>,
}

/// Resource hint as written in a stage or run declaration.
///
/// `mem`, `cpus` and `time` accept either strings or integers so that
/// templated values (`"{threads}"`) survive substitution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDecl {
    #[serde(default)]
    pub mem: Option<Value>,
    #[serde(default)]
    pub cpus: Option<Value>,
    #[serde(default)]
    pub time: Option<Value>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default, alias = "sbatch_opts", alias = "extraOpts")]
    pub extra_opts: Option<Vec<String>>,
}

impl ResourceDecl {
    /// Parses every field; a malformed string is a validation error on `subject`.
    pub fn parse(&self, subject: &str) -> Result<ResourceHint> {
        let mem = match &self.mem {
            None => None,
            Some(Value::Number(n)) => Some(n.as_u64().ok_or_else(|| {
                BuildError::validation(subject, format!("invalid memory hint '{n}'"))
            })?),
            Some(Value::String(s)) => Some(parse_mem(s).map_err(|e| BuildError::validation(subject, e))?),
            Some(other) => {
                return Err(BuildError::validation(
                    subject,
                    format!("memory hint must be a string or integer, got {other}"),
                ))
            }
        };

        let cpus = match &self.cpus {
            None => None,
            Some(v) => Some(parse_cpus(v).map_err(|e| BuildError::validation(subject, e))?),
        };

        let time = match &self.time {
            None => None,
            Some(Value::Number(n)) => Some(n.as_u64().ok_or_else(|| {
                BuildError::validation(subject, format!("invalid time hint '{n}'"))
            })?),
            Some(Value::String(s)) => Some(parse_time(s).map_err(|e| BuildError::validation(subject, e))?),
            Some(other) => {
                return Err(BuildError::validation(
                    subject,
                    format!("time hint must be a string or integer, got {other}"),
                ))
            }
        };

        Ok(ResourceHint {
            mem,
            cpus,
            time,
            partition: self.partition.clone(),
            extra_opts: self.extra_opts.clone(),
        })
    }
}

// ============================================================================
// 2. PARSING
// ============================================================================

/// `<int>[K|M|G|T]`, binary multipliers, no unit means bytes.
pub fn parse_mem(raw: &str) -> std::result::Result<u64, String> {
    let s = raw.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let mult = match c.to_ascii_uppercase() {
                'K' => KIB,
                'M' => KIB.pow(2),
                'G' => KIB.pow(3),
                'T' => KIB.pow(4),
                _ => return Err(format!("invalid memory unit '{c}' in '{raw}' (expected K, M, G or T)")),
            };
            (&s[..s.len() - 1], mult)
        }
        _ => (s, 1),
    };

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("invalid memory hint '{raw}' (expected e.g. '512M' or '4G')"));
    }

    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid memory hint '{raw}': {e}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("memory hint '{raw}' overflows"))
}

/// `HH:MM:SS`, `MM:SS`, `D-HH:MM:SS` or raw seconds.
pub fn parse_time(raw: &str) -> std::result::Result<u64, String> {
    let s = raw.trim();
    let bad = || format!("invalid time hint '{raw}' (expected HH:MM:SS, MM:SS or seconds)");

    let (days, clock) = match s.split_once('-') {
        Some((d, rest)) => (parse_component(d).ok_or_else(bad)?, rest),
        None => (0, s),
    };

    let parts: Vec<&str> = clock.split(':').collect();
    let (h, m, sec) = match parts.as_slice() {
        [sec] if days == 0 => (0, 0, parse_component(sec).ok_or_else(bad)?),
        [m, sec] => (0, parse_component(m).ok_or_else(bad)?, parse_component(sec).ok_or_else(bad)?),
        [h, m, sec] => (
            parse_component(h).ok_or_else(bad)?,
            parse_component(m).ok_or_else(bad)?,
            parse_component(sec).ok_or_else(bad)?,
        ),
        _ => return Err(bad()),
    };

    days.checked_mul(86_400)
        .and_then(|t| h.checked_mul(3_600).and_then(|x| t.checked_add(x)))
        .and_then(|t| m.checked_mul(60).and_then(|x| t.checked_add(x)))
        .and_then(|t| t.checked_add(sec))
        .ok_or_else(|| format!("time hint '{raw}' overflows"))
}

fn parse_component(s: &str) -> Option<u64> {
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_cpus(v: &Value) -> std::result::Result<u32, String> {
    let n = match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    n.and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
        .ok_or_else(|| format!("invalid cpus hint {v} (expected a positive integer)"))
}

// ============================================================================
// 3. MERGING
// ============================================================================

/// Combines two hints. Numeric fields keep the larger value (an absent value
/// never wins), partition/extra options prefer `b` and fall back to `a`.
pub fn merge(a: &ResourceHint, b: &ResourceHint) -> ResourceHint {
    ResourceHint {
        mem: max_opt(a.mem, b.mem),
        cpus: max_opt(a.cpus, b.cpus),
        time: max_opt(a.time, b.time),
        partition: b.partition.clone().or_else(|| a.partition.clone()),
        extra_opts: b.extra_opts.clone().or_else(|| a.extra_opts.clone()),
    }
}

/// Folds `upstream` in order, then `own` last so its partition/extra options
/// take final precedence.
pub fn merge_all<'a, I>(upstream: I, own: &ResourceHint) -> ResourceHint
where
    I: IntoIterator<Item = &'a ResourceHint>,
{
    let folded = upstream
        .into_iter()
        .fold(ResourceHint::default(), |acc, h| merge(&acc, h));
    merge(&folded, own)
}

fn max_opt<T: Ord + Copy>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

// ============================================================================
// 4. SCHEDULER FORM
// ============================================================================

/// Largest unit that represents the value exactly: 4294967296 -> "4G".
pub fn format_mem(bytes: u64) -> String {
    for (suffix, unit) in [("T", KIB.pow(4)), ("G", KIB.pow(3)), ("M", KIB.pow(2)), ("K", KIB)] {
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

pub fn format_time(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3_600,
        (seconds % 3_600) / 60,
        seconds % 60
    )
}

impl ResourceHint {
    pub fn is_empty(&self) -> bool {
        *self == ResourceHint::default()
    }

    /// `{mem, cpus, time, partition, sbatch_opts}` or `None` when nothing is set.
    pub fn to_metadata(&self) -> Option<Value> {
        if self.is_empty() {
            return None;
        }
        let mut out = Map::new();
        if let Some(mem) = self.mem {
            out.insert("mem".into(), Value::String(format_mem(mem)));
        }
        if let Some(cpus) = self.cpus {
            out.insert("cpus".into(), Value::from(cpus));
        }
        if let Some(time) = self.time {
            out.insert("time".into(), Value::String(format_time(time)));
        }
        if let Some(p) = &self.partition {
            out.insert("partition".into(), Value::String(p.clone()));
        }
        if let Some(opts) = &self.extra_opts {
            out.insert(
                "sbatch_opts".into(),
                Value::Array(opts.iter().cloned().map(Value::String).collect()),
            );
        }
        Some(Value::Object(out))
    }
}
