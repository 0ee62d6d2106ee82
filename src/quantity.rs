//! Kubernetes resource quantity arithmetic.
//!
//! Only the subset the governance policy needs: CPU in millicores and memory
//! in bytes, compared by value so `1` and `1000m` are the same limit.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const BINARY_SUFFIXES: [(&str, i128); 6] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: [(&str, i128); 6] = [
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

pub const MIB: i64 = 1 << 20;
pub const GIB: i64 = 1 << 30;

/// Split "12.5Gi" into ("12.5", "Gi").
///
/// An `e`/`E` followed by a digit or sign is a decimal exponent ("1e3");
/// otherwise it starts the exa suffix ("1E", "1Ei").
fn split_suffix(raw: &str) -> (&str, &str) {
    let raw = raw.trim();
    let bytes = raw.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        let c = bytes[idx];
        if c.is_ascii_alphabetic() {
            let exponent = idx > 0
                && (c == b'e' || c == b'E')
                && bytes
                    .get(idx + 1)
                    .is_some_and(|n| n.is_ascii_digit() || *n == b'+' || *n == b'-');
            if !exponent {
                break;
            }
        }
        idx += 1;
    }
    raw.split_at(idx)
}

/// Parse a plain decimal ("1", "0.25", "1e3") into a value scaled by `scale`.
fn scaled_decimal(number: &str, scale: i128) -> Option<i128> {
    if number.is_empty() {
        return None;
    }
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * scale as f64).round() as i128)
}

/// Parse a CPU quantity into millicores.
pub fn parse_cpu_millis(raw: &str) -> Option<i64> {
    let (number, suffix) = split_suffix(raw);
    let millis = match suffix {
        "" => scaled_decimal(number, 1_000)?,
        "m" => scaled_decimal(number, 1)?,
        "u" => scaled_decimal(number, 1)? / 1_000,
        "n" => scaled_decimal(number, 1)? / 1_000_000,
        other => {
            let factor = DECIMAL_SUFFIXES
                .iter()
                .find(|(s, _)| *s == other)
                .map(|(_, f)| *f)?;
            scaled_decimal(number, factor * 1_000)?
        }
    };
    i64::try_from(millis).ok()
}

/// Parse a memory quantity into bytes.
pub fn parse_bytes(raw: &str) -> Option<i64> {
    let (number, suffix) = split_suffix(raw);
    let bytes = match suffix {
        "" => scaled_decimal(number, 1)?,
        "m" => scaled_decimal(number, 1)? / 1_000,
        other => {
            let factor = BINARY_SUFFIXES
                .iter()
                .chain(DECIMAL_SUFFIXES.iter())
                .find(|(s, _)| *s == other)
                .map(|(_, f)| *f)?;
            scaled_decimal(number, factor)?
        }
    };
    i64::try_from(bytes).ok()
}

/// Canonical CPU quantity: whole cores when exact, millicores otherwise.
pub fn format_cpu(millis: i64) -> String {
    if millis % 1_000 == 0 {
        format!("{}", millis / 1_000)
    } else {
        format!("{}m", millis)
    }
}

/// Canonical memory quantity using the largest exact binary suffix.
pub fn format_memory(bytes: i64) -> String {
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, factor) in BINARY_SUFFIXES.iter().rev() {
        let factor = *factor as i64;
        if bytes % factor == 0 {
            return format!("{}{}", bytes / factor, suffix);
        }
    }
    bytes.to_string()
}

/// CPU and memory pair used for both limits and requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceAmounts {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

impl ResourceAmounts {
    pub const ZERO: ResourceAmounts = ResourceAmounts {
        cpu_millis: 0,
        memory_bytes: 0,
    };

    pub fn new(cpu_millis: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0
    }

    pub fn scaled(&self, factor: i64) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_mul(factor),
            memory_bytes: self.memory_bytes.saturating_mul(factor),
        }
    }

    pub fn cpu_quantity(&self) -> Quantity {
        Quantity(format_cpu(self.cpu_millis))
    }

    pub fn memory_quantity(&self) -> Quantity {
        Quantity(format_memory(self.memory_bytes))
    }
}

/// True when `existing` parses to the same CPU value as `millis`.
pub fn cpu_equals(existing: Option<&Quantity>, millis: i64) -> bool {
    existing
        .and_then(|q| parse_cpu_millis(&q.0))
        .is_some_and(|v| v == millis)
}

/// True when `existing` parses to the same memory value as `bytes`.
pub fn memory_equals(existing: Option<&Quantity>, bytes: i64) -> bool {
    existing
        .and_then(|q| parse_bytes(&q.0))
        .is_some_and(|v| v == bytes)
}
