use serde::{Deserialize, Serialize};

/// Column/value data types understood by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int64,
    Uint128,
    Float64,
    String,
    Time64Ns,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int64 => "INT64",
            DataType::Uint128 => "UINT128",
            DataType::Float64 => "FLOAT64",
            DataType::String => "STRING",
            DataType::Time64Ns => "TIME64NS",
        };
        write!(f, "{name}")
    }
}

/// Well-known semantic tags carried alongside data types.
///
/// `Upid` and `AgentUid` drive UDTF placement filters; the rest mark
/// metadata-derived columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SemanticType {
    #[default]
    None,
    Upid,
    AgentUid,
    PodName,
    ServiceName,
}

/// Literal values representable at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Boolean(bool),
    Int64(i64),
    Uint128(u128),
    Float64(f64),
    String(String),
    /// Nanoseconds since the epoch.
    Time64Ns(i64),
}

impl LiteralValue {
    pub fn data_type(&self) -> DataType {
        match self {
            LiteralValue::Boolean(_) => DataType::Boolean,
            LiteralValue::Int64(_) => DataType::Int64,
            LiteralValue::Uint128(_) => DataType::Uint128,
            LiteralValue::Float64(_) => DataType::Float64,
            LiteralValue::String(_) => DataType::String,
            LiteralValue::Time64Ns(_) => DataType::Time64Ns,
        }
    }
}

impl From<i64> for LiteralValue {
    fn from(v: i64) -> Self {
        LiteralValue::Int64(v)
    }
}

impl From<f64> for LiteralValue {
    fn from(v: f64) -> Self {
        LiteralValue::Float64(v)
    }
}

impl From<bool> for LiteralValue {
    fn from(v: bool) -> Self {
        LiteralValue::Boolean(v)
    }
}

impl From<&str> for LiteralValue {
    fn from(v: &str) -> Self {
        LiteralValue::String(v.to_string())
    }
}

impl std::fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiteralValue::Boolean(v) => write!(f, "{v}"),
            LiteralValue::Int64(v) => write!(f, "{v}"),
            LiteralValue::Uint128(v) => write!(f, "{v}"),
            LiteralValue::Float64(v) => write!(f, "{v}"),
            LiteralValue::String(v) => write!(f, "'{v}'"),
            LiteralValue::Time64Ns(v) => write!(f, "{v}ns"),
        }
    }
}

/// Parse a human time string (`-30s`, `1h`, `500ms`, `2m`) into signed
/// nanoseconds.
///
/// Returns `None` when the string is not a recognized duration.
pub fn parse_duration_ns(s: &str) -> Option<i64> {
    let trimmed = s.trim();
    let (sign, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, trimmed),
    };
    let unit_start = rest.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = rest.split_at(unit_start);
    if digits.is_empty() {
        return None;
    }
    let value: i64 = digits.parse().ok()?;
    let ns_per_unit: i64 = match unit {
        "ns" => 1,
        "us" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        "h" => 3_600 * 1_000_000_000,
        "d" => 24 * 3_600 * 1_000_000_000,
        _ => return None,
    };
    Some(sign * value * ns_per_unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration_ns("-30s"), Some(-30_000_000_000));
        assert_eq!(parse_duration_ns("1h"), Some(3_600_000_000_000));
        assert_eq!(parse_duration_ns("500ms"), Some(500_000_000));
        assert_eq!(parse_duration_ns("2m"), Some(120_000_000_000));
        assert_eq!(parse_duration_ns("abc"), None);
        assert_eq!(parse_duration_ns("10"), None);
        assert_eq!(parse_duration_ns("10x"), None);
    }

    #[test]
    fn literal_types() {
        assert_eq!(LiteralValue::Int64(1).data_type(), DataType::Int64);
        assert_eq!(
            LiteralValue::String("a".to_string()).data_type(),
            DataType::String
        );
    }
}
