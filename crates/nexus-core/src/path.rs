//! Resource path codec (spec §4.A, wire format in §6).
//!
//! Grammar: `^(?<catalog>(/[A-Za-z_][A-Za-z_0-9]*)+)/(?<resource>[A-Za-z_][A-Za-z_0-9]*)/` +
//! `(?<period>\d+_(ns|us|ms|s|min|h|d))(?:_(?<kind>[a-z_]+))?(?:\((?<params>.*)\))?` +
//! `(?:#base=(?<base>\d+_(ns|us|ms|s|min|h|d)))?$`
//!
//! Hand-rolled rather than built on `regex`: the grammar is a handful of anchored, mutually
//! exclusive literal delimiters (`/`, `(`, `)`, `#base=`), not a pattern language problem.

use crate::error::{NexusError, NexusResult};
use indexmap::IndexMap;

const UNITS: [&str; 7] = ["ns", "us", "ms", "s", "min", "h", "d"];
/// Nanoseconds per unit, in the same order as `UNITS`.
const UNIT_NANOS: [u64; 7] = [1, 1_000, 1_000_000, 1_000_000_000, 60_000_000_000, 3_600_000_000_000, 86_400_000_000_000];
/// Quotients used when rendering a period in its largest exact unit (spec 4.A).
const RENDER_QUOTIENTS: [u64; 7] = [1_000, 1_000, 1_000, 60, 60, 24, 1];

/// A sample period, stored as a whole number of 100-nanosecond ticks (glossary: "Sample
/// period ... always an integer number of 100-ns ticks").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeriodTicks(pub u64);

impl PeriodTicks {
    pub fn nanos(self) -> u64 {
        self.0.saturating_mul(100)
    }

    /// Parse a `"<digits>_<unit>"` token, e.g. `"10_min"`, `"1_s"`.
    pub fn parse(token: &str) -> NexusResult<Self> {
        let (digits, unit) = token
            .split_once('_')
            .ok_or_else(|| NexusError::InvalidPath(format!("malformed period token: {token}")))?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NexusError::InvalidPath(format!("malformed period digits: {digits}")));
        }
        let count: u64 = digits
            .parse()
            .map_err(|_| NexusError::InvalidPath(format!("period value out of range: {digits}")))?;
        let unit_idx = UNITS
            .iter()
            .position(|u| *u == unit)
            .ok_or_else(|| NexusError::InvalidPath(format!("unknown period unit: {unit}")))?;
        let total_nanos = count
            .checked_mul(UNIT_NANOS[unit_idx])
            .ok_or_else(|| NexusError::InvalidPath(format!("period overflows: {token}")))?;
        if total_nanos % 100 != 0 {
            return Err(NexusError::InvalidPath(format!(
                "period {token} is not a multiple of 100ns"
            )));
        }
        Ok(PeriodTicks(total_nanos / 100))
    }

    /// Render in the largest unit that yields an integer, per spec 4.A.
    pub fn render(self) -> String {
        let mut value = self.nanos();
        let mut unit_idx = 0usize;
        while unit_idx < RENDER_QUOTIENTS.len() - 1 {
            let q = RENDER_QUOTIENTS[unit_idx];
            if value % q == 0 {
                value /= q;
                unit_idx += 1;
            } else {
                break;
            }
        }
        format!("{}_{}", value, UNITS[unit_idx])
    }
}

/// A fully parsed resource path, per the wire-format grammar in spec §6.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePath {
    pub catalog_id: String,
    pub resource_id: String,
    pub period: PeriodTicks,
    /// `None` means the representation is `Original`.
    pub kind: Option<String>,
    pub parameters: Option<IndexMap<String, String>>,
    pub base_period: Option<PeriodTicks>,
}

fn validate_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_params(raw: &str) -> IndexMap<String, String> {
    let mut map = IndexMap::new();
    if raw.is_empty() {
        return map;
    }
    for pair in raw.split(',') {
        if let Some((k, v)) = pair.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        } else {
            map.insert(pair.trim().to_string(), String::new());
        }
    }
    map
}

impl ResourcePath {
    /// Parse per the wire-format grammar. Fails with `NexusError::InvalidPath` on any
    /// grammar violation.
    pub fn parse(path: &str) -> NexusResult<Self> {
        let mut rest = path;

        let base_period = if let Some(pos) = rest.rfind("#base=") {
            let base_token = &rest[pos + "#base=".len()..];
            rest = &rest[..pos];
            Some(PeriodTicks::parse(base_token)?)
        } else {
            None
        };

        let parameters = if rest.ends_with(')') {
            let open = rest
                .rfind('(')
                .ok_or_else(|| NexusError::InvalidPath(format!("unbalanced parens in: {path}")))?;
            let params_raw = &rest[open + 1..rest.len() - 1];
            let parsed = parse_params(params_raw);
            rest = &rest[..open];
            Some(parsed)
        } else {
            None
        };

        if !rest.starts_with('/') {
            return Err(NexusError::InvalidPath(format!("path must be rooted: {path}")));
        }
        let segments: Vec<&str> = rest.split('/').skip(1).collect();
        if segments.len() < 3 {
            return Err(NexusError::InvalidPath(format!(
                "path must have at least catalog/resource/period segments: {path}"
            )));
        }

        let period_kind_segment = segments[segments.len() - 1];
        let resource_segment = segments[segments.len() - 2];
        let catalog_segments = &segments[..segments.len() - 2];

        if catalog_segments.is_empty() || !catalog_segments.iter().all(|s| validate_identifier(s)) {
            return Err(NexusError::InvalidPath(format!("invalid catalog id in: {path}")));
        }
        if !validate_identifier(resource_segment) {
            return Err(NexusError::InvalidPath(format!("invalid resource id: {resource_segment}")));
        }

        let tokens: Vec<&str> = period_kind_segment.split('_').collect();
        if tokens.len() < 2 {
            return Err(NexusError::InvalidPath(format!(
                "malformed period/kind segment: {period_kind_segment}"
            )));
        }
        let period_token = format!("{}_{}", tokens[0], tokens[1]);
        let period = PeriodTicks::parse(&period_token)?;
        let kind = if tokens.len() > 2 {
            Some(tokens[2..].join("_"))
        } else {
            None
        };

        let catalog_id = format!("/{}", catalog_segments.join("/"));

        Ok(ResourcePath {
            catalog_id,
            resource_id: resource_segment.to_string(),
            period,
            kind,
            parameters,
            base_period,
        })
    }

    /// Render back to the canonical wire format. Inverse of `parse` for every path that
    /// round-trips (spec §8: `render(parse(q)) == q` for well-formed `q`).
    pub fn render(&self) -> String {
        let mut out = format!("{}/{}/{}", self.catalog_id, self.resource_id, self.period.render());
        if let Some(kind) = &self.kind {
            out.push('_');
            out.push_str(kind);
        }
        if let Some(params) = &self.parameters {
            out.push('(');
            let rendered: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
            out.push_str(&rendered.join(","));
            out.push(')');
        }
        if let Some(base) = self.base_period {
            out.push_str("#base=");
            out.push_str(&base.render());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_round_trip_common_units() {
        for (ticks, rendered) in [
            (1u64, "100_ns"),
            (10, "1_us"),
            (10_000, "1_ms"),
            (10_000_000, "1_s"),
            (600_000_000, "1_min"),
            (36_000_000_000, "1_h"),
            (864_000_000_000, "1_d"),
        ] {
            let p = PeriodTicks(ticks);
            assert_eq!(p.render(), rendered);
            assert_eq!(PeriodTicks::parse(rendered).unwrap(), p);
        }
    }

    #[test]
    fn period_rejects_non_multiple_of_100ns() {
        assert!(PeriodTicks::parse("50_ns").is_err());
    }

    #[test]
    fn path_parses_simple_original() {
        let p = ResourcePath::parse("/building/temperature/1_s").unwrap();
        assert_eq!(p.catalog_id, "/building");
        assert_eq!(p.resource_id, "temperature");
        assert_eq!(p.period, PeriodTicks(10_000_000));
        assert_eq!(p.kind, None);
        assert_eq!(p.render(), "/building/temperature/1_s");
    }

    #[test]
    fn path_parses_aggregation_with_base_and_kind() {
        let raw = "/building/wing_a/temperature/10_min_mean#base=1_s";
        let p = ResourcePath::parse(raw).unwrap();
        assert_eq!(p.catalog_id, "/building/wing_a");
        assert_eq!(p.resource_id, "temperature");
        assert_eq!(p.kind.as_deref(), Some("mean"));
        assert_eq!(p.base_period, Some(PeriodTicks(10_000_000)));
        assert_eq!(p.render(), raw);
    }

    #[test]
    fn path_parses_multi_word_kind_and_params() {
        let raw = "/c/r/1_min_mean_polar_deg(x=1,y=2)";
        let p = ResourcePath::parse(raw).unwrap();
        assert_eq!(p.kind.as_deref(), Some("mean_polar_deg"));
        assert_eq!(p.parameters.as_ref().unwrap().get("x").map(String::as_str), Some("1"));
        assert_eq!(p.render(), raw);
    }

    #[test]
    fn rejects_unrooted_path() {
        assert!(ResourcePath::parse("building/r/1_s").is_err());
    }

    #[test]
    fn rejects_bad_identifier() {
        assert!(ResourcePath::parse("/1building/r/1_s").is_err());
    }
}
