//! Resource limit specs from the command line.

use brig_proto::{Limit, Resource};

use crate::error::{Error, Result};

/// Parses `RES=SOFT[:HARD]`. A missing hard value equals the soft one;
/// `unlimited` or any negative number means no bound.
pub fn parse_limit(spec: &str) -> Result<Limit> {
    let invalid = |reason: &str| Error::InvalidLimit {
        spec: spec.to_owned(),
        reason: reason.to_owned(),
    };

    let (name, values) = spec
        .split_once('=')
        .ok_or_else(|| invalid("expected RES=SOFT[:HARD]"))?;
    let resource: Resource = name.parse().map_err(|e: String| invalid(&e))?;
    let (soft, hard) = match values.split_once(':') {
        Some((soft, hard)) => (soft, hard),
        None => (values, values),
    };
    Ok(Limit {
        resource,
        soft: value(soft).ok_or_else(|| invalid("bad soft value"))?,
        hard: value(hard).ok_or_else(|| invalid("bad hard value"))?,
    })
}

/// A limit value; unbounded becomes `-1`.
fn value(s: &str) -> Option<i64> {
    if s.eq_ignore_ascii_case("unlimited") || s.eq_ignore_ascii_case("infinity") {
        return Some(-1);
    }
    s.parse::<i64>().ok().map(|v| v.max(-1))
}
