use std::collections::BTreeSet;
use std::str::FromStr;

use crate::{Error, Result};

use super::frame::canonical_id;
use super::{CAN_EFF_FLAG, CAN_EFF_MASK};

/// Upper bound on the number of ids a single filter may expand to.
pub const MAX_FILTER_IDS: usize = 4096;

/// The set of CAN ids a transport accepts.
///
/// Written as tokens separated by `+` (or `,` where the filter is not itself a
/// comma separated field). A token is either an id or an inclusive
/// `start-end` range. Ids are hexadecimal with an optional `0x` prefix, so
/// `"100+200-202"` is `{0x100, 0x200, 0x201, 0x202}`.
///
/// Ids are kept in [`canonical_id`] form: ids above `0x7ff`, or written with
/// bit 31 set, are extended ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    ids: BTreeSet<u32>,
}

impl FilterSet {
    /// Every id in `[start, end)`.
    pub fn range(start: u32, end: u32) -> Result<Self> {
        if end <= start {
            return Err(Error::parse(format!("empty range {start:#x}-{end:#x}")));
        }
        check_span(start, end - 1)?;
        Ok((start..end).collect())
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&canonical_id(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn min(&self) -> Option<u32> {
        self.ids.first().copied()
    }

    pub fn max(&self) -> Option<u32> {
        self.ids.last().copied()
    }
}

impl FromIterator<u32> for FilterSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        FilterSet {
            ids: iter.into_iter().map(canonical_id).collect(),
        }
    }
}

impl FromStr for FilterSet {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self> {
        let spec: String = spec
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();

        let mut ids = BTreeSet::new();
        for token in spec.split(|c| c == '+' || c == ',').filter(|t| !t.is_empty()) {
            match token.split_once('-') {
                Some((start, end)) => {
                    let start = parse_id(start)?;
                    let end = parse_id(end)?;
                    if end < start {
                        return Err(Error::parse(format!("descending range {token:?}")));
                    }
                    check_span(start, end)?;
                    ids.extend((start..=end).map(canonical_id));
                }
                None => {
                    ids.insert(canonical_id(parse_id(token)?));
                }
            }
            if ids.len() > MAX_FILTER_IDS {
                return Err(Error::parse(format!("filter {spec:?} has too many ids")));
            }
        }
        Ok(FilterSet { ids })
    }
}

fn parse_id(token: &str) -> Result<u32> {
    let digits = token.strip_prefix("0x").unwrap_or(token);
    let id = u32::from_str_radix(digits, 16)
        .map_err(|_| Error::parse(format!("invalid CAN id {token:?}")))?;
    if id & !CAN_EFF_FLAG > CAN_EFF_MASK {
        return Err(Error::parse(format!("CAN id {token:?} out of range")));
    }
    Ok(id)
}

fn check_span(start: u32, end: u32) -> Result<()> {
    if (end - start) as usize >= MAX_FILTER_IDS {
        return Err(Error::parse(format!(
            "range {start:#x}-{end:#x} has more than {MAX_FILTER_IDS} ids"
        )));
    }
    Ok(())
}
