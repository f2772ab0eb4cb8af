//! Explicit group tables keyed by ranking dimension, scope value and time window.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use pumpkin_core::Pumpkin;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Global,
    State,
    Country,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Global, Dimension::State, Dimension::Country];

    /// Scope value a pumpkin falls under, or `None` when it has no location for this dimension.
    pub fn scope_of<'p>(&self, pumpkin: &'p Pumpkin) -> Option<&'p str> {
        let raw = match self {
            Dimension::Global => return Some(""),
            Dimension::State => pumpkin.state.trim(),
            Dimension::Country => pumpkin.country.trim(),
        };
        (!raw.is_empty()).then_some(raw)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dimension::Global => "global",
            Dimension::State => "state",
            Dimension::Country => "country",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Window {
    Lifetime,
    Year(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub dimension: Dimension,
    /// State or country name; empty for the global dimension.
    pub scope: String,
    pub window: Window,
}

impl GroupKey {
    pub fn new(dimension: Dimension, scope: impl Into<String>, window: Window) -> Self {
        Self {
            dimension,
            scope: scope.into(),
            window,
        }
    }
}

/// Heavier first; equal weights fall back to ascending record id.
pub fn rank_order(a: &Pumpkin, b: &Pumpkin) -> Ordering {
    b.weight
        .total_cmp(&a.weight)
        .then_with(|| a.id.cmp(&b.id))
}

/// Non-disqualified pumpkins partitioned into sorted groups for one dimension.
///
/// Every eligible pumpkin with a scope value lands in exactly two groups: the
/// lifetime group of its scope and the year sub-group nested under it.
#[derive(Debug, Default)]
pub struct GroupTable<'p> {
    groups: BTreeMap<GroupKey, Vec<&'p Pumpkin>>,
}

impl<'p> GroupTable<'p> {
    pub fn build(pumpkins: &'p [Pumpkin], dimension: Dimension) -> Self {
        let mut groups: BTreeMap<GroupKey, Vec<&'p Pumpkin>> = BTreeMap::new();
        for pumpkin in pumpkins.iter().filter(|p| !p.is_disqualified()) {
            let Some(scope) = dimension.scope_of(pumpkin) else {
                continue;
            };
            groups
                .entry(GroupKey::new(dimension, scope, Window::Lifetime))
                .or_default()
                .push(pumpkin);
            groups
                .entry(GroupKey::new(dimension, scope, Window::Year(pumpkin.year)))
                .or_default()
                .push(pumpkin);
        }

        for members in groups.values_mut() {
            members.sort_by(|a, b| rank_order(a, b));
        }
        Self { groups }
    }

    pub fn get(&self, key: &GroupKey) -> Option<&[&'p Pumpkin]> {
        self.groups.get(key).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, &[&'p Pumpkin])> {
        self.groups.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::pumpkin;

    #[test]
    fn lifetime_and_year_groups_are_built_per_scope() {
        let pumpkins = vec![
            pumpkin("a", 50.0, 2022, "Virginia", "United States"),
            pumpkin("b", 80.0, 2023, "Virginia", "United States"),
            pumpkin("c", 80.0, 2023, "North Carolina", "United States"),
        ];
        let table = GroupTable::build(&pumpkins, Dimension::State);

        let va = table
            .get(&GroupKey::new(Dimension::State, "Virginia", Window::Lifetime))
            .expect("virginia lifetime");
        assert_eq!(va.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);

        let va_2022 = table
            .get(&GroupKey::new(Dimension::State, "Virginia", Window::Year(2022)))
            .expect("virginia 2022");
        assert_eq!(va_2022.len(), 1);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn equal_weights_order_by_id_regardless_of_input_order() {
        let forward = vec![
            pumpkin("b", 80.0, 2023, "Virginia", "United States"),
            pumpkin("c", 80.0, 2023, "North Carolina", "United States"),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        let key = GroupKey::new(Dimension::Global, "", Window::Lifetime);
        for input in [&forward, &reversed] {
            let table = GroupTable::build(input, Dimension::Global);
            let ids = table.get(&key).unwrap().iter().map(|p| p.id.clone()).collect::<Vec<_>>();
            assert_eq!(ids, vec!["b", "c"]);
        }
    }

    #[test]
    fn disqualified_and_unlocated_records_are_left_out() {
        let mut dmg = pumpkin("x", 2000.0, 2023, "Ohio", "United States");
        dmg.place = "DMG".into();
        let pumpkins = vec![dmg, pumpkin("y", 10.0, 2023, "", "Canada")];

        let state = GroupTable::build(&pumpkins, Dimension::State);
        assert!(state.is_empty());

        let country = GroupTable::build(&pumpkins, Dimension::Country);
        let canada = country
            .get(&GroupKey::new(Dimension::Country, "Canada", Window::Lifetime))
            .unwrap();
        assert_eq!(canada.len(), 1);
        assert!(country
            .get(&GroupKey::new(Dimension::Country, "United States", Window::Lifetime))
            .is_none());
    }
}
