//! Dense 1-based rank assignment over sorted group tables.

use std::collections::BTreeMap;

use pumpkin_core::{fields, Pumpkin, PumpkinRanks};
use serde_json::{Map, Value};

use crate::grouping::{Dimension, GroupTable, Window};

/// Ranks per pumpkin id. Pumpkins outside every group have no entry.
pub type RankTable = BTreeMap<String, PumpkinRanks>;

/// Persisted (lifetime, yearly) field names for a dimension.
pub fn rank_field_names(dimension: Dimension) -> [&'static str; 2] {
    match dimension {
        Dimension::Global => [fields::LIFETIME_GLOBAL_RANK, fields::YEAR_GLOBAL_RANK],
        Dimension::State => [fields::LIFETIME_STATE_RANK, fields::YEARLY_STATE_RANK],
        Dimension::Country => [fields::LIFETIME_COUNTRY_RANK, fields::YEARLY_COUNTRY_RANK],
    }
}

fn slot(ranks: &mut PumpkinRanks, dimension: Dimension, window: Window) -> &mut Option<u32> {
    match (dimension, window) {
        (Dimension::Global, Window::Lifetime) => &mut ranks.lifetime_global_rank,
        (Dimension::Global, Window::Year(_)) => &mut ranks.year_global_rank,
        (Dimension::State, Window::Lifetime) => &mut ranks.lifetime_state_rank,
        (Dimension::State, Window::Year(_)) => &mut ranks.yearly_state_rank,
        (Dimension::Country, Window::Lifetime) => &mut ranks.lifetime_country_rank,
        (Dimension::Country, Window::Year(_)) => &mut ranks.yearly_country_rank,
    }
}

/// Read the (lifetime, yearly) ranks for `dimension`.
pub fn ranks_for(ranks: &PumpkinRanks, dimension: Dimension) -> (Option<u32>, Option<u32>) {
    match dimension {
        Dimension::Global => (ranks.lifetime_global_rank, ranks.year_global_rank),
        Dimension::State => (ranks.lifetime_state_rank, ranks.yearly_state_rank),
        Dimension::Country => (ranks.lifetime_country_rank, ranks.yearly_country_rank),
    }
}

/// rank = position + 1 in each sorted group. Ties never share a rank.
pub fn assign_ranks(table: &GroupTable<'_>, out: &mut RankTable) {
    for (key, members) in table.iter() {
        for (index, pumpkin) in members.iter().enumerate() {
            let rank = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let entry = out.entry(pumpkin.id.clone()).or_default();
            *slot(entry, key.dimension, key.window) = Some(rank);
        }
    }
}

pub fn rank_pumpkins(pumpkins: &[Pumpkin], dimensions: &[Dimension]) -> RankTable {
    let mut out = RankTable::new();
    for &dimension in dimensions {
        assign_ranks(&GroupTable::build(pumpkins, dimension), &mut out);
    }
    out
}

/// Field updates for one dimension: ranks to set, plus rank fields to clear.
pub fn rank_update(
    ranks: Option<&PumpkinRanks>,
    dimension: Dimension,
) -> (Map<String, Value>, Vec<&'static str>) {
    let names = rank_field_names(dimension);
    let (lifetime, yearly) = ranks.map(|r| ranks_for(r, dimension)).unwrap_or((None, None));

    let mut set = Map::new();
    let mut clear = Vec::new();
    for (name, value) in names.into_iter().zip([lifetime, yearly]) {
        match value {
            Some(rank) => {
                set.insert(name.to_string(), Value::from(rank));
            }
            None => clear.push(name),
        }
    }
    (set, clear)
}
