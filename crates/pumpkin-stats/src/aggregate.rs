//! Grower, contest and site summaries derived from ranked pumpkins.

use std::collections::{BTreeMap, HashMap};

use pumpkin_core::{sanitize_site_name, Contest, Grower, Pumpkin, Site};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GrowerStats {
    pub max_weight: Option<f64>,
    pub entries: u64,
    /// Lowest `yearGlobalRank` across the grower's pumpkins.
    pub best_rank: Option<u32>,
    pub best_lifetime_global: Option<u32>,
    pub best_lifetime_state: Option<u32>,
    pub best_lifetime_country: Option<u32>,
}

fn min_rank(current: Option<u32>, candidate: Option<u32>) -> Option<u32> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl GrowerStats {
    fn absorb(&mut self, pumpkin: &Pumpkin) {
        self.entries += 1;
        self.max_weight = Some(match self.max_weight {
            Some(w) => w.max(pumpkin.weight),
            None => pumpkin.weight,
        });
        let ranks = &pumpkin.ranks;
        self.best_rank = min_rank(self.best_rank, ranks.year_global_rank);
        self.best_lifetime_global = min_rank(self.best_lifetime_global, ranks.lifetime_global_rank);
        self.best_lifetime_state = min_rank(self.best_lifetime_state, ranks.lifetime_state_rank);
        self.best_lifetime_country =
            min_rank(self.best_lifetime_country, ranks.lifetime_country_rank);
    }

    pub fn global_ranking(&self) -> Option<String> {
        self.best_lifetime_global.map(|rank| format!("Global: #{rank}"))
    }

    /// Labelled with the grower's own stored state, not the pumpkins' states.
    pub fn state_ranking(&self, grower: &Grower) -> Option<String> {
        labelled(grower.state.trim(), self.best_lifetime_state)
    }

    /// Labelled with the grower's own stored country.
    pub fn country_ranking(&self, grower: &Grower) -> Option<String> {
        labelled(grower.country.trim(), self.best_lifetime_country)
    }
}

fn labelled(label: &str, rank: Option<u32>) -> Option<String> {
    if label.is_empty() {
        return None;
    }
    rank.map(|rank| format!("{label}: #{rank}"))
}

/// Regroup eligible pumpkins by grower id.
pub fn grower_stats(pumpkins: &[Pumpkin]) -> HashMap<String, GrowerStats> {
    let mut out: HashMap<String, GrowerStats> = HashMap::new();
    for pumpkin in pumpkins.iter().filter(|p| !p.is_disqualified()) {
        let grower = pumpkin.grower.trim();
        if grower.is_empty() {
            debug!(pumpkin = %pumpkin.id, "pumpkin has no grower reference");
            continue;
        }
        out.entry(grower.to_string()).or_default().absorb(pumpkin);
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContestPopularity {
    /// Entries recorded against this contest id.
    pub year: u64,
    /// Entries across every contest id sharing this contest's name.
    pub lifetime: u64,
}

/// Popularity per contest id, built from two count maps instead of a pumpkins × contests scan.
pub fn contest_popularity(
    pumpkins: &[Pumpkin],
    contests: &[Contest],
) -> BTreeMap<String, ContestPopularity> {
    let names_by_id: HashMap<&str, &str> = contests
        .iter()
        .map(|c| (c.id.as_str(), c.name.trim()))
        .collect();

    let mut by_id: HashMap<&str, u64> = HashMap::new();
    let mut by_name: HashMap<&str, u64> = HashMap::new();
    for pumpkin in pumpkins.iter().filter(|p| !p.is_disqualified()) {
        let contest = pumpkin.contest.trim();
        if !contest.is_empty() {
            *by_id.entry(contest).or_default() += 1;
        }
        let name = match pumpkin.contest_name.trim() {
            "" => names_by_id.get(contest).copied().unwrap_or(""),
            name => name,
        };
        if !name.is_empty() {
            *by_name.entry(name).or_default() += 1;
        }
    }

    contests
        .iter()
        .map(|contest| {
            let popularity = ContestPopularity {
                year: by_id.get(contest.id.as_str()).copied().unwrap_or(0),
                lifetime: by_name.get(contest.name.trim()).copied().unwrap_or(0),
            };
            (contest.id.clone(), popularity)
        })
        .collect()
}

/// Heaviest eligible weight per contest id.
pub fn contest_record_weights(pumpkins: &[Pumpkin]) -> HashMap<String, f64> {
    let mut out: HashMap<String, f64> = HashMap::new();
    for pumpkin in pumpkins.iter().filter(|p| !p.is_disqualified()) {
        let contest = pumpkin.contest.trim();
        if contest.is_empty() {
            continue;
        }
        out.entry(contest.to_string())
            .and_modify(|w| *w = w.max(pumpkin.weight))
            .or_insert(pumpkin.weight);
    }
    out
}

/// Fold contest rows sharing a sanitized site name into one site document.
///
/// The record is the max of `recordWeight`; total entries is the max (not the
/// sum) of `LifetimePopularity`. Year maps carry each row's values as stored.
pub fn fold_sites(contests: &[Contest]) -> BTreeMap<String, Site> {
    let mut out: BTreeMap<String, Site> = BTreeMap::new();
    for contest in contests {
        let key = sanitize_site_name(&contest.name);
        let site = out.entry(key.clone()).or_insert_with(|| Site {
            id: key,
            ..Default::default()
        });

        if let Some(weight) = contest.record_weight {
            site.site_record = Some(site.site_record.map_or(weight, |w| w.max(weight)));
        }
        site.total_entries = site
            .total_entries
            .max(contest.lifetime_popularity.unwrap_or(0));

        if let Some(year) = contest.year {
            if let Some(popularity) = contest.year_popularity {
                site.popularity_by_year.insert(year, popularity);
            }
            if let Some(weight) = contest.record_weight {
                site.max_weight_by_year.insert(year, weight);
            }
        }
    }
    out
}
