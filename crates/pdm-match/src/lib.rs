//! Name normalization, pairwise classification, grouping and keeper election.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use pdm_core::{DuplicateGroup, MatchKind, Pass, ProjectId, ProjectRecord, ResolvedGroup};
use regex::Regex;
use serde::Serialize;
use strsim::jaro_winkler;

pub const CRATE_NAME: &str = "pdm-match";

/// Core names shorter than this never match by containment.
pub const MIN_CONTAINMENT_LEN: usize = 5;

static LEADING_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(the|at)\s+").expect("leading article pattern"));
static TRAILING_ARTICLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(the|at)$").expect("trailing article pattern"));

/// Lowercase, turn `, . / - _` into spaces and collapse whitespace.
pub fn normalize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if matches!(c, ',' | '.' | '/' | '-' | '_') { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `normalize`, then drop one leading `the`/`at` and one trailing `the`/`at`.
///
/// Only a single token is stripped at each end: "the at plaza" keeps "at".
pub fn core_name(name: &str) -> String {
    let normalized = normalize(name);
    let stripped = LEADING_ARTICLE.replace(&normalized, "");
    TRAILING_ARTICLE.replace(&stripped, "").into_owned()
}

pub fn names_match_exact(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

fn significant_words(core: &str) -> Vec<&str> {
    core.split_whitespace()
        .filter(|w| w.chars().count() > 2)
        .collect()
}

/// At least two shared significant words, and one side has two or more of them.
///
/// Duplicates on the left each count when present on the right.
pub fn word_overlap(core_a: &str, core_b: &str) -> bool {
    let words_a = significant_words(core_a);
    let words_b = significant_words(core_b);
    let overlap = words_a.iter().filter(|w| words_b.contains(w)).count();
    overlap >= 2 && (words_a.len() >= 2 || words_b.len() >= 2)
}

fn contains_either(core_a: &str, core_b: &str) -> bool {
    core_a.chars().count() >= MIN_CONTAINMENT_LEN
        && core_b.chars().count() >= MIN_CONTAINMENT_LEN
        && (core_a.contains(core_b) || core_b.contains(core_a))
}

pub fn classify_names(a: &str, b: &str) -> MatchKind {
    if names_match_exact(a, b) {
        return MatchKind::Exact;
    }
    if normalize(a) == normalize(b) {
        return MatchKind::Normalized;
    }
    let core_a = core_name(a);
    let core_b = core_name(b);
    if core_a == core_b {
        return MatchKind::Normalized;
    }
    if contains_either(&core_a, &core_b) {
        return MatchKind::Contains;
    }
    if word_overlap(&core_a, &core_b) {
        return MatchKind::WordOverlap;
    }
    MatchKind::None
}

pub fn classify(a: &ProjectRecord, b: &ProjectRecord) -> MatchKind {
    classify_names(&a.name, &b.name)
}

/// Core names equal, or the word overlap rule holds.
pub fn similar_name(a: &str, b: &str) -> bool {
    let core_a = core_name(a);
    let core_b = core_name(b);
    core_a == core_b || word_overlap(&core_a, &core_b)
}

/// City and state present on both sides and equal ignoring case and padding.
pub fn same_city_state(a: &ProjectRecord, b: &ProjectRecord) -> bool {
    fn key(value: Option<&str>) -> Option<String> {
        value
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
    }
    match (
        key(a.city.as_deref()),
        key(a.state.as_deref()),
        key(b.city.as_deref()),
        key(b.state.as_deref()),
    ) {
        (Some(city_a), Some(state_a), Some(city_b), Some(state_b)) => {
            city_a == city_b && state_a == state_b
        }
        _ => false,
    }
}

/// Pair predicate used by a union-find pass.
pub fn pass_predicate(pass: Pass, a: &ProjectRecord, b: &ProjectRecord) -> bool {
    match pass {
        Pass::Exact => normalize(&a.name) == normalize(&b.name),
        Pass::Normalized => matches!(classify(a, b), MatchKind::Normalized | MatchKind::Contains),
        Pass::CityState => same_city_state(a, b) && similar_name(&a.name, &b.name),
    }
}

/// Disjoint sets keyed by project id.
#[derive(Debug, Default)]
pub struct UnionFind {
    parent: HashMap<ProjectId, ProjectId>,
}

impl UnionFind {
    pub fn new(ids: impl IntoIterator<Item = ProjectId>) -> Self {
        Self {
            parent: ids.into_iter().map(|id| (id, id)).collect(),
        }
    }

    pub fn find(&mut self, id: ProjectId) -> ProjectId {
        let mut root = id;
        while let Some(&parent) = self.parent.get(&root) {
            if parent == root {
                break;
            }
            root = parent;
        }
        let mut cursor = id;
        while cursor != root {
            match self.parent.insert(cursor, root) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        root
    }

    pub fn union(&mut self, a: ProjectId, b: ProjectId) {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a != root_b {
            self.parent.insert(root_a, root_b);
        }
    }
}

fn has_name(record: &ProjectRecord) -> bool {
    !normalize(&record.name).is_empty()
}

/// Collect records sharing a key, keeping first-seen group order and input order.
fn collect_groups<K, F>(records: &[ProjectRecord], mut key: F) -> Vec<DuplicateGroup>
where
    K: std::hash::Hash + Eq,
    F: FnMut(&ProjectRecord) -> K,
{
    let mut slot_by_key: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<Vec<ProjectRecord>> = Vec::new();
    for record in records {
        let slot = *slot_by_key.entry(key(record)).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(record.clone());
    }
    groups
        .into_iter()
        .filter(|members| members.len() > 1)
        .map(|members| DuplicateGroup { members })
        .collect()
}

/// Union every pair accepted by `is_pair` and return the multi-member sets.
pub fn group_by_pairs<F>(records: &[ProjectRecord], mut is_pair: F) -> Vec<DuplicateGroup>
where
    F: FnMut(&ProjectRecord, &ProjectRecord) -> bool,
{
    let records: Vec<ProjectRecord> = records.iter().filter(|r| has_name(r)).cloned().collect();
    let mut sets = UnionFind::new(records.iter().map(|r| r.id));
    for i in 0..records.len() {
        for j in (i + 1)..records.len() {
            if is_pair(&records[i], &records[j]) {
                sets.union(records[i].id, records[j].id);
            }
        }
    }
    collect_groups(&records, |r| sets.find(r.id))
}

/// Records sharing a normalized name.
pub fn group_by_normalized_name(records: &[ProjectRecord]) -> Vec<DuplicateGroup> {
    let named: Vec<ProjectRecord> = records.iter().filter(|r| has_name(r)).cloned().collect();
    collect_groups(&named, |r| normalize(&r.name))
}

pub fn group_for_pass(pass: Pass, records: &[ProjectRecord]) -> Vec<DuplicateGroup> {
    match pass {
        Pass::Exact => group_by_normalized_name(records),
        _ => group_by_pairs(records, |a, b| pass_predicate(pass, a, b)),
    }
}

fn keeper_score(candidate: &ProjectRecord, best: &ProjectRecord) -> u32 {
    let mut score = 0;
    if candidate.city().is_some() {
        score += 1;
    }
    if candidate.state().is_some() {
        score += 1;
    }
    if candidate.stage().is_some() {
        score += 1;
    }
    if candidate.name.chars().count() > best.name.chars().count() {
        score += 2;
    }
    score
}

/// Prefer non-rejected records, then the most complete one; ties keep the earlier record.
pub fn select_keeper(members: &[ProjectRecord]) -> Option<&ProjectRecord> {
    let live: Vec<&ProjectRecord> = members.iter().filter(|r| !r.is_rejected()).collect();
    let candidates: Vec<&ProjectRecord> = if live.is_empty() {
        members.iter().collect()
    } else {
        live
    };
    let first = *candidates.first()?;
    let (best, _) = candidates
        .into_iter()
        .fold((first, 0u32), |(best, best_score), candidate| {
            let score = keeper_score(candidate, best);
            if score > best_score {
                (candidate, score)
            } else {
                (best, best_score)
            }
        });
    Some(best)
}

pub fn resolve_group(group: &DuplicateGroup) -> Option<ResolvedGroup> {
    let keeper = select_keeper(&group.members)?.clone();
    let duplicates = group
        .members
        .iter()
        .filter(|m| m.id != keeper.id)
        .cloned()
        .collect();
    Some(ResolvedGroup { keeper, duplicates })
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidatePair {
    pub a: ProjectRecord,
    pub b: ProjectRecord,
    pub kind: MatchKind,
    pub similarity: f64,
}

impl CandidatePair {
    fn new(a: &ProjectRecord, b: &ProjectRecord, kind: MatchKind) -> Self {
        Self {
            a: a.clone(),
            b: b.clone(),
            kind,
            similarity: jaro_winkler(&normalize(&a.name), &normalize(&b.name)),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self.kind {
            MatchKind::Normalized => "Same name (normalized)",
            MatchKind::Contains => "One name contains the other",
            MatchKind::WordOverlap => "Shared words in the same city/state",
            MatchKind::Exact => "Same name",
            MatchKind::None => "No match",
        }
    }
}

/// Read-only view of potential duplicates for human review.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DuplicateListing {
    pub exact_groups: Vec<DuplicateGroup>,
    pub likely_pairs: Vec<CandidatePair>,
    pub city_state_pairs: Vec<CandidatePair>,
}

impl DuplicateListing {
    pub fn build(records: &[ProjectRecord]) -> Self {
        let named: Vec<&ProjectRecord> = records.iter().filter(|r| has_name(r)).collect();
        let exact_groups = group_by_normalized_name(records);

        let mut likely_pairs = Vec::new();
        let mut seen_pairs: HashSet<(String, String)> = HashSet::new();
        for i in 0..named.len() {
            for j in (i + 1)..named.len() {
                let (a, b) = (named[i], named[j]);
                let pair_key = if a.name <= b.name {
                    (a.name.clone(), b.name.clone())
                } else {
                    (b.name.clone(), a.name.clone())
                };
                if seen_pairs.contains(&pair_key) {
                    continue;
                }
                let kind = classify(a, b);
                if matches!(kind, MatchKind::Normalized | MatchKind::Contains) {
                    seen_pairs.insert(pair_key);
                    likely_pairs.push(CandidatePair::new(a, b, kind));
                }
            }
        }

        let mut city_state_pairs = Vec::new();
        for i in 0..named.len() {
            for j in (i + 1)..named.len() {
                let (a, b) = (named[i], named[j]);
                if !same_city_state(a, b) {
                    continue;
                }
                let core_a = core_name(&a.name);
                let core_b = core_name(&b.name);
                if core_a != core_b && word_overlap(&core_a, &core_b) {
                    city_state_pairs.push(CandidatePair::new(a, b, MatchKind::WordOverlap));
                }
            }
        }

        Self {
            exact_groups,
            likely_pairs,
            city_state_pairs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exact_groups.is_empty() && self.likely_pairs.is_empty() && self.city_state_pairs.is_empty()
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Potential Deal Duplicates".to_string(),
            String::new(),
            "Review and decide which pairs to deduplicate and merge.".to_string(),
            String::new(),
            "---".to_string(),
            String::new(),
        ];

        if !self.exact_groups.is_empty() {
            lines.push("## 1. Exact duplicate names (same text, multiple rows)".to_string());
            lines.push(String::new());
            for group in &self.exact_groups {
                lines.push(format!("### \"{}\"", group.members[0].name));
                lines.push(String::new());
                for member in &group.members {
                    lines.push(format!("- {}", describe(member)));
                }
                lines.push(String::new());
            }
        }

        if !self.likely_pairs.is_empty() {
            lines.push("## 2. Likely same deal (normalized or containing name)".to_string());
            lines.push(String::new());
            for pair in &self.likely_pairs {
                lines.push(format!("- **{}** ({})", pair.a.name, describe(&pair.a)));
                lines.push(format!(
                    "  ↔ **{}** ({})  \n  _{}_ (similarity {:.2})",
                    pair.b.name,
                    describe(&pair.b),
                    pair.reason(),
                    pair.similarity
                ));
                lines.push(String::new());
            }
        }

        if !self.city_state_pairs.is_empty() {
            lines.push("## 3. Same city/state, similar name (possible duplicate)".to_string());
            lines.push(String::new());
            for pair in &self.city_state_pairs {
                lines.push(format!(
                    "- **{}** (#{}, {}) ↔ **{}** (#{}, {}) in {}, {} (similarity {:.2})",
                    pair.a.name,
                    pair.a.id,
                    pair.a.stage().unwrap_or("no stage"),
                    pair.b.name,
                    pair.b.id,
                    pair.b.stage().unwrap_or("no stage"),
                    pair.a.city().unwrap_or_default(),
                    pair.a.state().unwrap_or_default(),
                    pair.similarity
                ));
                lines.push(String::new());
            }
        }

        if self.is_empty() {
            lines.push("No potential duplicates detected.".to_string());
        }

        lines.join("\n")
    }
}

fn describe(record: &ProjectRecord) -> String {
    format!(
        "#{} | {} | {}, {}",
        record.id,
        record.stage().unwrap_or("no stage"),
        record.city().unwrap_or("?"),
        record.state().unwrap_or("?")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(id: ProjectId, name: &str) -> ProjectRecord {
        ProjectRecord::new(id, name)
    }

    #[test]
    fn normalize_strips_punctuation_and_whitespace() {
        assert_eq!(normalize("  1450 Meeting St. "), "1450 meeting st");
        assert_eq!(normalize("Oak_Ridge--Phase/2"), "oak ridge phase 2");
        assert_eq!(normalize("Main,\t\tStreet"), "main street");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn normalize_is_idempotent() {
        for name in ["The Waters at Millerville", " a.b/c-d_e ", "ÉLAN  Park", "", "..."] {
            let once = normalize(name);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn core_name_strips_a_single_article_at_each_end() {
        assert_eq!(core_name("The Waters at Millerville"), "waters at millerville");
        assert_eq!(core_name("The at Plaza"), "at plaza");
        assert_eq!(core_name("Commons at the"), "commons at");
        assert_eq!(core_name("THE Landing"), "landing");
        assert_eq!(core_name("the"), "the");
        assert_eq!(core_name("Theater Row"), "theater row");
    }

    #[test]
    fn classify_is_reflexive_exact() {
        let record = project(1, "Harbor Point");
        assert_eq!(classify(&record, &record), MatchKind::Exact);
        assert_eq!(classify_names(" harbor point", "HARBOR POINT "), MatchKind::Exact);
    }

    #[test]
    fn classify_normalized_and_core_matches() {
        assert_eq!(classify_names("1450 Meeting St", "1450 Meeting St."), MatchKind::Normalized);
        assert_eq!(classify_names("The Landing", "Landing"), MatchKind::Normalized);
    }

    #[test]
    fn containment_requires_five_characters() {
        assert_ne!(classify_names("AB", "ABC"), MatchKind::Contains);
        assert_eq!(classify_names("AB", "ABC"), MatchKind::None);
        assert_eq!(
            classify_names("Waters", "The Waters at Millerville"),
            MatchKind::Contains
        );
    }

    #[test]
    fn word_overlap_counts_left_duplicates() {
        assert!(word_overlap("oak oak grove", "oak lane"));
        assert!(word_overlap("magnolia park commons", "magnolia park phase"));
        assert!(!word_overlap("magnolia park", "magnolia grove"));
        assert!(!word_overlap("an of oak", "an of oak"));
        assert_eq!(
            classify_names("Magnolia Park Commons", "Magnolia Park Phase II"),
            MatchKind::WordOverlap
        );
    }

    #[test]
    fn city_state_requires_both_sides_present() {
        let a = project(1, "x").with_location("Charleston ", "sc");
        let b = project(2, "y").with_location("charleston", "SC");
        let c = project(3, "z").with_location("Charleston", "");
        assert!(same_city_state(&a, &b));
        assert!(!same_city_state(&a, &c));
        assert!(!same_city_state(&project(4, "w"), &project(5, "v")));
    }

    #[test]
    fn union_find_merges_transitively() {
        let mut sets = UnionFind::new([10, 20, 30, 40]);
        sets.union(10, 20);
        sets.union(20, 30);
        assert_eq!(sets.find(10), sets.find(30));
        assert_ne!(sets.find(10), sets.find(40));
    }

    #[test]
    fn pass_one_groups_by_normalized_name_and_skips_blank() {
        let records = vec![
            project(1, "1450 Meeting St"),
            project(2, "Harbor Point"),
            project(3, "1450 Meeting St."),
            project(4, ""),
            project(5, " -- "),
        ];
        let groups = group_for_pass(Pass::Exact, &records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids(), vec![1, 3]);
    }

    #[test]
    fn pass_two_chains_containment_and_skips_exact_pairs() {
        let records = vec![
            project(1, "Waters"),
            project(2, "The Waters at Millerville"),
            project(3, "Waters at Millerville Phase 2"),
            project(4, "Harbor Point"),
        ];
        let groups = group_for_pass(Pass::Normalized, &records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids(), vec![1, 2, 3]);

        let exact_only = vec![project(5, "Harbor Point"), project(6, "harbor point")];
        assert!(group_for_pass(Pass::Normalized, &exact_only).is_empty());
    }

    #[test]
    fn pass_three_is_gated_on_city_and_state() {
        let records = vec![
            project(1, "Magnolia Park Commons").with_location("Mobile", "AL"),
            project(2, "Magnolia Park Phase II").with_location("Mobile", "MS"),
        ];
        assert!(group_for_pass(Pass::CityState, &records).is_empty());

        let same_state = vec![
            project(1, "Magnolia Park Commons").with_location("Mobile", "AL"),
            project(2, "Magnolia Park Phase II").with_location("mobile", "al"),
        ];
        assert_eq!(group_for_pass(Pass::CityState, &same_state).len(), 1);
    }

    #[test]
    fn keeper_prefers_the_only_live_record() {
        let members = vec![
            project(1, "Harbor Point Apartments Phase One")
                .with_location("Mobile", "AL")
                .with_stage("Rejected"),
            project(2, "Harbor Pt").with_stage("Identified"),
            project(3, "Harbor Point Apartments").with_stage("rejected"),
        ];
        assert_eq!(select_keeper(&members).map(|k| k.id), Some(2));
    }

    #[test]
    fn keeper_falls_back_to_full_group_when_all_rejected() {
        let members = vec![
            project(1, "Site A").with_stage("Rejected"),
            project(2, "Site A.").with_location("Mobile", "AL").with_stage("REJECTED"),
        ];
        assert_eq!(select_keeper(&members).map(|k| k.id), Some(2));
    }

    #[test]
    fn keeper_ties_keep_the_first_candidate() {
        let members = vec![
            project(1, "Site").with_location("Mobile", "AL"),
            project(2, "Site").with_location("Mobile", "AL"),
        ];
        assert_eq!(select_keeper(&members).map(|k| k.id), Some(1));
        assert!(select_keeper(&[]).is_none());
    }

    #[test]
    fn keeper_rewards_longer_names_over_current_best() {
        let members = vec![
            project(1, "Site").with_stage("Identified"),
            project(2, "Site Longer Name"),
        ];
        // 1 scores 1; 2 scores 2 from its longer name alone.
        assert_eq!(select_keeper(&members).map(|k| k.id), Some(2));
    }

    #[test]
    fn resolved_group_never_lists_keeper_as_duplicate() {
        let group = DuplicateGroup {
            members: vec![
                project(1, "A Place").with_stage("Rejected"),
                project(2, "A Place").with_stage("Closed"),
                project(3, "a place"),
            ],
        };
        let resolved = resolve_group(&group).unwrap();
        assert_eq!(resolved.keeper.id, 2);
        assert!(resolved.duplicates.iter().all(|d| d.id != resolved.keeper.id));
        assert_eq!(resolved.duplicates.len(), 2);
    }

    #[test]
    fn listing_sections_and_markdown() {
        let records = vec![
            project(1, "1450 Meeting St").with_location("Charleston", "SC"),
            project(2, "1450 meeting st").with_location("Charleston", "SC"),
            project(3, "The Waters at Millerville").with_location("Baton Rouge", "LA"),
            project(4, "Waters at Millerville Phase 2").with_location("Baton Rouge", "LA"),
            project(5, "Magnolia Park Commons").with_location("Mobile", "AL"),
            project(6, "Magnolia Park Phase II").with_location("Mobile", "AL"),
        ];
        let listing = DuplicateListing::build(&records);
        assert_eq!(listing.exact_groups.len(), 1);
        assert_eq!(listing.likely_pairs.len(), 1);
        assert_eq!(listing.likely_pairs[0].kind, MatchKind::Contains);
        assert!(listing
            .city_state_pairs
            .iter()
            .any(|p| p.a.id == 5 && p.b.id == 6));

        let md = listing.to_markdown();
        assert!(md.contains("## 1. Exact duplicate names"));
        assert!(md.contains("One name contains the other"));
        assert!(md.contains("## 3. Same city/state"));
    }

    #[test]
    fn empty_listing_says_so() {
        let listing = DuplicateListing::build(&[project(1, "Alpha"), project(2, "Omega")]);
        assert!(listing.is_empty());
        assert!(listing.to_markdown().contains("No potential duplicates detected."));
    }
}
