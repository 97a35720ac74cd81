//! Declared placement order of feature fragments in the merged document.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::types::FeatureId;

/// Header-area features first, body next, footer last.
pub const DEFAULT_FEATURE_ORDER: &[&str] = &[
    "podcast",
    "video",
    "skills-viz",
    "timeline",
    "portfolio",
    "recommendations",
];

/// Ordered list of feature ids. Features missing from the list sort after
/// all listed ones, by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureOrder {
    positions: HashMap<FeatureId, usize>,
    declared: Vec<FeatureId>,
}

impl Default for FeatureOrder {
    fn default() -> Self {
        Self::new(DEFAULT_FEATURE_ORDER.iter().map(|id| FeatureId::from(*id)))
    }
}

impl FeatureOrder {
    /// Later duplicates are ignored.
    pub fn new<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = FeatureId>,
    {
        let mut positions = HashMap::new();
        let mut declared = Vec::new();
        for id in ids {
            if !positions.contains_key(&id) {
                positions.insert(id.clone(), declared.len());
                declared.push(id);
            }
        }
        Self {
            positions,
            declared,
        }
    }

    /// Parse a comma separated list such as `podcast,skills-viz`.
    pub fn parse(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(FeatureId::from),
        )
    }

    pub fn declared(&self) -> &[FeatureId] {
        &self.declared
    }

    pub fn position(&self, id: &FeatureId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn compare(&self, a: &FeatureId, b: &FeatureId) -> Ordering {
        match (self.position(a), self.position(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    }

    pub fn sort(&self, ids: &mut [FeatureId]) {
        ids.sort_by(|a, b| self.compare(a, b));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_features_follow_declared_ones() {
        let order = FeatureOrder::parse("podcast, skills-viz");
        let mut ids: Vec<FeatureId> = vec!["zeta".into(), "skills-viz".into(), "alpha".into(), "podcast".into()];
        order.sort(&mut ids);
        let ids: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        assert_eq!(ids, vec!["podcast", "skills-viz", "alpha", "zeta"]);
    }

    #[test]
    fn duplicates_keep_first_position() {
        let order = FeatureOrder::parse("a,b,a");
        assert_eq!(order.declared().len(), 2);
        assert_eq!(order.position(&FeatureId::from("a")), Some(0));
    }
}
