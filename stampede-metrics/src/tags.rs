use smallvec::SmallVec;
use std::sync::Arc;

/// A normalized (sorted, key-then-value) set of tag pairs identifying one
/// series of a metric. Most series carry fewer than four tags, so the pairs
/// are stored inline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagSet {
    pairs: SmallVec<[(Arc<str>, Arc<str>); 4]>,
}

impl TagSet {
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut v: SmallVec<[(Arc<str>, Arc<str>); 4]> = pairs
            .iter()
            .map(|(k, v)| (Arc::<str>::from(*k), Arc::<str>::from(*v)))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        v.dedup();
        Self { pairs: v }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.pairs.iter().map(|(k, v)| (k.as_ref(), v.as_ref()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let idx = self.pairs.partition_point(|(k, _)| k.as_ref() < key);
        self.pairs
            .get(idx)
            .and_then(|(k, v)| (k.as_ref() == key).then_some(v.as_ref()))
    }

    pub fn to_vec(&self) -> Vec<(String, String)> {
        self.pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
