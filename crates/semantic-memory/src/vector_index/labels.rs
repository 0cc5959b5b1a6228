//! Dense `label -> record id` directory, one per provider.
use std::collections::HashMap;

use crate::error::{MemoryError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDirectory {
    ids: Vec<String>,
    labels: HashMap<String, u32>,
}

impl LabelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory assigning `0..N-1` in the given order.
    pub fn from_ordered_ids(ids: Vec<String>) -> Result<Self> {
        let mut directory = Self::new();
        for id in ids {
            directory.push(id)?;
        }
        Ok(directory)
    }

    /// Rebuild from persisted `(id, label)` pairs. The labels must cover
    /// `0..rows.len()` exactly once each; anything else is reported as the
    /// reason the directory cannot be trusted.
    pub fn from_persisted(rows: Vec<(String, Option<i64>)>) -> std::result::Result<Self, String> {
        let count = rows.len();
        let mut slots: Vec<Option<String>> = vec![None; count];
        for (id, label) in rows {
            let label = label.ok_or_else(|| format!("thought {} has no label", id))?;
            let slot = usize::try_from(label)
                .ok()
                .and_then(|l| slots.get_mut(l))
                .ok_or_else(|| format!("label {} of thought {} is outside 0..{}", label, id, count))?;
            if let Some(existing) = slot.as_ref() {
                return Err(format!("label {} is held by both {} and {}", label, existing, id));
            }
            *slot = Some(id);
        }

        let ids: Vec<String> = slots.into_iter().flatten().collect();
        Self::from_ordered_ids(ids).map_err(|e| e.to_string())
    }

    /// Assign the next label to `id`.
    pub fn push(&mut self, id: String) -> Result<u32> {
        if self.labels.contains_key(&id) {
            return Err(MemoryError::index(format!("{} already has a label", id)));
        }
        let label = u32::try_from(self.ids.len())
            .map_err(|_| MemoryError::index("label space exhausted"))?;
        self.labels.insert(id.clone(), label);
        self.ids.push(id);
        Ok(label)
    }

    pub fn id_of(&self, label: u32) -> Option<&str> {
        self.ids.get(label as usize).map(String::as_str)
    }

    pub fn label_of(&self, id: &str) -> Option<u32> {
        self.labels.get(id).copied()
    }

    /// Next label a live insert would receive
    pub fn next_label(&self) -> u32 {
        self.ids.len() as u32
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Record ids in label order
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.labels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn persisted_labels_restore_order() {
        let rows = vec![
            ("b".to_string(), Some(0)),
            ("a".to_string(), Some(2)),
            ("c".to_string(), Some(1)),
        ];
        let directory = LabelDirectory::from_persisted(rows).unwrap();
        assert_eq!(directory.ids(), &["b", "c", "a"]);
        assert_eq!(directory.label_of("a"), Some(2));
        assert_eq!(directory.id_of(1), Some("c"));
        assert_eq!(directory.next_label(), 3);
    }

    #[test]
    fn gaps_duplicates_and_missing_labels_are_rejected() {
        let gap = vec![("a".to_string(), Some(0)), ("b".to_string(), Some(2))];
        assert!(LabelDirectory::from_persisted(gap).is_err());

        let dup = vec![("a".to_string(), Some(0)), ("b".to_string(), Some(0))];
        assert!(LabelDirectory::from_persisted(dup).is_err());

        let missing = vec![("a".to_string(), None)];
        assert!(LabelDirectory::from_persisted(missing).is_err());

        let negative = vec![("a".to_string(), Some(-1))];
        assert!(LabelDirectory::from_persisted(negative).is_err());
    }

    #[test]
    fn ids_are_unique() {
        let mut directory = LabelDirectory::new();
        assert_eq!(directory.push("x".into()).unwrap(), 0);
        assert!(directory.push("x".into()).is_err());
        assert_eq!(directory.len(), 1);
        directory.clear();
        assert!(directory.is_empty());
        assert_eq!(directory.push("x".into()).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn labels_are_dense_in_insertion_order(ids in prop::collection::hash_set("[a-z]{1,8}", 0..50)) {
            let ids: Vec<String> = ids.into_iter().collect();
            let directory = LabelDirectory::from_ordered_ids(ids.clone()).unwrap();
            prop_assert_eq!(directory.len(), ids.len());
            for (expected, id) in ids.iter().enumerate() {
                prop_assert_eq!(directory.label_of(id), Some(expected as u32));
                prop_assert_eq!(directory.id_of(expected as u32), Some(id.as_str()));
            }
            prop_assert_eq!(directory.id_of(ids.len() as u32), None);
        }
    }
}
