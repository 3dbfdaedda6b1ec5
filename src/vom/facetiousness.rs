//! Classification of behavior bags and reconciliation of facet names
//! across definitions of a durable kind.

use std::collections::BTreeSet;

use super::behavior::{Behavior, BehaviorEntry, PropertyKey};
use super::descriptor::DurableKindDescriptor;
use crate::core::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facetiousness {
    /// A single bag of methods.
    One,
    /// A record of named method bags.
    Many,
    Not,
}

pub fn assess_facetiousness(behavior: &Behavior) -> Facetiousness {
    let mut methods = 0;
    let mut facets = 0;
    for (key, entry) in behavior.entries() {
        match (key, entry) {
            (_, BehaviorEntry::Method(_)) => methods += 1,
            (PropertyKey::Name(_), BehaviorEntry::Facet(bag))
                if assess_facetiousness(bag) == Facetiousness::One =>
            {
                facets += 1
            }
            _ => return Facetiousness::Not,
        }
    }
    match (methods, facets) {
        (_, 0) => Facetiousness::One,
        (0, _) => Facetiousness::Many,
        _ => Facetiousness::Not,
    }
}

/// Reconcile `proposed` facet names with what `desc` recorded earlier,
/// updating `desc` in place. Returns the facet names in their committed
/// order, or `None` for an unfaceted kind.
pub fn check_and_update_facetiousness(
    tag: &str,
    desc: &mut DurableKindDescriptor,
    proposed: Option<Vec<String>>,
) -> Result<Option<Vec<String>>> {
    if desc.unfaceted == Some(true) {
        if proposed.is_some() {
            return Err(StoreError::FacetMismatch(format!(
                "defineDurableKindMulti called for unfaceted KindHandle \"{}\"",
                tag
            )));
        }
        return Ok(None);
    }

    if let Some(old_names) = desc.facets.clone() {
        let Some(proposed) = proposed else {
            return Err(StoreError::FacetMismatch(format!(
                "defineDurableKind called for faceted KindHandle \"{}\"",
                tag
            )));
        };
        let mut remaining: BTreeSet<String> = proposed.iter().cloned().collect();
        let mut names = Vec::new();
        let mut missing = Vec::new();
        for name in &old_names {
            if remaining.remove(name) {
                names.push(name.clone());
            } else {
                missing.push(name.clone());
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::FacetMismatch(format!(
                "durable kind \"{}\" facets ({}) is missing {} from original definition ({})",
                tag,
                proposed.join(","),
                missing.join(","),
                old_names.join(",")
            )));
        }
        names.extend(remaining);
        desc.facets = Some(names.clone());
        return Ok(Some(names));
    }

    match proposed {
        None => {
            desc.unfaceted = Some(true);
            Ok(None)
        }
        Some(names) => {
            desc.facets = Some(names.clone());
            Ok(Some(names))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn noop() -> Behavior {
        Behavior::new().method("ping", |_, _| Ok(Value::Null))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_assess_single_and_multi() {
        assert_eq!(assess_facetiousness(&noop()), Facetiousness::One);
        assert_eq!(assess_facetiousness(&Behavior::new()), Facetiousness::One);
        let kit = Behavior::new().facet("reader", noop()).facet("writer", noop());
        assert_eq!(assess_facetiousness(&kit), Facetiousness::Many);
    }

    #[test]
    fn test_assess_rejects_mixed_bags() {
        let mixed = noop().facet("reader", noop());
        assert_eq!(assess_facetiousness(&mixed), Facetiousness::Not);
        let with_data = noop().data("limit", 3);
        assert_eq!(assess_facetiousness(&with_data), Facetiousness::Not);
        let nested = Behavior::new().facet("outer", Behavior::new().facet("inner", noop()));
        assert_eq!(assess_facetiousness(&nested), Facetiousness::Not);
    }

    #[test]
    fn test_first_definition_records_shape() {
        let mut desc = DurableKindDescriptor::new(10, "single");
        assert_eq!(check_and_update_facetiousness("single", &mut desc, None).unwrap(), None);
        assert_eq!(desc.unfaceted, Some(true));

        let mut desc = DurableKindDescriptor::new(11, "kit");
        let committed =
            check_and_update_facetiousness("kit", &mut desc, Some(names(&["bar", "foo"]))).unwrap();
        assert_eq!(committed, Some(names(&["bar", "foo"])));
        assert_eq!(desc.facets, Some(names(&["bar", "foo"])));
    }

    #[test]
    fn test_unfaceted_cannot_become_faceted() {
        let mut desc = DurableKindDescriptor::new(10, "single");
        desc.unfaceted = Some(true);
        let err = check_and_update_facetiousness("single", &mut desc, Some(names(&["a"])));
        assert!(matches!(err, Err(StoreError::FacetMismatch(_))));

        let mut desc = DurableKindDescriptor::new(11, "kit");
        desc.facets = Some(names(&["a"]));
        let err = check_and_update_facetiousness("kit", &mut desc, None);
        assert!(matches!(err, Err(StoreError::FacetMismatch(_))));
    }

    #[test]
    fn test_dropping_a_facet_fails() {
        let mut desc = DurableKindDescriptor::new(11, "kit");
        desc.facets = Some(names(&["bar", "foo"]));
        let err = check_and_update_facetiousness("kit", &mut desc, Some(names(&["foo"])))
            .unwrap_err()
            .to_string();
        assert!(err.contains("is missing bar"), "{}", err);
        assert_eq!(desc.facets, Some(names(&["bar", "foo"])));
    }

    #[test]
    fn test_new_facets_are_appended_sorted() {
        let mut desc = DurableKindDescriptor::new(11, "kit");
        desc.facets = Some(names(&["bar", "foo"]));
        let committed = check_and_update_facetiousness(
            "kit",
            &mut desc,
            Some(names(&["zed", "foo", "bar", "baz"])),
        )
        .unwrap();
        assert_eq!(committed, Some(names(&["bar", "foo", "baz", "zed"])));
    }
}
