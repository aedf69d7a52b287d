//! Opcode catalog.
//!
//! A `Catalog` is the immutable table of instruction templates of one architecture. It
//! is built once by the backend that owns it and only read afterwards.
//!
//! Templates are filed into buckets keyed by discriminant bits. A template whose mask
//! leaves some discriminant bits open is filed into every bucket it can match. Lookup
//! tests the templates of a bucket in registration order and the first match wins, so a
//! template that refines another must be registered before it. `Catalog::build` checks
//! that every template covers its word exactly and that any two templates sharing a
//! bucket are either separable or form one of the architecture's named overlap rules.

use std::collections::HashMap;

use crate::error::CatalogError;

/// An instruction template as far as the catalog is concerned.
pub trait Template {
    /// Unique name used by the assembler to look the template up.
    fn name(&self) -> &str;

    /// All discriminant bucket keys this template may appear under.
    fn bucket_keys(&self) -> Vec<usize>;

    /// True if some instruction matches both `self` and `other`.
    fn overlaps(&self, other: &Self) -> bool;

    /// Checks that fixed bits and operand fields describe the instruction exactly.
    fn check_coverage(&self) -> Result<(), CatalogError>;
}

/// A known, intentional overlap between an earlier and a later template.
pub struct OverlapRule<T> {
    pub name: &'static str,
    pub allows: fn(earlier: &T, later: &T) -> bool,
}

/// An immutable, bucketed collection of templates.
pub struct Catalog<T> {
    templates: Vec<T>,
    by_name: HashMap<String, usize>,
    buckets: Vec<Vec<usize>>,
}

impl<T: Template> Catalog<T> {
    /// Files `templates` in order into `num_buckets` buckets and validates them.
    pub fn build(
        templates: Vec<T>,
        num_buckets: usize,
        rules: &[OverlapRule<T>],
    ) -> Result<Self, CatalogError> {
        let mut by_name = HashMap::with_capacity(templates.len());
        let mut buckets = vec![Vec::new(); num_buckets];
        for (idx, t) in templates.iter().enumerate() {
            t.check_coverage()?;
            if by_name.insert(t.name().to_string(), idx).is_some() {
                return Err(CatalogError::Duplicate(t.name().to_string()));
            }
            for key in t.bucket_keys() {
                buckets[key].push(idx);
            }
        }
        let catalog = Self {
            templates,
            by_name,
            buckets,
        };
        catalog.check_separability(rules)?;
        tracing::debug!(
            "catalog built: {} templates, {} buckets",
            catalog.templates.len(),
            num_buckets
        );
        Ok(catalog)
    }

    fn check_separability(&self, rules: &[OverlapRule<T>]) -> Result<(), CatalogError> {
        for bucket in &self.buckets {
            for (n, &i) in bucket.iter().enumerate() {
                let earlier = &self.templates[i];
                for &j in &bucket[n + 1..] {
                    let later = &self.templates[j];
                    if !earlier.overlaps(later) {
                        continue;
                    }
                    match rules.iter().find(|r| (r.allows)(earlier, later)) {
                        Some(rule) => tracing::trace!(
                            "{} shadows {} ({})",
                            earlier.name(),
                            later.name(),
                            rule.name
                        ),
                        None => {
                            return Err(CatalogError::Ambiguous {
                                first: earlier.name().to_string(),
                                second: later.name().to_string(),
                            })
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.by_name.get(name).map(|&i| &self.templates[i])
    }

    /// First template in bucket `key` accepted by `pred`.
    pub fn find(&self, key: usize, mut pred: impl FnMut(&T) -> bool) -> Option<&T> {
        self.buckets
            .get(key)?
            .iter()
            .map(|&i| &self.templates[i])
            .find(|t| pred(t))
    }

    /// First template in bucket `key` for which `f` produces a value.
    pub fn find_map<R>(&self, key: usize, f: impl FnMut(&T) -> Option<R>) -> Option<R> {
        self.buckets
            .get(key)?
            .iter()
            .map(|&i| &self.templates[i])
            .find_map(f)
    }

    /// Templates in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.templates.iter()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct T {
        name: &'static str,
        mask: u8,
        value: u8,
    }

    impl Template for T {
        fn name(&self) -> &str {
            self.name
        }
        fn bucket_keys(&self) -> Vec<usize> {
            (0..4usize)
                .filter(|&k| (k as u8 ^ (self.value >> 6)) & (self.mask >> 6) == 0)
                .collect()
        }
        fn overlaps(&self, other: &Self) -> bool {
            let m = self.mask & other.mask;
            self.value & m == other.value & m
        }
        fn check_coverage(&self) -> Result<(), CatalogError> {
            Ok(())
        }
    }

    fn t(name: &'static str, mask: u8, value: u8) -> T {
        T { name, mask, value }
    }

    #[test]
    fn dont_care_bits_fill_several_buckets() {
        let cat = Catalog::build(vec![t("a", 0x80, 0x80), t("b", 0xc0, 0x00)], 4, &[]).unwrap();
        assert_eq!(cat.find(2, |_| true).unwrap().name, "a");
        assert_eq!(cat.find(3, |_| true).unwrap().name, "a");
        assert_eq!(cat.find(0, |_| true).unwrap().name, "b");
        assert!(cat.find(1, |_| true).is_none());
    }

    #[test]
    fn ambiguity_is_rejected_without_a_rule() {
        let err = Catalog::build(vec![t("x_special", 0xff, 0x41), t("x", 0xc0, 0x40)], 4, &[])
            .err()
            .unwrap();
        assert_eq!(
            err,
            CatalogError::Ambiguous {
                first: "x_special".into(),
                second: "x".into()
            }
        );
    }

    #[test]
    fn rules_admit_intentional_overlaps_in_order() {
        let rules = [OverlapRule::<T> {
            name: "special before general",
            allows: |a, b| a.name.strip_suffix("_special") == Some(b.name),
        }];
        let cat =
            Catalog::build(vec![t("x_special", 0xff, 0x41), t("x", 0xc0, 0x40)], 4, &rules)
                .unwrap();
        let hit = |v: u8| cat.find(1, |c| v & c.mask == c.value).unwrap().name;
        assert_eq!(hit(0x41), "x_special");
        assert_eq!(hit(0x42), "x");
        // the reverse order is not covered by the rule
        assert!(
            Catalog::build(vec![t("x", 0xc0, 0x40), t("x_special", 0xff, 0x41)], 4, &rules)
                .is_err()
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = Catalog::build(vec![t("a", 0xc0, 0x00), t("a", 0xc0, 0x40)], 4, &[])
            .err()
            .unwrap();
        assert_eq!(err, CatalogError::Duplicate("a".into()));
    }
}
