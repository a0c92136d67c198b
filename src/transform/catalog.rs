use crate::transform::passes;
use crate::transform::{Category, Transformer};

/// Registry of transformers, by name
///
/// Iteration follows registration order, which is also the order a category selector expands to.
pub struct Catalog {
    transformers: Vec<Box<dyn Transformer>>,
}

impl Catalog {
    /// Catalog without any transformers
    pub fn empty() -> Catalog {
        Catalog {
            transformers: vec![],
        }
    }

    /// Add a transformer, replacing any already registered under the same name
    pub fn register(&mut self, transformer: Box<dyn Transformer>) {
        match self
            .transformers
            .iter_mut()
            .find(|existing| existing.name() == transformer.name())
        {
            Some(existing) => *existing = transformer,
            None => self.transformers.push(transformer),
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Transformer> {
        self.transformers
            .iter()
            .find(|transformer| transformer.name() == name)
            .map(|transformer| transformer.as_ref())
    }

    pub fn in_category(&self, category: Category) -> impl Iterator<Item = &dyn Transformer> + '_ {
        self.iter()
            .filter(move |transformer| transformer.category() == category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Transformer> + '_ {
        self.transformers.iter().map(|transformer| transformer.as_ref())
    }
}

/// Catalog of the built-in transformers
impl Default for Catalog {
    fn default() -> Self {
        let mut catalog = Catalog::empty();
        catalog.register(Box::new(passes::NopRemoval));
        catalog.register(Box::new(passes::MetadataSanitization));
        catalog.register(Box::new(passes::ParameterNames));
        catalog.register(Box::new(passes::ControlFlowNormalization));
        catalog.register(Box::new(passes::StringDecryption));
        catalog.register(Box::new(passes::ReflectionResolution));
        catalog.register(Box::new(passes::AntiTamperRemoval));
        catalog.register(Box::new(passes::RenamingNormalization));
        catalog.register(Box::new(passes::MappingsRemapper));
        catalog
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Marker;

    impl Transformer for Marker {
        fn name(&self) -> &'static str {
            "nop-removal"
        }

        fn category(&self) -> Category {
            Category::Renaming
        }

        fn description(&self) -> &'static str {
            "stands in for nop-removal"
        }
    }

    #[test]
    fn every_category_has_a_transformer() {
        let catalog = Catalog::default();
        for category in Category::ALL {
            assert!(catalog.in_category(category).next().is_some());
        }
        assert_eq!(catalog.iter().count(), 9);
    }

    #[test]
    fn registering_replaces_by_name() {
        let mut catalog = Catalog::default();
        catalog.register(Box::new(Marker));
        assert_eq!(catalog.iter().count(), 9);
        assert_eq!(catalog.get("nop-removal").unwrap().category(), Category::Renaming);
        assert!(catalog.get("missing").is_none());
    }
}
