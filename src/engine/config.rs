use crate::engine::EngineError;
use crate::transform::interpreter::DEFAULT_HEAP_BUDGET;
use crate::transform::passes::Mappings;
use crate::transform::{Catalog, Category, Transformer};
use std::sync::Arc;

const REMAPPER: &str = "mappings-remapper";

/// Knobs shared by all transformers
#[derive(Debug, Clone)]
pub struct Settings {
    /// Instructions the sandboxed interpreter may execute for one evaluation
    pub step_budget: usize,

    /// Nested calls the sandboxed interpreter may make
    pub call_depth: usize,

    /// Array elements and string characters the sandboxed interpreter may allocate per evaluation
    pub heap_budget: usize,

    /// Dataflow worklist steps allowed per basic block
    pub dataflow_factor: usize,

    /// Names to apply with `mappings-remapper`
    pub mappings: Option<Arc<Mappings>>,

    /// Names at most this long (or illegal, or reserved) count as obfuscated
    pub min_name_length: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            step_budget: 100_000,
            call_depth: 16,
            heap_budget: DEFAULT_HEAP_BUDGET,
            dataflow_factor: 32,
            mappings: None,
            min_name_length: 2,
        }
    }
}

/// Everything needed to run a pipeline, apart from the archive itself
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Transformer or category names, in the order they should run
    pub selectors: Vec<String>,

    /// Transform the classes of class-scoped passes on the `rayon` thread pool
    pub parallel: bool,

    /// Verify classes before and after the run
    pub verify: bool,

    /// Replace changed classes that end up invalid with their original bytes
    pub discard_invalid: bool,

    /// Drop the signature files of signed jars, which rewritten classes invalidate
    pub strip_signatures: bool,

    pub settings: Settings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            selectors: vec![],
            parallel: false,
            verify: true,
            discard_invalid: false,
            strip_signatures: false,
            settings: Settings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new(selectors: impl IntoIterator<Item = impl Into<String>>) -> PipelineConfig {
        PipelineConfig {
            selectors: selectors.into_iter().map(Into::into).collect(),
            ..PipelineConfig::default()
        }
    }

    /// Turn the selectors into the ordered list of transformers to run
    ///
    /// A category selects every transformer in it, in catalog order (leaving out
    /// `mappings-remapper` when there are no mappings). Any selector which is neither a transformer
    /// nor a category fails the whole configuration.
    pub fn resolve<'c>(
        &self,
        catalog: &'c Catalog,
    ) -> Result<Vec<&'c dyn Transformer>, EngineError> {
        let mut transformers = vec![];
        for selector in &self.selectors {
            if let Some(transformer) = catalog.get(selector) {
                transformers.push(transformer);
            } else if let Some(category) = Category::from_name(selector) {
                // Without mappings there is nothing for the remapper to do
                let has_mappings = self.settings.mappings.is_some();
                transformers.extend(
                    catalog
                        .in_category(category)
                        .filter(|transformer| has_mappings || transformer.name() != REMAPPER),
                );
            } else {
                return Err(EngineError::UnknownTransformer(selector.clone()));
            }
        }
        if transformers
            .iter()
            .any(|transformer| transformer.name() == REMAPPER)
            && self.settings.mappings.is_none()
        {
            return Err(EngineError::Config(String::from(
                "mappings-remapper needs a mappings file",
            )));
        }
        Ok(transformers)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn selectors_expand_in_order() {
        let catalog = Catalog::default();
        let config = PipelineConfig::new(["string-decryption", "generic-cleanup"]);
        let names: Vec<&str> = config
            .resolve(&catalog)
            .unwrap()
            .iter()
            .map(|transformer| transformer.name())
            .collect();
        assert_eq!(
            names,
            vec![
                "string-decryption",
                "nop-removal",
                "metadata-sanitization",
                "parameter-names"
            ]
        );
    }

    #[test]
    fn unknown_selectors_fail() {
        let catalog = Catalog::default();
        let config = PipelineConfig::new(["nop-removal", "unknown-pass"]);
        assert!(matches!(
            config.resolve(&catalog),
            Err(EngineError::UnknownTransformer(name)) if name == "unknown-pass"
        ));

        let config = PipelineConfig::new(["mappings-remapper"]);
        assert!(matches!(config.resolve(&catalog), Err(EngineError::Config(_))));

        let config = PipelineConfig::new(["renaming"]);
        assert_eq!(config.resolve(&catalog).unwrap().len(), 1);
    }
}
