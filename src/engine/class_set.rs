use crate::analysis::ClassHierarchy;
use crate::jvm::model::ClassModel;
use crate::transform::ClassIndex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Directories some archive layouts keep their classes under
const CLASS_PREFIXES: [&str; 2] = ["BOOT-INF/classes/", "WEB-INF/classes/"];

/// A class loaded from the archive, along with where it came from
#[derive(Debug, Clone)]
pub struct LoadedClass {
    /// Position of the entry in the archive
    pub entry: usize,

    /// Position of the class report
    pub report: usize,

    /// Name the class had when it was loaded
    pub original_name: String,

    /// Current state, shared with the index while a transformer runs
    pub class: Arc<ClassModel>,

    /// Some transformer changed the class
    pub changed: bool,
}

/// Classes being transformed, in archive order
#[derive(Debug, Default)]
pub struct ClassSet {
    pub classes: Vec<LoadedClass>,

    /// Class names taken by archive entries, whether or not they loaded
    pub reserved_names: BTreeSet<String>,
}

impl ClassSet {
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Snapshot of the current classes, keyed by name
    ///
    /// The snapshot shares the class models, so it costs one pointer per class. Replacing a class
    /// in the set afterwards does not affect the snapshot.
    pub fn index(&self) -> ClassIndex {
        self.classes
            .iter()
            .map(|loaded| (loaded.class.name.clone(), loaded.class.clone()))
            .collect()
    }

    pub fn hierarchy(&self) -> ClassHierarchy {
        ClassHierarchy::from_classes(self.classes.iter().map(|loaded| loaded.class.as_ref()))
    }

    /// Replace a class with its transformed version
    pub fn replace(&mut self, position: usize, class: ClassModel) {
        let loaded = &mut self.classes[position];
        loaded.class = Arc::new(class);
        loaded.changed = true;
    }

    /// Reserve the class names a `.class` entry stands for
    ///
    /// An entry under a prefix such as `BOOT-INF/classes/` reserves the name both with and without
    /// the prefix.
    pub fn reserve_entry(&mut self, entry_name: &str) {
        let stem = match entry_name.strip_suffix(".class") {
            Some(stem) => stem,
            None => return,
        };
        for prefix in CLASS_PREFIXES {
            if let Some(name) = stem.strip_prefix(prefix) {
                self.reserved_names.insert(name.to_owned());
            }
        }
        self.reserved_names.insert(stem.to_owned());
    }

    /// Entry name for a class, following renames
    ///
    /// Classes are usually stored as `<name>.class`, possibly under a prefix (eg.
    /// `BOOT-INF/classes/`), and that prefix is kept. Entries not named after their class keep
    /// their name.
    pub fn entry_name(original_entry: &str, loaded: &LoadedClass) -> String {
        let name = &loaded.class.name;
        if *name == loaded.original_name {
            return original_entry.to_owned();
        }
        match original_entry.strip_suffix(&format!("{}.class", loaded.original_name)) {
            Some(prefix) => format!("{}{}.class", prefix, name),
            None => original_entry.to_owned(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn loaded(original_name: &str, name: &str) -> LoadedClass {
        LoadedClass {
            entry: 0,
            report: 0,
            original_name: original_name.to_owned(),
            class: Arc::new(ClassModel::new(name, Some("java/lang/Object"))),
            changed: original_name != name,
        }
    }

    #[test]
    fn renamed_entries_keep_their_prefix() {
        let renamed = loaded("a/a", "a/Class1");
        assert_eq!(ClassSet::entry_name("a/a.class", &renamed), "a/Class1.class");
        assert_eq!(
            ClassSet::entry_name("BOOT-INF/classes/a/a.class", &renamed),
            "BOOT-INF/classes/a/Class1.class"
        );
        assert_eq!(ClassSet::entry_name("weird.class", &renamed), "weird.class");

        let kept = loaded("a/B", "a/B");
        assert_eq!(ClassSet::entry_name("x/y.class", &kept), "x/y.class");
    }

    #[test]
    fn snapshots_do_not_follow_replacements() {
        let mut set = ClassSet {
            classes: vec![loaded("a/A", "a/A")],
            ..ClassSet::default()
        };
        let index = set.index();
        set.replace(0, ClassModel::new("a/B", Some("java/lang/Object")));
        assert!(index.contains_key("a/A"));
        assert!(set.index().contains_key("a/B"));
        assert!(set.classes[0].changed);
    }

    #[test]
    fn entries_reserve_their_class_names() {
        let mut set = ClassSet::default();
        set.reserve_entry("p/Class1.class");
        set.reserve_entry("BOOT-INF/classes/q/A.class");
        set.reserve_entry("META-INF/MANIFEST.MF");
        let reserved: Vec<&str> = set.reserved_names.iter().map(String::as_str).collect();
        assert_eq!(reserved, vec!["BOOT-INF/classes/q/A", "p/Class1", "q/A"]);
    }
}
