//! Tiny mappings files
//!
//! Both versions of the format list classes and their members under several namespaces. Member
//! descriptors are always written in terms of the first namespace. Mappings are applied from the
//! second-to-last namespace to the last one, so a two-namespace file maps its first column to its
//! second, and the usual `official intermediary named` file maps intermediary names to named ones.

use crate::jvm::model::ClassModel;
use crate::jvm::signatures::remap_descriptor;
use crate::transform::passes::remap::{apply_to_set, Remapping};
use crate::transform::{Category, Scope, TransformContext, TransformError, Transformer};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappingsError {
    #[error("could not read mappings: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a Tiny v1 or v2 mappings file")]
    UnknownFormat,

    #[error("mappings need at least two namespaces")]
    TooFewNamespaces,

    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Class or member with one name per namespace
struct Entry {
    /// Owner (in the first namespace) and descriptor, for members
    member: Option<(MemberKind, String, String)>,
    names: Vec<String>,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum MemberKind {
    Field,
    Method,
}

/// Parsed mappings, ready to apply
#[derive(Debug, Clone)]
pub struct Mappings {
    source_namespace: String,
    target_namespace: String,
    remapping: Remapping,
}

impl Mappings {
    pub fn from_file(path: &Path) -> Result<Mappings, MappingsError> {
        Mappings::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Mappings, MappingsError> {
        let mut lines = text.lines().enumerate();
        let (_, header) = lines.next().ok_or(MappingsError::UnknownFormat)?;
        let header: Vec<&str> = header.split('\t').collect();
        let (namespaces, entries) = match header.as_slice() {
            ["v1", namespaces @ ..] => (namespaces.to_vec(), parse_v1(lines, namespaces.len())?),
            ["tiny", "2", _, namespaces @ ..] => {
                (namespaces.to_vec(), parse_v2(lines, namespaces.len())?)
            }
            _ => return Err(MappingsError::UnknownFormat),
        };
        if namespaces.len() < 2 {
            return Err(MappingsError::TooFewNamespaces);
        }
        let to = namespaces.len() - 1;
        let from = to - 1;

        // Empty names mean "same as in the first namespace"
        let name_in = |entry: &Entry, namespace: usize| -> String {
            match entry.names.get(namespace) {
                Some(name) if !name.is_empty() => name.clone(),
                _ => entry.names[0].clone(),
            }
        };

        let mut classes_from: HashMap<String, String> = HashMap::new();
        let mut remapping = Remapping::new();
        for entry in entries.iter().filter(|entry| entry.member.is_none()) {
            let source = name_in(entry, from);
            remapping.rename_class(&source, &name_in(entry, to));
            classes_from.insert(entry.names[0].clone(), source);
        }

        let to_source = |name: &str| classes_from.get(name).cloned();
        for entry in &entries {
            let (kind, owner, descriptor) = match &entry.member {
                Some(member) => member,
                None => continue,
            };
            let owner = to_source(owner).unwrap_or_else(|| owner.clone());
            let descriptor = remap_descriptor(descriptor, &to_source);
            let (source, target) = (name_in(entry, from), name_in(entry, to));
            match kind {
                MemberKind::Field => remapping.rename_field(&owner, &source, &descriptor, &target),
                MemberKind::Method => {
                    remapping.rename_method(&owner, &source, &descriptor, &target)
                }
            }
        }

        Ok(Mappings {
            source_namespace: namespaces[from].to_owned(),
            target_namespace: namespaces[to].to_owned(),
            remapping,
        })
    }

    pub fn source_namespace(&self) -> &str {
        &self.source_namespace
    }

    pub fn target_namespace(&self) -> &str {
        &self.target_namespace
    }

    pub fn remapping(&self) -> &Remapping {
        &self.remapping
    }
}

fn malformed(line: usize, reason: &str) -> MappingsError {
    MappingsError::Malformed {
        line: line + 1,
        reason: reason.to_owned(),
    }
}

fn parse_v1<'a>(
    lines: impl Iterator<Item = (usize, &'a str)>,
    namespaces: usize,
) -> Result<Vec<Entry>, MappingsError> {
    let mut entries = vec![];
    for (number, line) in lines {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let columns: Vec<&str> = line.split('\t').collect();
        let entry = match columns.as_slice() {
            ["CLASS", names @ ..] if names.len() == namespaces => Entry {
                member: None,
                names: names.iter().map(|name| name.to_string()).collect(),
            },
            [kind @ ("FIELD" | "METHOD"), owner, descriptor, names @ ..]
                if names.len() == namespaces =>
            {
                let kind = if *kind == "FIELD" {
                    MemberKind::Field
                } else {
                    MemberKind::Method
                };
                Entry {
                    member: Some((kind, owner.to_string(), descriptor.to_string())),
                    names: names.iter().map(|name| name.to_string()).collect(),
                }
            }
            ["CLASS" | "FIELD" | "METHOD", ..] => {
                return Err(malformed(number, "wrong number of names"))
            }
            // Other line kinds (eg. parameter names) carry nothing to remap
            _ => continue,
        };
        entries.push(entry);
    }
    Ok(entries)
}

fn parse_v2<'a>(
    lines: impl Iterator<Item = (usize, &'a str)>,
    namespaces: usize,
) -> Result<Vec<Entry>, MappingsError> {
    let mut entries = vec![];
    let mut escaped = false;
    let mut current_class: Option<String> = None;
    for (number, line) in lines {
        if line.is_empty() {
            continue;
        }
        let depth = line.chars().take_while(|c| *c == '\t').count();
        let columns: Vec<&str> = line[depth..].split('\t').collect();
        let names = |names: &[&str]| -> Vec<String> {
            names
                .iter()
                .map(|name| if escaped { unescape(name) } else { name.to_string() })
                .collect()
        };

        match (depth, columns.as_slice()) {
            (0, ["c", class_names @ ..]) => {
                if class_names.len() != namespaces {
                    return Err(malformed(number, "wrong number of class names"));
                }
                let class_names = names(class_names);
                current_class = Some(class_names[0].clone());
                entries.push(Entry {
                    member: None,
                    names: class_names,
                });
            }
            (1, [kind @ ("f" | "m"), descriptor, member_names @ ..]) => {
                let owner = current_class
                    .clone()
                    .ok_or_else(|| malformed(number, "member outside of a class"))?;
                if member_names.len() != namespaces {
                    return Err(malformed(number, "wrong number of member names"));
                }
                let kind = if *kind == "f" {
                    MemberKind::Field
                } else {
                    MemberKind::Method
                };
                entries.push(Entry {
                    member: Some((kind, owner, descriptor.to_string())),
                    names: names(member_names),
                });
            }
            // Header properties come before the first class
            (1, ["escaped-names"]) if current_class.is_none() => escaped = true,
            // Properties, comments, parameters, and local variables
            _ => (),
        }
    }
    Ok(entries)
}

fn unescape(name: &str) -> String {
    let mut output = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            output.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => output.push('\n'),
            Some('r') => output.push('\r'),
            Some('t') => output.push('\t'),
            Some('0') => output.push('\0'),
            Some(other) => output.push(other),
            None => output.push('\\'),
        }
    }
    output
}

/// Renames the class set according to a mappings file
pub struct MappingsRemapper;

impl Transformer for MappingsRemapper {
    fn name(&self) -> &'static str {
        "mappings-remapper"
    }

    fn category(&self) -> Category {
        Category::Renaming
    }

    fn description(&self) -> &'static str {
        "Renames classes, fields, and methods using a Tiny mappings file"
    }

    fn scope(&self) -> Scope {
        Scope::ClassSet
    }

    fn transform_class_set(
        &self,
        classes: &mut [ClassModel],
        ctx: &mut TransformContext,
    ) -> Result<Vec<bool>, TransformError> {
        let mappings = match &ctx.settings.mappings {
            Some(mappings) => mappings.clone(),
            None => {
                return Err(TransformError::TransformFailure(String::from(
                    "no mappings were given",
                )))
            }
        };
        let old_names: Vec<String> = classes.iter().map(|class| class.name.clone()).collect();
        let changed = apply_to_set(mappings.remapping(), classes, ctx.index, ctx.hierarchy)?;
        for (old_name, class) in old_names.iter().zip(classes.iter()) {
            if *old_name != class.name {
                ctx.log(
                    old_name,
                    format!(
                        "renamed class to {} ({} -> {})",
                        class.name,
                        mappings.source_namespace(),
                        mappings.target_namespace()
                    ),
                );
            }
        }
        for (old_name, changed) in old_names.iter().zip(&changed) {
            if *changed {
                ctx.log(old_name, "applied mappings");
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ClassHierarchy;
    use crate::engine::Settings;
    use crate::jvm::model::{FieldModel, MethodModel};
    use crate::jvm::{FieldAccessFlags, MethodAccessFlags};
    use crate::transform::ClassIndex;
    use std::sync::Arc;

    #[test]
    fn v1_maps_the_last_two_namespaces() {
        let mappings = Mappings::parse(
            "v1\tofficial\tintermediary\tnamed\n\
             CLASS\ta\tclass_1\tcom/x/Widget\n\
             FIELD\ta\tLa;\tb\tfield_2\tparent\n\
             METHOD\ta\t(La;)V\tc\tmethod_3\tattach\n",
        )
        .unwrap();
        assert_eq!(mappings.source_namespace(), "intermediary");
        assert_eq!(mappings.target_namespace(), "named");

        let mut expected = Remapping::new();
        expected.rename_class("class_1", "com/x/Widget");
        expected.rename_field("class_1", "field_2", "Lclass_1;", "parent");
        expected.rename_method("class_1", "method_3", "(Lclass_1;)V", "attach");
        assert_eq!(mappings.remapping(), &expected);
    }

    #[test]
    fn v2_skips_comments_and_parameters() {
        let mappings = Mappings::parse(
            "tiny\t2\t0\tobf\tnamed\n\
             c\ta\tcom/x/Widget\n\
             \tc\tA widget\n\
             \tf\tI\tb\tsize\n\
             \tm\t(I)V\tc\tresize\n\
             \t\tp\t1\t\twidth\n",
        )
        .unwrap();
        let mut expected = Remapping::new();
        expected.rename_class("a", "com/x/Widget");
        expected.rename_field("a", "b", "I", "size");
        expected.rename_method("a", "c", "(I)V", "resize");
        assert_eq!(mappings.remapping(), &expected);
    }

    #[test]
    fn bad_files_are_rejected() {
        assert!(matches!(
            Mappings::parse("hello\n"),
            Err(MappingsError::UnknownFormat)
        ));
        assert!(matches!(
            Mappings::parse("v1\tonly\n"),
            Err(MappingsError::TooFewNamespaces)
        ));
        assert!(matches!(
            Mappings::parse("v1\ta\tb\nCLASS\tx\n"),
            Err(MappingsError::Malformed { line: 2, .. })
        ));
    }

    #[test]
    fn remapper_applies_mappings_to_the_set() {
        let mut class = ClassModel::new("a", Some("java/lang/Object"));
        class
            .fields
            .push(FieldModel::new(FieldAccessFlags::PRIVATE, "b", "I"));
        class
            .methods
            .push(MethodModel::new(MethodAccessFlags::ABSTRACT, "c", "(I)V"));
        let mut classes = vec![class];
        let index: ClassIndex = classes
            .iter()
            .map(|class| (class.name.clone(), Arc::new(class.clone())))
            .collect();
        let hierarchy = ClassHierarchy::from_classes(classes.iter());

        let mappings = Mappings::parse(
            "tiny\t2\t0\tobf\tnamed\nc\ta\tcom/x/Widget\n\tf\tI\tb\tsize\n\tm\t(I)V\tc\tresize\n",
        )
        .unwrap();
        let settings = Settings {
            mappings: Some(Arc::new(mappings)),
            ..Settings::default()
        };
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        let changed = MappingsRemapper
            .transform_class_set(&mut classes, &mut ctx)
            .unwrap();
        assert_eq!(changed, vec![true]);
        assert_eq!(classes[0].name, "com/x/Widget");
        assert_eq!(classes[0].fields[0].name, "size");
        assert_eq!(classes[0].methods[0].name, "resize");
        assert_eq!(ctx.take_log("a").len(), 2);
    }
}
