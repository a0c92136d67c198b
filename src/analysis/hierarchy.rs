use crate::jvm::model::ClassModel;
use crate::jvm::RefType;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// What the hierarchy knows about a class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub is_interface: bool,
}

/// Superclass and interface edges between known classes
///
/// The hierarchy only knows about the classes it is given plus a small set of library classes
/// that show up all over obfuscated code. Questions about other classes have no definite answer,
/// which callers decide how to treat.
#[derive(Debug, Clone)]
pub struct ClassHierarchy {
    classes: HashMap<String, ClassInfo>,
}

/// (name, superclass, interfaces, is interface)
const JAVA_LIBRARY_TYPES: &[(&str, Option<&str>, &[&str], bool)] = &[
    ("java/lang/Object", None, &[], false),
    ("java/io/Serializable", Some("java/lang/Object"), &[], true),
    ("java/lang/Cloneable", Some("java/lang/Object"), &[], true),
    ("java/lang/Comparable", Some("java/lang/Object"), &[], true),
    ("java/lang/CharSequence", Some("java/lang/Object"), &[], true),
    ("java/lang/Runnable", Some("java/lang/Object"), &[], true),
    (
        "java/lang/String",
        Some("java/lang/Object"),
        &["java/io/Serializable", "java/lang/Comparable", "java/lang/CharSequence"],
        false,
    ),
    ("java/lang/Class", Some("java/lang/Object"), &["java/io/Serializable"], false),
    ("java/lang/Number", Some("java/lang/Object"), &["java/io/Serializable"], false),
    ("java/lang/Integer", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    ("java/lang/Long", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    ("java/lang/Float", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    ("java/lang/Double", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    ("java/lang/Short", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    ("java/lang/Byte", Some("java/lang/Number"), &["java/lang/Comparable"], false),
    ("java/lang/Boolean", Some("java/lang/Object"), &["java/io/Serializable"], false),
    ("java/lang/Character", Some("java/lang/Object"), &["java/io/Serializable"], false),
    ("java/lang/StringBuilder", Some("java/lang/Object"), &["java/lang/CharSequence"], false),
    ("java/lang/Throwable", Some("java/lang/Object"), &["java/io/Serializable"], false),
    ("java/lang/Exception", Some("java/lang/Throwable"), &[], false),
    ("java/lang/Error", Some("java/lang/Throwable"), &[], false),
    ("java/lang/RuntimeException", Some("java/lang/Exception"), &[], false),
    ("java/lang/IllegalStateException", Some("java/lang/RuntimeException"), &[], false),
    ("java/lang/IllegalArgumentException", Some("java/lang/RuntimeException"), &[], false),
    ("java/lang/NullPointerException", Some("java/lang/RuntimeException"), &[], false),
    ("java/lang/ArithmeticException", Some("java/lang/RuntimeException"), &[], false),
    ("java/lang/SecurityException", Some("java/lang/RuntimeException"), &[], false),
    ("java/lang/reflect/Method", Some("java/lang/Object"), &[], false),
    ("java/lang/invoke/MethodHandle", Some("java/lang/Object"), &[], false),
    ("java/lang/invoke/MethodType", Some("java/lang/Object"), &["java/io/Serializable"], false),
];

pub const OBJECT: &str = "java/lang/Object";

impl ClassHierarchy {
    /// Hierarchy containing only the well-known library classes
    pub fn new() -> ClassHierarchy {
        let mut classes = HashMap::new();
        for (name, super_name, interfaces, is_interface) in JAVA_LIBRARY_TYPES {
            classes.insert(
                name.to_string(),
                ClassInfo {
                    super_name: super_name.map(str::to_owned),
                    interfaces: interfaces.iter().map(|i| i.to_string()).collect(),
                    is_interface: *is_interface,
                },
            );
        }
        ClassHierarchy { classes }
    }

    pub fn from_classes<'a>(classes: impl IntoIterator<Item = &'a ClassModel>) -> ClassHierarchy {
        let mut hierarchy = ClassHierarchy::new();
        for class in classes {
            hierarchy.insert(class);
        }
        hierarchy
    }

    pub fn insert(&mut self, class: &ClassModel) {
        self.classes.insert(
            class.name.clone(),
            ClassInfo {
                super_name: class.super_name.clone(),
                interfaces: class.interfaces.clone(),
                is_interface: class.is_interface(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn is_interface(&self, name: &str) -> bool {
        self.classes.get(name).map_or(false, |info| info.is_interface)
    }

    /// Chain of superclasses, starting with the class itself
    ///
    /// The chain stops at the first class that isn't known (or at a cycle, which malformed
    /// input can produce).
    pub fn superclasses(&self, name: &str) -> Vec<String> {
        let mut chain = vec![name.to_owned()];
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = name;
        while let Some(super_name) = self.classes.get(current).and_then(|i| i.super_name.as_deref())
        {
            if !seen.insert(super_name) {
                break;
            }
            chain.push(super_name.to_owned());
            current = super_name;
        }
        chain
    }

    /// Every known supertype (classes and interfaces, transitively), excluding the class itself
    pub fn supertypes(&self, name: &str) -> Vec<String> {
        let mut to_visit = vec![name];
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(name);
        let mut supertypes = vec![];
        while let Some(class) = to_visit.pop() {
            if let Some(info) = self.classes.get(class) {
                for parent in info.super_name.iter().chain(info.interfaces.iter()) {
                    if seen.insert(parent) {
                        supertypes.push(parent.clone());
                        to_visit.push(parent);
                    }
                }
            }
        }
        supertypes
    }

    /// Is `sub_type` a subclass (or implementor) of `super_type`?
    ///
    /// `None` means the answer depends on classes that aren't known.
    pub fn is_subclass(&self, sub_type: &str, super_type: &str) -> Option<bool> {
        if sub_type == super_type || super_type == OBJECT {
            return Some(true);
        }
        let mut to_visit = vec![sub_type];
        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(sub_type);
        let mut complete = true;
        while let Some(class) = to_visit.pop() {
            if class == super_type {
                return Some(true);
            }
            match self.classes.get(class) {
                None => complete = false,
                Some(info) => {
                    for parent in info.super_name.iter().chain(info.interfaces.iter()) {
                        if seen.insert(parent) {
                            to_visit.push(parent);
                        }
                    }
                }
            }
        }
        if complete {
            Some(false)
        } else {
            None
        }
    }

    /// Assignability of reference types named as in `CONSTANT_Class_info` (arrays are
    /// descriptors), following `isJavaAssignable` from the JVM specification
    ///
    /// Unknown classes are assumed assignable. Interfaces are treated like `java/lang/Object`,
    /// the same way the JVM type checker treats them.
    pub fn is_assignable(&self, sub_type: &str, super_type: &str) -> bool {
        if sub_type == super_type || super_type == OBJECT {
            return true;
        }
        match (
            RefType::from_class_constant_name(sub_type),
            RefType::from_class_constant_name(super_type),
        ) {
            (Ok(sub), Ok(sup)) => self.is_ref_assignable(&sub, &sup),
            _ => false,
        }
    }

    fn is_ref_assignable(&self, sub_type: &RefType, super_type: &RefType) -> bool {
        match (sub_type, super_type) {
            (RefType::PrimitiveArray(_) | RefType::ObjectArray(_), RefType::Object(object)) => {
                is_array_super_type(object)
            }
            (RefType::PrimitiveArray(arr1), RefType::PrimitiveArray(arr2)) => arr1 == arr2,
            (RefType::PrimitiveArray(arr1), RefType::ObjectArray(arr2)) => {
                match arr1.additional_dimensions.cmp(&arr2.additional_dimensions) {
                    Ordering::Less | Ordering::Equal => false,
                    Ordering::Greater => is_array_super_type(&arr2.element_type),
                }
            }
            (RefType::ObjectArray(arr1), RefType::ObjectArray(arr2)) => {
                match arr1.additional_dimensions.cmp(&arr2.additional_dimensions) {
                    Ordering::Less => false,
                    Ordering::Equal => self.is_assignable(&arr1.element_type, &arr2.element_type),
                    Ordering::Greater => is_array_super_type(&arr2.element_type),
                }
            }
            (RefType::Object(cls1), RefType::Object(cls2)) => {
                if self.is_interface(cls2) {
                    return true;
                }
                self.is_subclass(cls1, cls2).unwrap_or(true)
            }
            _ => false,
        }
    }

    /// Closest common superclass of two reference types (arrays included)
    ///
    /// Falls back to `java/lang/Object` when the hierarchy runs out.
    pub fn common_super_class(&self, type1: &str, type2: &str) -> String {
        if type1 == type2 {
            return type1.to_owned();
        }
        if let (Ok(RefType::ObjectArray(arr1)), Ok(RefType::ObjectArray(arr2))) = (
            RefType::from_class_constant_name(type1),
            RefType::from_class_constant_name(type2),
        ) {
            if arr1.additional_dimensions == arr2.additional_dimensions {
                let element = self.common_super_class(&arr1.element_type, &arr2.element_type);
                let mut name = "[".repeat(arr1.additional_dimensions + 1);
                name.push('L');
                name.push_str(&element);
                name.push(';');
                return name;
            }
            return OBJECT.to_owned();
        }
        if type1.starts_with('[') || type2.starts_with('[') {
            return OBJECT.to_owned();
        }
        if self.is_interface(type1) || self.is_interface(type2) {
            return OBJECT.to_owned();
        }

        let chain1 = self.superclasses(type1);
        let chain2: HashSet<String> = self.superclasses(type2).into_iter().collect();
        chain1
            .into_iter()
            .find(|class| chain2.contains(class))
            .unwrap_or_else(|| OBJECT.to_owned())
    }
}

impl Default for ClassHierarchy {
    fn default() -> Self {
        ClassHierarchy::new()
    }
}

/// Arrays have a small, finite set of super types
fn is_array_super_type(super_type: &str) -> bool {
    super_type == OBJECT || super_type == "java/lang/Cloneable" || super_type == "java/io/Serializable"
}

#[cfg(test)]
mod test {
    use super::*;

    fn hierarchy() -> ClassHierarchy {
        let mut hierarchy = ClassHierarchy::new();
        let mut base = ClassModel::new("a/Base", Some(OBJECT));
        base.interfaces.push(String::from("java/lang/Runnable"));
        hierarchy.insert(&base);
        hierarchy.insert(&ClassModel::new("a/Left", Some("a/Base")));
        hierarchy.insert(&ClassModel::new("a/Right", Some("a/Base")));
        hierarchy.insert(&ClassModel::new("a/Orphan", Some("lib/Unknown")));
        hierarchy
    }

    #[test]
    fn classes() {
        let hierarchy = hierarchy();
        assert!(hierarchy.is_assignable("a/Left", "a/Base"));
        assert!(!hierarchy.is_assignable("a/Base", "a/Left"));
        assert!(!hierarchy.is_assignable("a/Left", "a/Right"));
        assert!(hierarchy.is_assignable("java/lang/Integer", "java/lang/Number"));
        assert_eq!(hierarchy.is_subclass("a/Orphan", "a/Base"), None);
        assert!(hierarchy.is_assignable("a/Orphan", "a/Base"), "unknown is lenient");
        assert_eq!(
            hierarchy.supertypes("a/Left"),
            vec!["a/Base", "java/lang/Object", "java/lang/Runnable"]
        );
    }

    #[test]
    fn arrays() {
        let hierarchy = hierarchy();
        assert!(hierarchy.is_assignable("[I", OBJECT));
        assert!(hierarchy.is_assignable("[I", "java/lang/Cloneable"));
        assert!(!hierarchy.is_assignable("[I", "[J"));
        assert!(hierarchy.is_assignable("[[I", "[Ljava/lang/Object;"));
        assert!(hierarchy.is_assignable("[La/Left;", "[La/Base;"));
        assert!(!hierarchy.is_assignable("[La/Base;", "[La/Left;"));
        assert!(!hierarchy.is_assignable("[I", "a/Base"));
    }

    #[test]
    fn common_super_classes() {
        let hierarchy = hierarchy();
        assert_eq!(hierarchy.common_super_class("a/Left", "a/Right"), "a/Base");
        assert_eq!(hierarchy.common_super_class("a/Left", "a/Base"), "a/Base");
        assert_eq!(
            hierarchy.common_super_class("java/lang/Integer", "java/lang/Long"),
            "java/lang/Number"
        );
        assert_eq!(hierarchy.common_super_class("a/Left", "x/Unknown"), OBJECT);
        assert_eq!(
            hierarchy.common_super_class("[La/Left;", "[La/Right;"),
            "[La/Base;"
        );
        assert_eq!(hierarchy.common_super_class("[I", "[J"), OBJECT);
    }
}
