//! Renaming of classes, fields, and methods across a class set
//!
//! A [`Remapping`] is keyed by the names classes have before it is applied. Member renames are
//! attached to the class that declares the member; references are resolved the way the JVM
//! resolves them (the named class first, then its supertypes) so that a call through a subclass
//! picks up the rename of the inherited method.

use crate::analysis::ClassHierarchy;
use crate::jvm::code::Code;
use crate::jvm::model::{ClassModel, MethodModel};
use crate::jvm::signatures::{remap_class_name, remap_descriptor, remap_signature, SignatureKind};
use crate::jvm::{
    ClassConstantIndex, Constant, ConstantIndex, ConstantPool, MethodAccessFlags,
    VerificationType,
};
use crate::transform::{ClassIndex, TransformError};
use std::collections::HashMap;

/// Owner, name, and descriptor, all as they are before remapping
type MemberKey = (String, String, String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Remapping {
    classes: HashMap<String, String>,
    fields: HashMap<MemberKey, String>,
    methods: HashMap<MemberKey, String>,
}

/// What a member reference in the constant pool turns into
enum PoolEdit {
    Class {
        index: ConstantIndex,
        name: String,
    },
    Member {
        index: ConstantIndex,
        class: ClassConstantIndex,
        is_interface: Option<bool>,
        name: String,
        descriptor: String,
    },
    NameAndType {
        index: ConstantIndex,
        name: String,
        descriptor: String,
    },
    MethodType {
        index: ConstantIndex,
        descriptor: String,
    },
}

impl Remapping {
    pub fn new() -> Remapping {
        Remapping::default()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.fields.is_empty() && self.methods.is_empty()
    }

    pub fn rename_class(&mut self, old: &str, new: &str) {
        if old != new {
            self.classes.insert(old.to_owned(), new.to_owned());
        }
    }

    pub fn rename_field(&mut self, owner: &str, name: &str, descriptor: &str, new: &str) {
        if name != new {
            let key = (owner.to_owned(), name.to_owned(), descriptor.to_owned());
            self.fields.insert(key, new.to_owned());
        }
    }

    pub fn rename_method(&mut self, owner: &str, name: &str, descriptor: &str, new: &str) {
        if name != new {
            let key = (owner.to_owned(), name.to_owned(), descriptor.to_owned());
            self.methods.insert(key, new.to_owned());
        }
    }

    /// New name of a class, if it is renamed
    pub fn class_name(&self, old: &str) -> Option<&str> {
        self.classes.get(old).map(String::as_str)
    }

    fn map_class(&self, name: &str) -> Option<String> {
        self.classes.get(name).cloned()
    }

    fn descriptor(&self, descriptor: &str) -> String {
        remap_descriptor(descriptor, &|name| self.map_class(name))
    }

    /// Signatures that fail to parse are left alone
    fn signature(&self, signature: &mut Option<String>, kind: SignatureKind) {
        if let Some(old) = signature.as_deref() {
            if let Ok(new) = remap_signature(old, kind, &|name| self.map_class(name)) {
                *signature = Some(new);
            }
        }
    }

    /// New name for a field or method reference, following JVM resolution order
    ///
    /// Resolution stops at the first class which declares the member (other than a method that
    /// may override another): if that declaration is not renamed, neither is the reference.
    fn resolve(
        &self,
        table: &HashMap<MemberKey, String>,
        is_field: bool,
        owner: &str,
        name: &str,
        descriptor: &str,
        index: &ClassIndex,
        hierarchy: &ClassHierarchy,
    ) -> Option<String> {
        for class in resolution_order(owner, hierarchy) {
            let key = (class, name.to_owned(), descriptor.to_owned());
            if let Some(new) = table.get(&key) {
                return Some(new.clone());
            }
            // Overridable methods share their name with what they override, so keep looking
            let declared = index.get(&key.0).and_then(|model| {
                if is_field {
                    model.field(name, descriptor).map(|_| false)
                } else {
                    model.method(name, descriptor).map(is_overridable)
                }
            });
            if declared == Some(false) {
                return None;
            }
        }
        None
    }

    /// Rename everything in one class: its own names, its members, and every reference it makes
    ///
    /// `index` and `hierarchy` describe the class set before remapping. Returns whether the class
    /// changed.
    pub fn apply(
        &self,
        class: &mut ClassModel,
        index: &ClassIndex,
        hierarchy: &ClassHierarchy,
    ) -> Result<bool, TransformError> {
        let fields_before = class.fields.clone();
        let methods_before = class.methods.clone();
        let header_before = (
            class.name.clone(),
            class.super_name.clone(),
            class.interfaces.clone(),
            class.signature.clone(),
        );
        let owner = class.name.clone();
        let map = |name: &str| self.map_class(name);

        for field in &mut class.fields {
            let key = (owner.clone(), field.name.clone(), field.descriptor.clone());
            if let Some(new) = self.fields.get(&key) {
                field.name = new.clone();
            }
            field.descriptor = self.descriptor(&field.descriptor);
            self.signature(&mut field.signature, SignatureKind::Field);
        }

        for method in &mut class.methods {
            let new_name = if is_overridable(method) {
                self.resolve(
                    &self.methods,
                    false,
                    &owner,
                    &method.name,
                    &method.descriptor,
                    index,
                    hierarchy,
                )
            } else {
                let key = (owner.clone(), method.name.clone(), method.descriptor.clone());
                self.methods.get(&key).cloned()
            };
            if let Some(new) = new_name {
                method.name = new;
            }
            method.descriptor = self.descriptor(&method.descriptor);
            self.signature(&mut method.signature, SignatureKind::Method);
            if let Some(code) = &mut method.code {
                self.remap_code(code);
            }
        }

        class.name = remap_class_name(&class.name, &map);
        class.super_name = class
            .super_name
            .as_deref()
            .map(|name| remap_class_name(name, &map));
        for interface in &mut class.interfaces {
            *interface = remap_class_name(interface, &map);
        }
        self.signature(&mut class.signature, SignatureKind::Class);

        let pool_changed = self.remap_constants(&mut class.constants, index, hierarchy)?;

        let header = (
            class.name.clone(),
            class.super_name.clone(),
            class.interfaces.clone(),
            class.signature.clone(),
        );
        Ok(pool_changed
            || header != header_before
            || class.fields != fields_before
            || class.methods != methods_before)
    }

    fn remap_code(&self, code: &mut Code) {
        let map = |name: &str| self.map_class(name);
        for handler in &mut code.handlers {
            if let Some(catch_type) = &mut handler.catch_type {
                *catch_type = remap_class_name(catch_type, &map);
            }
        }
        for local in &mut code.local_variables {
            local.descriptor = self.descriptor(&local.descriptor);
        }
        for local in &mut code.local_variable_types {
            if let Ok(new) = remap_signature(&local.descriptor, SignatureKind::Field, &map) {
                local.descriptor = new;
            }
        }
        for frame in code.frames.values_mut() {
            for ty in frame.locals.iter_mut().chain(frame.stack.iter_mut()) {
                if let VerificationType::Object(name) = ty {
                    *name = remap_class_name(name, &map);
                }
            }
        }
    }

    fn remap_constants(
        &self,
        constants: &mut ConstantPool,
        index: &ClassIndex,
        hierarchy: &ClassHierarchy,
    ) -> Result<bool, TransformError> {
        let map = |name: &str| self.map_class(name);

        // Work out every edit against the untouched pool first
        let mut edits = vec![];
        for (idx, constant) in constants.iter() {
            match constant {
                Constant::Class(name) => {
                    let name = constants.utf8(*name)?;
                    let new = remap_class_name(name, &map);
                    if new != name {
                        edits.push(PoolEdit::Class {
                            index: idx,
                            name: new,
                        });
                    }
                }
                Constant::FieldRef {
                    class,
                    name_and_type,
                } => {
                    let owner = constants.class_name(*class)?;
                    let (name, descriptor) = constants.name_and_type(*name_and_type)?;
                    let renamed = self.resolve(
                        &self.fields,
                        true,
                        owner,
                        name,
                        descriptor,
                        index,
                        hierarchy,
                    );
                    if let Some(new) = renamed {
                        edits.push(PoolEdit::Member {
                            index: idx,
                            class: *class,
                            is_interface: None,
                            name: new,
                            descriptor: self.descriptor(descriptor),
                        });
                    }
                }
                Constant::MethodRef {
                    class,
                    name_and_type,
                    is_interface,
                } => {
                    let owner = constants.class_name(*class)?;
                    let (name, descriptor) = constants.name_and_type(*name_and_type)?;
                    if owner.starts_with('[') {
                        continue;
                    }
                    let renamed = self.resolve(
                        &self.methods,
                        false,
                        owner,
                        name,
                        descriptor,
                        index,
                        hierarchy,
                    );
                    if let Some(new) = renamed {
                        edits.push(PoolEdit::Member {
                            index: idx,
                            class: *class,
                            is_interface: Some(*is_interface),
                            name: new,
                            descriptor: self.descriptor(descriptor),
                        });
                    }
                }
                Constant::NameAndType { name, descriptor } => {
                    let old = constants.utf8(*descriptor)?;
                    let new = self.descriptor(old);
                    if new != old {
                        edits.push(PoolEdit::NameAndType {
                            index: idx,
                            name: constants.utf8(*name)?.to_owned(),
                            descriptor: new,
                        });
                    }
                }
                Constant::MethodType { descriptor } => {
                    let old = constants.utf8(*descriptor)?;
                    let new = self.descriptor(old);
                    if new != old {
                        edits.push(PoolEdit::MethodType {
                            index: idx,
                            descriptor: new,
                        });
                    }
                }
                _ => (),
            }
        }

        let changed = !edits.is_empty();
        for edit in edits {
            match edit {
                PoolEdit::Class { index, name } => {
                    let name = constants.get_utf8(&name)?;
                    constants.redirect(index, Constant::Class(name))?;
                }
                PoolEdit::Member {
                    index,
                    class,
                    is_interface,
                    name,
                    descriptor,
                } => {
                    let name_and_type = constants.get_name_and_type(&name, &descriptor)?;
                    let constant = match is_interface {
                        None => Constant::FieldRef {
                            class,
                            name_and_type,
                        },
                        Some(is_interface) => Constant::MethodRef {
                            class,
                            name_and_type,
                            is_interface,
                        },
                    };
                    constants.redirect(index, constant)?;
                }
                PoolEdit::NameAndType {
                    index,
                    name,
                    descriptor,
                } => {
                    let name = constants.get_utf8(&name)?;
                    let descriptor = constants.get_utf8(&descriptor)?;
                    constants.redirect(index, Constant::NameAndType { name, descriptor })?;
                }
                PoolEdit::MethodType { index, descriptor } => {
                    let descriptor = constants.get_utf8(&descriptor)?;
                    constants.redirect(index, Constant::MethodType { descriptor })?;
                }
            }
        }
        Ok(changed)
    }
}

/// Can subclasses override this method?
fn is_overridable(method: &MethodModel) -> bool {
    !method.name.starts_with('<')
        && !method
            .access_flags
            .intersects(MethodAccessFlags::STATIC | MethodAccessFlags::PRIVATE)
}

/// Classes searched when resolving a member reference: superclasses first, then interfaces
fn resolution_order(owner: &str, hierarchy: &ClassHierarchy) -> Vec<String> {
    let mut order = hierarchy.superclasses(owner);
    for supertype in hierarchy.supertypes(owner) {
        if !order.contains(&supertype) {
            order.push(supertype);
        }
    }
    order
}

/// Apply a remapping to every class of a set, returning which classes changed
pub fn apply_to_set(
    remapping: &Remapping,
    classes: &mut [ClassModel],
    index: &ClassIndex,
    hierarchy: &ClassHierarchy,
) -> Result<Vec<bool>, TransformError> {
    classes
        .iter_mut()
        .map(|class| remapping.apply(class, index, hierarchy))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{BranchInstruction, Element, Instruction, InvokeType};
    use crate::jvm::model::FieldModel;
    use crate::jvm::FieldAccessFlags;
    use std::sync::Arc;

    fn set(classes: &[ClassModel]) -> (ClassIndex, ClassHierarchy) {
        let index = classes
            .iter()
            .map(|class| (class.name.clone(), Arc::new(class.clone())))
            .collect();
        (index, ClassHierarchy::from_classes(classes))
    }

    #[test]
    fn references_through_subclasses_follow_renames() {
        let mut base = ClassModel::new("a/a", Some("java/lang/Object"));
        base.methods
            .push(MethodModel::new(MethodAccessFlags::PUBLIC, "b", "(La/a;)V"));
        let mut sub = ClassModel::new("a/c", Some("a/a"));
        sub.methods
            .push(MethodModel::new(MethodAccessFlags::PUBLIC, "b", "(La/a;)V"));

        let mut user = ClassModel::new("Main", Some("java/lang/Object"));
        let call = user
            .constants
            .get_method_ref("a/c", "b", "(La/a;)V", false)
            .unwrap();
        let mut code = Code::new();
        code.max_stack = 2;
        code.max_locals = 1;
        code.elements = vec![
            Element::Insn(Instruction::ALoad(0)),
            Element::Insn(Instruction::AConstNull),
            Element::Insn(Instruction::Invoke(InvokeType::Virtual, call)),
            Element::Branch(BranchInstruction::Return),
        ];
        let mut run = MethodModel::new(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "run",
            "(La/c;)V",
        );
        run.code = Some(code);
        user.methods.push(run);

        let mut classes = vec![base, sub, user];
        let (index, hierarchy) = set(&classes);
        let mut remapping = Remapping::new();
        remapping.rename_class("a/a", "a/Base");
        remapping.rename_method("a/a", "b", "(La/a;)V", "visit");
        let changed = apply_to_set(&remapping, &mut classes, &index, &hierarchy).unwrap();
        assert_eq!(changed, vec![true, true, true]);

        assert_eq!(classes[0].name, "a/Base");
        assert_eq!(classes[0].methods[0].name, "visit");
        assert_eq!(classes[0].methods[0].descriptor, "(La/Base;)V");
        assert_eq!(classes[1].super_name.as_deref(), Some("a/Base"));
        assert_eq!(classes[1].methods[0].name, "visit");
        assert_eq!(classes[2].methods[0].descriptor, "(La/c;)V");

        let member = classes[2].constants.member_ref(call).unwrap();
        assert_eq!(
            (member.owner, member.name, member.descriptor),
            ("a/c", "visit", "(La/Base;)V")
        );
    }

    #[test]
    fn shadowing_declarations_stop_resolution() {
        let mut base = ClassModel::new("a/a", Some("java/lang/Object"));
        base.fields
            .push(FieldModel::new(FieldAccessFlags::PUBLIC, "x", "I"));
        let mut sub = ClassModel::new("a/b", Some("a/a"));
        sub.fields
            .push(FieldModel::new(FieldAccessFlags::PUBLIC, "x", "I"));
        let classes = vec![base, sub];
        let (index, hierarchy) = set(&classes);

        let mut remapping = Remapping::new();
        remapping.rename_field("a/a", "x", "I", "count");
        let resolve = |owner: &str| {
            remapping.resolve(&remapping.fields, true, owner, "x", "I", &index, &hierarchy)
        };
        assert_eq!(resolve("a/a").as_deref(), Some("count"));
        assert_eq!(resolve("a/b"), None);
    }
}
