use crate::jvm::model::{ClassModel, MethodModel};
use crate::jvm::{Constant, FieldAccessFlags, MethodAccessFlags};
use crate::transform::passes::is_obfuscated_name;
use crate::transform::passes::remap::{apply_to_set, Remapping};
use crate::transform::{Category, Scope, TransformContext, TransformError, Transformer};
use std::collections::{HashMap, HashSet};

const OBJECT: &str = "java/lang/Object";

/// Gives readable names to classes, fields, and methods with obfuscated names
///
/// Names are obfuscated when they are too short or could not appear in Java source (see
/// [`is_obfuscated_name`]). Replacements are numbered: `Class1` (in the same package), `field1`,
/// `method1`. Methods that override each other are renamed together. A method is left alone if
/// renaming it could break a link the class set can't see: it may override a library method, it
/// is native, or an `invokedynamic` call site binds its name.
pub struct RenamingNormalization;

impl Transformer for RenamingNormalization {
    fn name(&self) -> &'static str {
        "renaming-normalization"
    }

    fn category(&self) -> Category {
        Category::Renaming
    }

    fn description(&self) -> &'static str {
        "Replaces obfuscated class and member names with numbered readable names"
    }

    fn scope(&self) -> Scope {
        Scope::ClassSet
    }

    fn transform_class_set(
        &self,
        classes: &mut [ClassModel],
        ctx: &mut TransformContext,
    ) -> Result<Vec<bool>, TransformError> {
        let min_length = ctx.settings.min_name_length;
        let plan = plan_renames(classes, ctx, min_length);
        if plan.remapping.is_empty() {
            return Ok(vec![false; classes.len()]);
        }

        let old_names: Vec<String> = classes.iter().map(|class| class.name.clone()).collect();
        let changed = apply_to_set(&plan.remapping, classes, ctx.index, ctx.hierarchy)?;
        for (idx, old_name) in old_names.iter().enumerate() {
            if let Some(new_name) = plan.remapping.class_name(old_name) {
                ctx.log(old_name, format!("renamed class to {}", new_name));
            }
            let (fields, methods) = (plan.fields[idx], plan.methods[idx]);
            if fields + methods > 0 {
                ctx.log(
                    old_name,
                    format!("renamed {} fields and {} methods", fields, methods),
                );
            }
        }
        Ok(changed)
    }
}

struct Plan {
    remapping: Remapping,

    /// Renamed field and method declarations, per class
    fields: Vec<usize>,
    methods: Vec<usize>,
}

/// Disjoint sets of method declarations which must keep sharing a name
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> UnionFind {
        UnionFind {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        // The earliest declaration stays the root, which keeps numbering stable
        if a < b {
            self.parent[b] = a;
        } else if b < a {
            self.parent[a] = b;
        }
    }
}

/// Numbered names that don't collide with anything already present
struct NameSource {
    prefix: &'static str,
    next: usize,
    taken: HashSet<String>,
}

impl NameSource {
    fn new(prefix: &'static str, taken: HashSet<String>) -> NameSource {
        NameSource {
            prefix,
            next: 1,
            taken,
        }
    }

    fn fresh(&mut self, package: &str) -> String {
        loop {
            let name = format!("{}{}{}", package, self.prefix, self.next);
            self.next += 1;
            if self.taken.insert(name.clone()) {
                return name;
            }
        }
    }
}

fn is_overridable(method: &MethodModel) -> bool {
    !method.name.starts_with('<')
        && !method
            .access_flags
            .intersects(MethodAccessFlags::STATIC | MethodAccessFlags::PRIVATE)
}

fn plan_renames(classes: &[ClassModel], ctx: &TransformContext, min_length: usize) -> Plan {
    let in_set: HashSet<&str> = classes.iter().map(|class| class.name.as_str()).collect();
    let position: HashMap<&str, usize> = classes
        .iter()
        .enumerate()
        .map(|(idx, class)| (class.name.as_str(), idx))
        .collect();
    let mut remapping = Remapping::new();

    // Classes
    let taken = in_set
        .iter()
        .map(|name| name.to_string())
        .chain(ctx.reserved_names.iter().cloned())
        .collect();
    let mut class_names = NameSource::new("Class", taken);
    for class in classes {
        let (package, simple) = match class.name.rsplit_once('/') {
            Some((package, simple)) => (format!("{}/", package), simple),
            None => (String::new(), class.name.as_str()),
        };
        if is_obfuscated_name(simple, min_length) {
            let new_name = class_names.fresh(&package);
            remapping.rename_class(&class.name, &new_name);
        }
    }

    // Fields
    let mut fields = vec![0; classes.len()];
    let taken = classes
        .iter()
        .flat_map(|class| class.fields.iter().map(|field| field.name.clone()))
        .collect();
    let mut field_names = NameSource::new("field", taken);
    for (idx, class) in classes.iter().enumerate() {
        for field in &class.fields {
            let enum_constant = field.access_flags.contains(FieldAccessFlags::ENUM);
            if !enum_constant && is_obfuscated_name(&field.name, min_length) {
                let new_name = field_names.fresh("");
                remapping.rename_field(&class.name, &field.name, &field.descriptor, &new_name);
                fields[idx] += 1;
            }
        }
    }

    // Methods: one node per declaration
    let mut declarations: Vec<(usize, usize)> = vec![];
    let mut node_of: HashMap<(&str, &str, &str), usize> = HashMap::new();
    for (class_idx, class) in classes.iter().enumerate() {
        for (method_idx, method) in class.methods.iter().enumerate() {
            let key = (
                class.name.as_str(),
                method.name.as_str(),
                method.descriptor.as_str(),
            );
            node_of.insert(key, declarations.len());
            declarations.push((class_idx, method_idx));
        }
    }

    // Overridable declarations visible from the same class must keep sharing a name
    let mut groups = UnionFind::new(declarations.len());
    let mut pinned = vec![false; declarations.len()];
    for class in classes {
        let supertypes = ctx.hierarchy.supertypes(&class.name);
        let outside = supertypes
            .iter()
            .any(|name| name != OBJECT && !in_set.contains(name.as_str()));
        let mut visible: HashMap<(&str, &str), usize> = HashMap::new();
        let closure = std::iter::once(class.name.as_str())
            .chain(supertypes.iter().map(String::as_str))
            .filter_map(|name| position.get(name).map(|idx| &classes[*idx]));
        for declaring in closure {
            for method in declaring.methods.iter().filter(|m| is_overridable(m)) {
                let key = (
                    declaring.name.as_str(),
                    method.name.as_str(),
                    method.descriptor.as_str(),
                );
                let node = node_of[&key];
                if outside && declaring.name == class.name {
                    pinned[node] = true;
                }
                match visible.get(&(method.name.as_str(), method.descriptor.as_str())) {
                    Some(other) => groups.union(*other, node),
                    None => {
                        visible.insert((method.name.as_str(), method.descriptor.as_str()), node);
                    }
                }
            }
        }
    }

    // Names that invokedynamic call sites bind to (eg. lambda interface methods)
    let mut dynamic_names: HashSet<&str> = HashSet::new();
    for class in classes {
        for (_, constant) in class.constants.iter() {
            if let Constant::InvokeDynamic { name_and_type, .. } = constant {
                if let Ok((name, _)) = class.constants.name_and_type(*name_and_type) {
                    dynamic_names.insert(name);
                }
            }
        }
    }

    let mut blocked = vec![false; declarations.len()];
    for (node, (class_idx, method_idx)) in declarations.iter().enumerate() {
        let method = &classes[*class_idx].methods[*method_idx];
        let root = groups.find(node);
        if pinned[node]
            || method.name.starts_with('<')
            || method.access_flags.contains(MethodAccessFlags::NATIVE)
            || dynamic_names.contains(method.name.as_str())
            || !is_obfuscated_name(&method.name, min_length)
        {
            blocked[root] = true;
        }
    }

    let mut methods = vec![0; classes.len()];
    let taken = classes
        .iter()
        .flat_map(|class| class.methods.iter().map(|method| method.name.clone()))
        .collect();
    let mut method_names = NameSource::new("method", taken);
    let mut group_names: HashMap<usize, String> = HashMap::new();
    for (node, (class_idx, method_idx)) in declarations.iter().enumerate() {
        let root = groups.find(node);
        if blocked[root] {
            continue;
        }
        let class = &classes[*class_idx];
        let method = &class.methods[*method_idx];
        let new_name = group_names
            .entry(root)
            .or_insert_with(|| method_names.fresh(""));
        remapping.rename_method(&class.name, &method.name, &method.descriptor, new_name);
        methods[*class_idx] += 1;
    }

    Plan {
        remapping,
        fields,
        methods,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::analysis::ClassHierarchy;
    use crate::engine::Settings;
    use crate::jvm::code::{BranchInstruction, Code, Element, Instruction, InvokeType};
    use crate::jvm::model::FieldModel;
    use crate::jvm::ClassAccessFlags;
    use crate::transform::ClassIndex;
    use std::sync::Arc;

    fn run(classes: &mut Vec<ClassModel>) -> Vec<bool> {
        let index: ClassIndex = classes
            .iter()
            .map(|class| (class.name.clone(), Arc::new(class.clone())))
            .collect();
        let hierarchy = ClassHierarchy::from_classes(classes.iter());
        let settings = Settings::default();
        let mut ctx = TransformContext::new(&index, &hierarchy, &settings);
        RenamingNormalization
            .transform_class_set(classes, &mut ctx)
            .unwrap()
    }

    fn abstract_method(name: &str) -> MethodModel {
        MethodModel::new(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::ABSTRACT,
            name,
            "()V",
        )
    }

    #[test]
    fn overrides_keep_sharing_a_name() {
        let mut iface = ClassModel::new("p/a", Some(OBJECT));
        iface.access_flags |= ClassAccessFlags::INTERFACE | ClassAccessFlags::ABSTRACT;
        iface.methods.push(abstract_method("x"));

        let mut implementor = ClassModel::new("p/b", Some(OBJECT));
        implementor.interfaces.push(String::from("p/a"));
        let mut x = MethodModel::new(MethodAccessFlags::PUBLIC, "x", "()V");
        let mut code = Code::new();
        code.elements = vec![Element::Branch(BranchInstruction::Return)];
        x.code = Some(code);
        implementor.methods.push(x);
        implementor
            .fields
            .push(FieldModel::new(FieldAccessFlags::PRIVATE, "q", "I"));

        let mut library_child = ClassModel::new("p/Worker", Some("java/lang/Thread"));
        library_child.methods.push(abstract_method("y"));

        let mut user = ClassModel::new("p/Main", Some(OBJECT));
        let call = user
            .constants
            .get_method_ref("p/a", "x", "()V", true)
            .unwrap();
        let mut code = Code::new();
        code.max_stack = 1;
        code.max_locals = 1;
        code.elements = vec![
            Element::Insn(Instruction::ALoad(0)),
            Element::Insn(Instruction::Invoke(InvokeType::Interface(1), call)),
            Element::Branch(BranchInstruction::Return),
        ];
        let mut main = MethodModel::new(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            "main",
            "(Lp/a;)V",
        );
        main.code = Some(code);
        user.methods.push(main);

        let mut classes = vec![iface, implementor, library_child, user];
        assert_eq!(run(&mut classes), vec![true, true, false, true]);

        assert_eq!(classes[0].name, "p/Class1");
        assert_eq!(classes[1].name, "p/Class2");
        assert_eq!(classes[0].methods[0].name, "method1");
        assert_eq!(classes[1].methods[0].name, "method1");
        assert_eq!(classes[1].fields[0].name, "field1");
        assert_eq!(classes[1].interfaces, vec![String::from("p/Class1")]);
        // May override a library method
        assert_eq!(classes[2].methods[0].name, "y");

        let member = classes[3].constants.member_ref(call).unwrap();
        assert_eq!((member.owner, member.name), ("p/Class1", "method1"));
        assert_eq!(classes[3].methods[0].descriptor, "(Lp/Class1;)V");
    }

    #[test]
    fn readable_sets_are_left_alone() {
        let mut class = ClassModel::new("p/Main", Some(OBJECT));
        class
            .fields
            .push(FieldModel::new(FieldAccessFlags::PRIVATE, "count", "I"));
        let mut classes = vec![class];
        assert_eq!(run(&mut classes), vec![false]);
    }
}
