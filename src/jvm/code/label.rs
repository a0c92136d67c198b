use std::fmt;

/// Opaque position in a method's instruction list
///
/// Labels are only meaningful within one method. They are resolved to bytecode offsets when the
/// method is serialized.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Label(u32);

impl Label {
    /// Get the next fresh label
    pub fn next(&self) -> Label {
        Label(self.0 + 1)
    }
}

/// Hands out fresh labels
///
/// Cloning does not split the generator source - the cloned generator will produce the same
/// sequence of labels as the original.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct LabelGenerator(u32);

impl LabelGenerator {
    pub fn fresh_label(&mut self) -> Label {
        let to_return = Label(self.0);
        self.0 += 1;
        to_return
    }

    /// Make sure future labels do not collide with `label`
    pub fn reserve(&mut self, label: Label) {
        self.0 = self.0.max(label.0 + 1);
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("L{}", self.0))
    }
}
