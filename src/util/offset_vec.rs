use std::fmt::{Debug, Error, Formatter};
use std::iter::{Extend, FromIterator};
use std::slice::Iter;

/// Elements with a width (eg. when used in an `OffsetVec`)
pub trait Width {
    fn width(&self) -> usize;
}

/// A vector of elements of different logical "widths", where offsets into the vector are given in
/// terms of the sum of the widths of the previous elements (as opposed to the number of preceding
/// elements).
///
/// The constant pool is the main user: most entries take one slot, but `long` and `double` take
/// two, and the slot after them is unusable.
#[derive(Clone)]
pub struct OffsetVec<T: Sized> {
    /// Entries, along with their offset
    entries: Vec<(Offset, T)>,

    /// Offset of the next element to be added
    offset_len: Offset,

    /// Offset for the first element (usually 0, but 1 for the constant pool)
    initial_offset: Offset,
}

/// Offset into an `OffsetVec`
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Offset(pub usize);

impl<T: Sized + Width> OffsetVec<T> {
    /// New empty offset vector
    pub fn new() -> OffsetVec<T> {
        OffsetVec::new_starting_at(Offset(0))
    }

    /// New empty offset vector, with a custom starting offset
    pub fn new_starting_at(initial_offset: Offset) -> OffsetVec<T> {
        OffsetVec {
            entries: vec![],
            offset_len: initial_offset,
            initial_offset,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset of the next element to be added
    pub fn offset_len(&self) -> Offset {
        self.offset_len
    }

    /// Offset of the first element
    pub fn initial_offset(&self) -> Offset {
        self.initial_offset
    }

    /// Add an entry to the back
    pub fn push(&mut self, slot: T) -> Offset {
        let offset = self.offset_len;
        self.offset_len.0 += slot.width();
        self.entries.push((offset, slot));
        offset
    }

    /// Get an entry by its offset in the vector
    ///
    /// Offsets that fall in the middle of a wide entry (or past the end) produce `None`.
    pub fn get_offset(&self, offset: Offset) -> Option<&T> {
        self.entries
            .binary_search_by_key(&offset, |(off, _)| *off)
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    /// Replace the entry at an offset, provided the replacement has the same width
    ///
    /// Returns the previous entry on success and hands back `value` if the offset is not the
    /// start of an entry or the widths differ.
    pub fn replace_offset(&mut self, offset: Offset, value: T) -> Result<T, T> {
        match self.entries.binary_search_by_key(&offset, |(off, _)| *off) {
            Ok(idx) if self.entries[idx].1.width() == value.width() => {
                Ok(std::mem::replace(&mut self.entries[idx].1, value))
            }
            _ => Err(value),
        }
    }

    /// Get an entry (and its offset) by its position in the vector
    pub fn get_index(&self, index: usize) -> Option<(Offset, &T)> {
        self.entries.get(index).map(|(offset, t)| (*offset, t))
    }

    pub fn iter(&self) -> OffsetVecIter<'_, T> {
        OffsetVecIter(self.entries.iter())
    }
}

impl<A: PartialEq> PartialEq for OffsetVec<A> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<A: Width> Default for OffsetVec<A> {
    fn default() -> Self {
        OffsetVec::new()
    }
}

/// Iterator for borrowed `OffsetVec`
pub struct OffsetVecIter<'a, T>(Iter<'a, (Offset, T)>);

impl<'a, T> Iterator for OffsetVecIter<'a, T> {
    type Item = (Offset, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(off, elem)| (*off, elem))
    }
}

impl<'a, T: Width> IntoIterator for &'a OffsetVec<T> {
    type Item = (Offset, &'a T);
    type IntoIter = OffsetVecIter<'a, T>;

    fn into_iter(self) -> OffsetVecIter<'a, T> {
        self.iter()
    }
}

impl<T: Width> FromIterator<T> for OffsetVec<T> {
    fn from_iter<A: IntoIterator<Item = T>>(elems: A) -> Self {
        let mut offset_vec = OffsetVec::new();
        offset_vec.extend(elems);
        offset_vec
    }
}

impl<T: Width> Extend<T> for OffsetVec<T> {
    fn extend<U: IntoIterator<Item = T>>(&mut self, iter: U) {
        for elem in iter {
            self.push(elem);
        }
    }
}

impl<T: Debug> Debug for OffsetVec<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let mut list = f.debug_list();
        for (off, elem) in &self.entries {
            list.entry(&format_args!("#{} = {:?}", off.0, elem));
        }
        list.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    enum Entry {
        Narrow(u8),
        Wide(u8),
    }

    impl Width for Entry {
        fn width(&self) -> usize {
            match self {
                Entry::Narrow(_) => 1,
                Entry::Wide(_) => 2,
            }
        }
    }

    #[test]
    fn pool_style_offsets() {
        let mut entries = OffsetVec::new_starting_at(Offset(1));
        assert_eq!(entries.push(Entry::Narrow(1)), Offset(1));
        assert_eq!(entries.push(Entry::Wide(2)), Offset(2));
        assert_eq!(entries.push(Entry::Narrow(3)), Offset(4));
        assert_eq!(entries.offset_len(), Offset(5));

        assert_eq!(entries.get_offset(Offset(2)), Some(&Entry::Wide(2)));
        assert_eq!(entries.get_offset(Offset(3)), None, "second half of a wide entry");
        assert_eq!(entries.get_offset(Offset(0)), None);
        assert_eq!(entries.get_offset(Offset(5)), None);
    }

    #[test]
    fn replace_requires_same_width() {
        let mut entries: OffsetVec<Entry> =
            vec![Entry::Narrow(1), Entry::Wide(2)].into_iter().collect();
        assert_eq!(
            entries.replace_offset(Offset(0), Entry::Narrow(9)),
            Ok(Entry::Narrow(1))
        );
        assert_eq!(
            entries.replace_offset(Offset(1), Entry::Narrow(9)),
            Err(Entry::Narrow(9))
        );
        assert_eq!(entries.get_offset(Offset(0)), Some(&Entry::Narrow(9)));
    }
}
