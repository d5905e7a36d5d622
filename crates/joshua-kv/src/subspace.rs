//! Key prefixes with tuple packing.

use crate::tuple::{self, Element, TupleError};

/// A key prefix under which a family of tuple-encoded keys lives.
///
/// The bare prefix itself is never a packed key (every element code is
/// non-zero), which makes it usable as a watch target for "something in
/// this subspace changed" without polluting range scans.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    pub fn new(elements: &[Element]) -> Self {
        Self {
            prefix: tuple::pack(elements),
        }
    }

    pub fn from_bytes(prefix: Vec<u8>) -> Self {
        Self { prefix }
    }

    /// Child subspace with one more element appended to the prefix.
    pub fn push(&self, element: Element) -> Subspace {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(&tuple::pack(&[element]));
        Subspace { prefix }
    }

    /// The raw prefix. Used as the change-notification key for the
    /// subspace (watch target, atomic-add counter).
    pub fn key(&self) -> &[u8] {
        &self.prefix
    }

    pub fn pack(&self, elements: &[Element]) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(&tuple::pack(elements));
        key
    }

    /// Packs a key containing a [Element::StampPlaceholder], returning the
    /// absolute offset at which the store must splice the commit stamp.
    pub fn pack_with_stamp(&self, elements: &[Element]) -> (Vec<u8>, usize) {
        let (tail, offset) = tuple::pack_with_stamp(elements);
        let offset = offset.expect("pack_with_stamp requires a placeholder element");
        let mut key = self.prefix.clone();
        key.extend_from_slice(&tail);
        (key, self.prefix.len() + offset)
    }

    /// Decodes the part of `key` below this prefix.
    pub fn unpack(&self, key: &[u8]) -> Result<Vec<Element>, TupleError> {
        let tail = key
            .strip_prefix(self.prefix.as_slice())
            .ok_or(TupleError::Truncated)?;
        tuple::unpack(tail)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix) && key.len() > self.prefix.len()
    }

    /// Half-open key interval covering every packed key in the subspace.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut start = self.prefix.clone();
        start.push(0x00);
        let mut end = self.prefix.clone();
        end.push(0xFF);
        (start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_keys_fall_inside_range() {
        let space = Subspace::new(&[Element::Str("joshua".into()), Element::Str("active".into())]);
        let key = space.pack(&[Element::Stamp([9; 10])]);
        let (start, end) = space.range();
        assert!(key > start && key < end);
        assert!(space.contains(&key));
        assert!(!space.contains(space.key()));
    }

    #[test]
    fn prefix_key_is_outside_range() {
        let space = Subspace::new(&[Element::Str("active".into())]);
        let (start, _) = space.range();
        assert!(space.key().to_vec() < start);
    }

    #[test]
    fn unpack_strips_prefix() {
        let space = Subspace::new(&[Element::Str("counters".into())]);
        let key = space.pack(&[Element::Stamp([1; 10]), Element::Str("ended".into())]);
        let elements = space.unpack(&key).unwrap();
        assert_eq!(
            elements,
            vec![Element::Stamp([1; 10]), Element::Str("ended".into())]
        );
    }
}
