use std::collections::HashMap;
use std::fmt;

/// Interned handle for a floating-point attribute.
///
/// Float keys are issued by a [`KeyRegistry`]. The coordinate and radius keys are
/// pre-registered at fixed indices so that geometric code can refer to them as constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FloatKey(u32);

/// Interned handle for an integer attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntKey(u32);

/// Interned handle for a string attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringKey(u32);

impl FloatKey {
    pub const X: FloatKey = FloatKey(0);
    pub const Y: FloatKey = FloatKey(1);
    pub const Z: FloatKey = FloatKey(2);
    pub const RADIUS: FloatKey = FloatKey(3);

    /// The three Cartesian coordinate keys, in `x`, `y`, `z` order.
    pub const XYZ: [FloatKey; 3] = [FloatKey::X, FloatKey::Y, FloatKey::Z];

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        FloatKey(index as u32)
    }
}

impl IntKey {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl StringKey {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FloatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "float#{}", self.0)
    }
}

impl fmt::Display for IntKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "int#{}", self.0)
    }
}

impl fmt::Display for StringKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "string#{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
struct Interner {
    names: Vec<String>,
    lookup: HashMap<String, u32>,
}

impl Interner {
    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&index) = self.lookup.get(name) {
            return index;
        }
        let index = self.names.len() as u32;
        self.names.push(name.to_string());
        self.lookup.insert(name.to_string(), index);
        index
    }

    fn find(&self, name: &str) -> Option<u32> {
        self.lookup.get(name).copied()
    }

    fn name(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    fn len(&self) -> usize {
        self.names.len()
    }
}

/// Registry translating attribute names into typed, interned keys.
///
/// One registry is created per [`Model`](crate::engine::model::Model) and handed to
/// whoever needs to mint keys. Float, int and string keys live in independent namespaces,
/// so the same name may be interned in more than one of them.
#[derive(Debug, Clone)]
pub struct KeyRegistry {
    floats: Interner,
    ints: Interner,
    strings: Interner,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRegistry {
    /// Creates a registry with the coordinate (`x`, `y`, `z`) and `radius` float keys
    /// already registered.
    pub fn new() -> Self {
        let mut floats = Interner::default();
        for name in ["x", "y", "z", "radius"] {
            floats.intern(name);
        }
        Self {
            floats,
            ints: Interner::default(),
            strings: Interner::default(),
        }
    }

    /// Returns the key for `name`, registering it on first use.
    pub fn float_key(&mut self, name: &str) -> FloatKey {
        FloatKey(self.floats.intern(name))
    }

    pub fn find_float_key(&self, name: &str) -> Option<FloatKey> {
        self.floats.find(name).map(FloatKey)
    }

    pub fn float_name(&self, key: FloatKey) -> Option<&str> {
        self.floats.name(key.0)
    }

    pub fn num_float_keys(&self) -> usize {
        self.floats.len()
    }

    pub fn int_key(&mut self, name: &str) -> IntKey {
        IntKey(self.ints.intern(name))
    }

    pub fn find_int_key(&self, name: &str) -> Option<IntKey> {
        self.ints.find(name).map(IntKey)
    }

    pub fn int_name(&self, key: IntKey) -> Option<&str> {
        self.ints.name(key.0)
    }

    pub fn string_key(&mut self, name: &str) -> StringKey {
        StringKey(self.strings.intern(name))
    }

    pub fn find_string_key(&self, name: &str) -> Option<StringKey> {
        self.strings.find(name).map(StringKey)
    }

    pub fn string_name(&self, key: StringKey) -> Option<&str> {
        self.strings.name(key.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_registry_preregisters_coordinate_and_radius_keys() {
        let registry = KeyRegistry::new();
        assert_eq!(registry.find_float_key("x"), Some(FloatKey::X));
        assert_eq!(registry.find_float_key("y"), Some(FloatKey::Y));
        assert_eq!(registry.find_float_key("z"), Some(FloatKey::Z));
        assert_eq!(registry.find_float_key("radius"), Some(FloatKey::RADIUS));
        assert_eq!(registry.num_float_keys(), 4);
    }

    #[test]
    fn interning_the_same_name_twice_returns_the_same_key() {
        let mut registry = KeyRegistry::new();
        let first = registry.float_key("charge");
        let second = registry.float_key("charge");
        assert_eq!(first, second);
        assert_eq!(first.index(), 4);
        assert_eq!(registry.float_name(first), Some("charge"));
    }

    #[test]
    fn key_namespaces_are_independent() {
        let mut registry = KeyRegistry::new();
        let float = registry.float_key("mass");
        let int = registry.int_key("mass");
        let string = registry.string_key("mass");
        assert_eq!(int.index(), 0);
        assert_eq!(string.index(), 0);
        assert_eq!(float.index(), 4);
        assert_eq!(registry.int_name(int), Some("mass"));
        assert_eq!(registry.string_name(string), Some("mass"));
    }

    #[test]
    fn find_returns_none_for_unregistered_names() {
        let registry = KeyRegistry::new();
        assert!(registry.find_float_key("charge").is_none());
        assert!(registry.find_int_key("residue-index").is_none());
        assert!(registry.find_string_key("element").is_none());
    }
}
