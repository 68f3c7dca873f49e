use super::keys::{FloatKey, IntKey, StringKey};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A capability tag carried by an entity.
///
/// Decorations are queried by value, so "is this entity a sphere?" is a set lookup rather
/// than a type test. Each decoration requires a fixed set of float attributes to exist
/// before it can be attached (see [`Decoration::required_floats`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Decoration {
    /// A point with Cartesian coordinates.
    Xyz,
    /// A sphere: coordinates plus a radius.
    XyzR,
    /// A point whose coordinates are derived from other entities by a score state.
    Centroid,
}

impl Decoration {
    /// The float attributes an entity must carry before this decoration can be added.
    pub fn required_floats(self) -> &'static [FloatKey] {
        const XYZ_R: [FloatKey; 4] = [FloatKey::X, FloatKey::Y, FloatKey::Z, FloatKey::RADIUS];
        match self {
            Decoration::Xyz | Decoration::Centroid => &FloatKey::XYZ,
            Decoration::XyzR => &XYZ_R,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[error("Invalid decoration string: '{0}'")]
pub struct ParseDecorationError(pub String);

impl FromStr for Decoration {
    type Err = ParseDecorationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "xyz" => Ok(Decoration::Xyz),
            "xyzr" | "xyz-r" | "sphere" => Ok(Decoration::XyzR),
            "centroid" => Ok(Decoration::Centroid),
            _ => Err(ParseDecorationError(s.to_string())),
        }
    }
}

impl fmt::Display for Decoration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decoration::Xyz => "XYZ",
            Decoration::XyzR => "XYZR",
            Decoration::Centroid => "Centroid",
        };
        write!(f, "{}", s)
    }
}

/// A single modeled entity and all of its typed attributes.
///
/// Attribute slots are indexed by the interned key, so lookups are a vector index.
/// A float slot holds its value, an "optimizable" flag and an accumulated derivative.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Entity {
    /// Human-readable label, used in logs and error messages.
    pub name: String,
    floats: Vec<Option<f64>>,
    optimizable: Vec<bool>,
    derivatives: Vec<f64>,
    ints: Vec<Option<i64>>,
    strings: Vec<Option<String>>,
    decorations: BTreeSet<Decoration>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    #[inline]
    pub fn float(&self, key: FloatKey) -> Option<f64> {
        self.floats.get(key.index()).copied().flatten()
    }

    pub fn set_float(&mut self, key: FloatKey, value: f64) {
        let index = key.index();
        if index >= self.floats.len() {
            self.floats.resize(index + 1, None);
            self.optimizable.resize(index + 1, false);
            self.derivatives.resize(index + 1, 0.0);
        }
        self.floats[index] = Some(value);
    }

    pub fn remove_float(&mut self, key: FloatKey) -> Option<f64> {
        let index = key.index();
        let old = self.floats.get_mut(index).and_then(Option::take);
        if old.is_some() {
            self.optimizable[index] = false;
            self.derivatives[index] = 0.0;
        }
        old
    }

    #[inline]
    pub fn has_float(&self, key: FloatKey) -> bool {
        self.float(key).is_some()
    }

    /// Keys of all float attributes currently present, in key order.
    pub fn float_keys(&self) -> impl Iterator<Item = FloatKey> + '_ {
        self.floats
            .iter()
            .enumerate()
            .filter(|(_, value)| value.is_some())
            .map(|(index, _)| FloatKey::from_index(index))
    }

    pub fn is_optimizable(&self, key: FloatKey) -> bool {
        self.optimizable.get(key.index()).copied().unwrap_or(false)
    }

    /// Marks a present float attribute as optimizable. Returns `false` if the attribute
    /// does not exist.
    pub fn set_optimizable(&mut self, key: FloatKey, optimizable: bool) -> bool {
        if !self.has_float(key) {
            return false;
        }
        self.optimizable[key.index()] = optimizable;
        true
    }

    pub fn derivative(&self, key: FloatKey) -> f64 {
        self.derivatives.get(key.index()).copied().unwrap_or(0.0)
    }

    /// Adds to the derivative slot of a present float attribute. Returns `false` if the
    /// attribute does not exist.
    pub fn add_to_derivative(&mut self, key: FloatKey, value: f64) -> bool {
        if !self.has_float(key) {
            return false;
        }
        self.derivatives[key.index()] += value;
        true
    }

    pub fn zero_derivatives(&mut self) {
        self.derivatives.iter_mut().for_each(|d| *d = 0.0);
    }

    pub fn int(&self, key: IntKey) -> Option<i64> {
        self.ints.get(key.index()).copied().flatten()
    }

    pub fn set_int(&mut self, key: IntKey, value: i64) {
        let index = key.index();
        if index >= self.ints.len() {
            self.ints.resize(index + 1, None);
        }
        self.ints[index] = Some(value);
    }

    pub fn string(&self, key: StringKey) -> Option<&str> {
        self.strings.get(key.index()).and_then(|s| s.as_deref())
    }

    pub fn set_string(&mut self, key: StringKey, value: impl Into<String>) {
        let index = key.index();
        if index >= self.strings.len() {
            self.strings.resize(index + 1, None);
        }
        self.strings[index] = Some(value.into());
    }

    pub fn decorations(&self) -> &BTreeSet<Decoration> {
        &self.decorations
    }

    #[inline]
    pub fn has_decoration(&self, decoration: Decoration) -> bool {
        self.decorations.contains(&decoration)
    }

    pub(crate) fn insert_decoration(&mut self, decoration: Decoration) -> bool {
        self.decorations.insert(decoration)
    }

    pub(crate) fn remove_decoration(&mut self, decoration: Decoration) -> bool {
        self.decorations.remove(&decoration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoration_parses_case_insensitively() {
        assert_eq!("XYZ".parse::<Decoration>(), Ok(Decoration::Xyz));
        assert_eq!("xyzr".parse::<Decoration>(), Ok(Decoration::XyzR));
        assert_eq!("Sphere".parse::<Decoration>(), Ok(Decoration::XyzR));
        assert_eq!("centroid".parse::<Decoration>(), Ok(Decoration::Centroid));
        assert!("rigid-body".parse::<Decoration>().is_err());
    }

    #[test]
    fn sphere_decoration_requires_radius() {
        assert!(Decoration::XyzR.required_floats().contains(&FloatKey::RADIUS));
        assert!(!Decoration::Xyz.required_floats().contains(&FloatKey::RADIUS));
    }

    #[test]
    fn setting_a_high_index_float_leaves_lower_slots_absent() {
        let mut entity = Entity::new("bead");
        let key = FloatKey::from_index(7);
        entity.set_float(key, 2.5);
        assert_eq!(entity.float(key), Some(2.5));
        assert_eq!(entity.float(FloatKey::X), None);
        assert_eq!(entity.float_keys().collect::<Vec<_>>(), vec![key]);
    }

    #[test]
    fn optimizable_flag_and_derivative_require_the_attribute() {
        let mut entity = Entity::new("bead");
        assert!(!entity.set_optimizable(FloatKey::X, true));
        assert!(!entity.add_to_derivative(FloatKey::X, 1.0));

        entity.set_float(FloatKey::X, 0.0);
        assert!(entity.set_optimizable(FloatKey::X, true));
        assert!(entity.add_to_derivative(FloatKey::X, 1.5));
        assert!(entity.add_to_derivative(FloatKey::X, 0.5));
        assert!(entity.is_optimizable(FloatKey::X));
        assert_eq!(entity.derivative(FloatKey::X), 2.0);

        entity.zero_derivatives();
        assert_eq!(entity.derivative(FloatKey::X), 0.0);
    }

    #[test]
    fn removing_a_float_clears_its_flag_and_derivative() {
        let mut entity = Entity::new("bead");
        entity.set_float(FloatKey::Y, 3.0);
        entity.set_optimizable(FloatKey::Y, true);
        entity.add_to_derivative(FloatKey::Y, 4.0);

        assert_eq!(entity.remove_float(FloatKey::Y), Some(3.0));
        assert!(!entity.is_optimizable(FloatKey::Y));
        assert_eq!(entity.derivative(FloatKey::Y), 0.0);
        assert_eq!(entity.remove_float(FloatKey::Y), None);
    }
}
