//! Generic attribute storage shared across node kinds.
//!
//! Hashing notes:
//! - `hash_all()` hashes keys in sorted order for determinism.
//! - `AttrValue` hashes floats via `to_bits`; lists are hashed element-wise.
//! - Attrs hashing feeds content-identity trees so cached frames invalidate
//!   when any relevant property changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Generic attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Str(String),
    Int(i32),
    UInt(u32),
    Float(f32),
    /// Frame number arrays (remap tables, warp key frames)
    IntList(Vec<i32>),
    /// Rate/weight arrays (warp key rates)
    FloatList(Vec<f32>),
}

impl std::hash::Hash for AttrValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        use AttrValue::*;
        std::mem::discriminant(self).hash(state);
        match self {
            Bool(v) => v.hash(state),
            Str(v) => v.hash(state),
            Int(v) => v.hash(state),
            UInt(v) => v.hash(state),
            Float(v) => v.to_bits().hash(state),
            IntList(v) => v.hash(state),
            FloatList(v) => v.iter().for_each(|f| f.to_bits().hash(state)),
        }
    }
}

/// Attribute container: string key -> typed value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attrs {
    #[serde(default)]
    map: HashMap<String, AttrValue>,
}

impl Attrs {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: AttrValue) {
        self.map.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.map.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.map.get(key) {
            Some(AttrValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.map.get(key) {
            Some(AttrValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.map.get(key) {
            Some(AttrValue::UInt(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, key: &str) -> Option<f32> {
        match self.map.get(key) {
            Some(AttrValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.map.get(key) {
            Some(AttrValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int_list(&self, key: &str) -> Option<&[i32]> {
        match self.map.get(key) {
            Some(AttrValue::IntList(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_float_list(&self, key: &str) -> Option<&[f32]> {
        match self.map.get(key) {
            Some(AttrValue::FloatList(v)) => Some(v),
            _ => None,
        }
    }

    // Generic helpers with defaults (to reduce boilerplate)

    pub fn get_i32_or(&self, key: &str, default: i32) -> i32 {
        self.get_i32(key).unwrap_or(default)
    }

    pub fn get_float_or(&self, key: &str, default: f32) -> f32 {
        self.get_float(key).unwrap_or(default)
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut AttrValue> {
        self.map.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<AttrValue> {
        self.map.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.map.iter()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Merge defaults for keys not already present
    pub fn apply_defaults(&mut self, defaults: &Attrs) {
        for (k, v) in defaults.iter() {
            if !self.map.contains_key(k) {
                self.map.insert(k.clone(), v.clone());
            }
        }
    }

    /// Deterministic content hash over all attributes (sorted key order)
    pub fn hash_all(&self) -> u64 {
        let mut keys: Vec<&String> = self.map.keys().collect();
        keys.sort();
        let mut hasher = DefaultHasher::new();
        for k in keys {
            k.hash(&mut hasher);
            self.map[k].hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let mut attrs = Attrs::new();
        attrs.set("scale", AttrValue::Float(2.0));
        attrs.set("frames", AttrValue::IntList(vec![10, 10, 11, 13]));

        assert_eq!(attrs.get_float("scale"), Some(2.0));
        assert_eq!(attrs.get_i32("scale"), None);
        assert_eq!(attrs.get_int_list("frames"), Some(&[10, 10, 11, 13][..]));
    }

    #[test]
    fn test_hash_is_key_order_independent() {
        let mut a = Attrs::new();
        a.set("x", AttrValue::Int(1));
        a.set("y", AttrValue::Float(0.5));

        let mut b = Attrs::new();
        b.set("y", AttrValue::Float(0.5));
        b.set("x", AttrValue::Int(1));

        assert_eq!(a.hash_all(), b.hash_all());

        b.set("x", AttrValue::Int(2));
        assert_ne!(a.hash_all(), b.hash_all());
    }

    #[test]
    fn test_apply_defaults_keeps_existing() {
        let mut defaults = Attrs::new();
        defaults.set("a", AttrValue::Int(1));
        defaults.set("b", AttrValue::Int(2));

        let mut attrs = Attrs::new();
        attrs.set("a", AttrValue::Int(10));
        attrs.apply_defaults(&defaults);

        assert_eq!(attrs.get_i32("a"), Some(10));
        assert_eq!(attrs.get_i32("b"), Some(2));
    }
}
