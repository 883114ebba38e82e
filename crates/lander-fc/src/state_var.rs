//! Fixed-depth rolling history of one value.
//!
//! Used for edge detection on RC buttons, body-change detection and the
//! scheduler's processing-time means.

use std::collections::VecDeque;

/// Relative tolerance for float change detection.
pub const FLOAT_REL_TOL: f64 = 1e-6;

pub const DEFAULT_CAPACITY: usize = 20;

/// How two samples of a register compare.
pub trait Sample: Clone {
    fn same_as(&self, other: &Self) -> bool;
}

/// Samples that can be averaged.
pub trait Numeric: Sample + Copy {
    fn to_f64(self) -> f64;
}

fn close(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    let scale = a.abs().max(b.abs());
    (a - b).abs() <= FLOAT_REL_TOL * scale
}

impl Sample for f64 {
    fn same_as(&self, other: &Self) -> bool {
        close(*self, *other)
    }
}

impl Sample for f32 {
    fn same_as(&self, other: &Self) -> bool {
        close(*self as f64, *other as f64)
    }
}

impl Numeric for f64 {
    fn to_f64(self) -> f64 {
        self
    }
}

impl Numeric for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }
}

macro_rules! exact_sample {
    ($($t:ty),*) => {
        $(impl Sample for $t {
            fn same_as(&self, other: &Self) -> bool {
                self == other
            }
        })*
    };
}

macro_rules! integer_numeric {
    ($($t:ty),*) => {
        $(impl Numeric for $t {
            fn to_f64(self) -> f64 {
                self as f64
            }
        })*
    };
}

exact_sample!(bool, u8, u16, u32, u64, usize, i8, i16, i32, i64, String, &'static str);
integer_numeric!(u8, u16, u32, u64, usize, i8, i16, i32, i64);

impl<T: Sample> Sample for Option<T> {
    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.same_as(b),
            (None, None) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateVariable<T> {
    register: VecDeque<T>,
    capacity: usize,
}

impl<T: Sample> Default for StateVariable<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T: Sample> StateVariable<T> {
    /// Capacity below 2 is raised to 2 so change detection always works.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self { register: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn with_initial(capacity: usize, value: T) -> Self {
        let mut sv = Self::new(capacity);
        sv.update(value);
        sv
    }

    pub fn update(&mut self, value: T) {
        if self.register.len() == self.capacity {
            self.register.pop_front();
        }
        self.register.push_back(value);
    }

    pub fn get(&self) -> Option<&T> {
        self.register.back()
    }

    pub fn previous(&self) -> Option<&T> {
        let n = self.register.len();
        if n < 2 {
            return None;
        }
        self.register.get(n - 2)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.register.len()
    }

    pub fn is_empty(&self) -> bool {
        self.register.is_empty()
    }

    /// Compares the two most recent samples.
    pub fn has_changed(&self) -> bool {
        match (self.get(), self.previous()) {
            (Some(last), Some(prev)) => !last.same_as(prev),
            _ => false,
        }
    }

    /// True only on the sample where the value became `to`.
    pub fn has_changed_to(&self, to: &T) -> bool {
        self.has_changed() && self.get().is_some_and(|last| last.same_as(to))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.register.iter()
    }

    pub fn clear(&mut self) {
        self.register.clear();
    }
}

impl<T: Numeric> StateVariable<T> {
    pub fn get_mean(&self) -> Option<f64> {
        if self.register.is_empty() {
            return None;
        }
        let sum: f64 = self.register.iter().map(|v| v.to_f64()).sum();
        Some(sum / self.register.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn no_change_with_fewer_than_two_samples() {
        let mut sv: StateVariable<f64> = StateVariable::new(4);
        assert!(!sv.has_changed());
        sv.update(3.0);
        assert!(!sv.has_changed());
        assert!(!sv.has_changed_to(&3.0));
    }

    #[test]
    fn float_change_uses_relative_tolerance() {
        let mut sv = StateVariable::new(4);
        sv.update(1000.0);
        sv.update(1000.0 + 1000.0 * 5e-7);
        assert!(!sv.has_changed());
        sv.update(1000.01);
        assert!(sv.has_changed());
    }

    #[test]
    fn changed_to_requires_both_change_and_match() {
        let mut sv = StateVariable::with_initial(4, false);
        sv.update(true);
        assert!(sv.has_changed_to(&true));
        assert!(!sv.has_changed_to(&false));
        sv.update(true);
        assert!(!sv.has_changed_to(&true));
        sv.update(false);
        assert!(sv.has_changed_to(&false));
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut sv = StateVariable::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            sv.update(v);
        }
        assert_eq!(sv.len(), 3);
        let kept: Vec<f64> = sv.iter().copied().collect();
        assert_eq!(kept, vec![2.0, 3.0, 4.0]);
        assert!((sv.get_mean().unwrap() - 3.0).abs() < EPSILON);
    }

    #[test]
    fn capacity_is_at_least_two() {
        let mut sv = StateVariable::new(0);
        assert_eq!(sv.capacity(), 2);
        sv.update("Kerbin".to_string());
        sv.update("Mun".to_string());
        assert!(sv.has_changed_to(&"Mun".to_string()));
    }

    #[test]
    fn mean_of_empty_register_is_none() {
        let sv: StateVariable<u32> = StateVariable::new(5);
        assert!(sv.get_mean().is_none());
        assert!(sv.get().is_none());
    }
}
