//! Pure per-key transformations attached to a derived collection (§3, §4.4).
//!
//! Grounded on `original_source/.../classic/mapper.py`: a `Mapper` protocol with
//! `map_element(key, value) -> Iterator[(key, value)]`, and two concrete flavors,
//! `OneToOneMapper` (element-wise) and `ManyToOneMapper` (whole-sequence reduction).
//! Both preserve the source key; a composite `Mapper` impl that remaps keys is
//! still expressible against the general trait below, which is why `map_element`
//! returns a small vector rather than a single optional pair.

use smallvec::SmallVec;

/// General mapper protocol: a key/value pair in, zero or more key/value pairs out.
/// `OneToOne` and `ManyToOne` below are the two concrete shapes the spec names;
/// implementing this trait directly is how a "composite mapper" (one that can
/// legitimately emit more than one output pair, and thus risks emitting the same
/// output key twice — see `Collection::recompute_contents`) would be built.
pub trait Mapper<K, V1, V2>: Send + Sync {
    fn map_element(&self, key: &K, value: &V1) -> SmallVec<[(K, V2); 1]>;
}

/// A one-to-one mapper: `V1 -> Option<V2>`. Returning `None` filters the key out
/// of the derived collection entirely.
pub struct OneToOne<F> {
    f: F,
}

impl<F> OneToOne<F> {
    pub fn new(f: F) -> Self {
        OneToOne { f }
    }
}

impl<K, V1, V2, F> Mapper<K, V1, V2> for OneToOne<F>
where
    K: Clone + Send + Sync,
    F: Fn(&V1) -> Option<V2> + Send + Sync,
{
    fn map_element(&self, key: &K, value: &V1) -> SmallVec<[(K, V2); 1]> {
        match (self.f)(value) {
            Some(out) => SmallVec::from_buf([(key.clone(), out)]),
            None => SmallVec::new(),
        }
    }
}

/// A many-to-one mapper: consumes the whole value at a key (itself an ordered
/// sequence) and produces `Option<V2>`.
pub struct ManyToOne<F> {
    f: F,
}

impl<F> ManyToOne<F> {
    pub fn new(f: F) -> Self {
        ManyToOne { f }
    }
}

impl<K, V1, V2, F> Mapper<K, Vec<V1>, V2> for ManyToOne<F>
where
    K: Clone + Send + Sync,
    F: Fn(&[V1]) -> Option<V2> + Send + Sync,
{
    fn map_element(&self, key: &K, values: &Vec<V1>) -> SmallVec<[(K, V2); 1]> {
        match (self.f)(values) {
            Some(out) => SmallVec::from_buf([(key.clone(), out)]),
            None => SmallVec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_to_one_filters_on_none() {
        let m = OneToOne::new(|v: &i32| if *v > 0 { Some(v * 2) } else { None });
        assert_eq!(m.map_element(&"a", &3).as_slice(), &[("a", 6)]);
        assert!(m.map_element(&"a", &-1).is_empty());
    }

    #[test]
    fn many_to_one_averages() {
        let m = ManyToOne::new(|vs: &[f64]| {
            if vs.is_empty() {
                None
            } else {
                Some(vs.iter().sum::<f64>() / vs.len() as f64)
            }
        });
        let out = m.map_element(&"s1", &vec![10.0, 20.0, 30.0]);
        assert_eq!(out.as_slice(), &[("s1", 20.0)]);
    }
}
