/// A dynamically typed INFO or per-sample FORMAT value, normalized at
/// record construction time. Scalars and one-element vectors are kept
/// distinct here; they compare equal through [`DynValue::normalized_eq`]
/// which the round-trip tests rely on.
///
/// Missing slots inside a vector are `i32::MIN` for integers and the
/// missing NaN bit pattern for floats.
#[derive(Debug, Clone, PartialEq)]
pub enum DynValue {
    Null,
    Int(i32),
    Ints(Vec<i32>),
    Float(f32),
    Floats(Vec<f32>),
    Flag,
    Str(String),
    Strs(Vec<String>),
}

impl DynValue {
    pub fn num_elements(&self) -> usize {
        match self {
            DynValue::Null => 0,
            DynValue::Int(_) | DynValue::Float(_) => 1,
            DynValue::Flag => 1,
            DynValue::Ints(v) => v.len(),
            DynValue::Floats(v) => v.len(),
            DynValue::Str(s) => s.len(),
            DynValue::Strs(v) => {
                // comma-joined on the wire
                v.iter().map(String::len).sum::<usize>() + v.len().saturating_sub(1)
            }
        }
    }

    /// Integer view over scalar and vector forms. Missing slots keep
    /// their `i32::MIN` sentinel.
    pub fn ints(&self) -> Option<Vec<i32>> {
        match self {
            DynValue::Int(x) => Some(vec![*x]),
            DynValue::Ints(v) => Some(v.clone()),
            DynValue::Null => Some(vec![]),
            _ => None,
        }
    }

    pub fn floats(&self) -> Option<Vec<f32>> {
        match self {
            DynValue::Float(x) => Some(vec![*x]),
            DynValue::Floats(v) => Some(v.clone()),
            DynValue::Int(x) => Some(vec![*x as f32]),
            DynValue::Ints(v) => Some(v.iter().map(|&x| x as f32).collect()),
            DynValue::Null => Some(vec![]),
            _ => None,
        }
    }

    /// The comma-joined textual form used for String/Character fields.
    pub fn text(&self) -> Option<String> {
        match self {
            DynValue::Str(s) => Some(s.clone()),
            DynValue::Strs(v) => Some(v.join(",")),
            _ => None,
        }
    }

    /// Equality up to attribute normalization: a scalar equals the
    /// one-element vector holding it, and `Null` equals the empty
    /// vector.
    pub fn normalized_eq(&self, other: &DynValue) -> bool {
        use DynValue::*;
        match (self, other) {
            (Int(a), Ints(b)) | (Ints(b), Int(a)) => b.as_slice() == [*a],
            (Float(a), Floats(b)) | (Floats(b), Float(a)) => {
                b.len() == 1 && float_eq(*a, b[0])
            }
            (Str(a), Strs(b)) | (Strs(b), Str(a)) => b.len() == 1 && &b[0] == a,
            (Null, Ints(b)) | (Ints(b), Null) => b.is_empty(),
            (Null, Floats(b)) | (Floats(b), Null) => b.is_empty(),
            (Float(a), Float(b)) => float_eq(*a, *b),
            (Floats(a), Floats(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| float_eq(x, y))
            }
            (a, b) => a == b,
        }
    }

}

fn float_eq(a: f32, b: f32) -> bool {
    a.to_bits() == b.to_bits() || a == b
}

impl From<i32> for DynValue {
    fn from(x: i32) -> Self {
        DynValue::Int(x)
    }
}

impl From<Vec<i32>> for DynValue {
    fn from(v: Vec<i32>) -> Self {
        DynValue::Ints(v)
    }
}

impl From<f32> for DynValue {
    fn from(x: f32) -> Self {
        DynValue::Float(x)
    }
}

impl From<Vec<f32>> for DynValue {
    fn from(v: Vec<f32>) -> Self {
        DynValue::Floats(v)
    }
}

impl From<&str> for DynValue {
    fn from(s: &str) -> Self {
        DynValue::Str(s.to_owned())
    }
}

impl From<String> for DynValue {
    fn from(s: String) -> Self {
        DynValue::Str(s)
    }
}

impl From<Vec<String>> for DynValue {
    fn from(v: Vec<String>) -> Self {
        DynValue::Strs(v)
    }
}

impl From<bool> for DynValue {
    fn from(b: bool) -> Self {
        if b {
            DynValue::Flag
        } else {
            DynValue::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_and_singleton_vector_normalize_equal() {
        assert!(DynValue::Int(5).normalized_eq(&DynValue::Ints(vec![5])));
        assert!(DynValue::Str("x".into()).normalized_eq(&DynValue::Strs(vec!["x".into()])));
        assert!(DynValue::Null.normalized_eq(&DynValue::Ints(vec![])));
        assert!(!DynValue::Int(5).normalized_eq(&DynValue::Ints(vec![5, 5])));
    }

    #[test]
    fn missing_floats_compare_by_bits() {
        let missing = f32::from_bits(crate::types::MISSING_FLOAT_BITS);
        assert!(DynValue::Float(missing).normalized_eq(&DynValue::Floats(vec![missing])));
    }

    #[test]
    fn text_join() {
        let v = DynValue::Strs(vec!["a".into(), "bc".into()]);
        assert_eq!(v.text().unwrap(), "a,bc");
        assert_eq!(v.num_elements(), 4);
    }
}
