//! Structural query keys.

use std::fmt;

/// A single scalar component of a query key or search parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scalar {
  Null,
  Bool(bool),
  Int(i64),
  Str(String),
}

impl Scalar {
  /// Mirrors the backend convention of dropping empty parameters:
  /// null, `false`, `0` and `""` are all omitted from query strings.
  pub fn is_falsy(&self) -> bool {
    match self {
      Scalar::Null => true,
      Scalar::Bool(b) => !b,
      Scalar::Int(i) => *i == 0,
      Scalar::Str(s) => s.is_empty(),
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Scalar::Int(i) => Some(*i),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Scalar::Str(s) => Some(s),
      _ => None,
    }
  }
}

impl fmt::Display for Scalar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Scalar::Null => f.write_str("null"),
      Scalar::Bool(b) => write!(f, "{}", b),
      Scalar::Int(i) => write!(f, "{}", i),
      Scalar::Str(s) => f.write_str(s),
    }
  }
}

impl From<&str> for Scalar {
  fn from(s: &str) -> Self {
    Scalar::Str(s.to_string())
  }
}

impl From<String> for Scalar {
  fn from(s: String) -> Self {
    Scalar::Str(s)
  }
}

impl From<&String> for Scalar {
  fn from(s: &String) -> Self {
    Scalar::Str(s.clone())
  }
}

impl From<bool> for Scalar {
  fn from(b: bool) -> Self {
    Scalar::Bool(b)
  }
}

macro_rules! scalar_from_int {
  ($($t:ty),*) => {
    $(
      impl From<$t> for Scalar {
        fn from(i: $t) -> Self {
          Scalar::Int(i64::from(i))
        }
      }
    )*
  };
}

scalar_from_int!(i32, i64, u8, u16, u32);

impl From<u64> for Scalar {
  fn from(i: u64) -> Self {
    Scalar::Int(i64::try_from(i).unwrap_or(i64::MAX))
  }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
  fn from(v: Option<T>) -> Self {
    v.map(Into::into).unwrap_or(Scalar::Null)
  }
}

/// Identifies a cached resource: `[entity_type, ...params]`.
///
/// Equality is structural over the whole tuple. A key also acts as a prefix
/// filter for invalidation: `["incident-note"]` matches every notes entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
  parts: Vec<Scalar>,
}

impl QueryKey {
  pub fn new(entity_type: impl Into<String>) -> Self {
    Self {
      parts: vec![Scalar::Str(entity_type.into())],
    }
  }

  /// Append a parameter.
  pub fn with(mut self, part: impl Into<Scalar>) -> Self {
    self.parts.push(part.into());
    self
  }

  pub fn entity_type(&self) -> &str {
    self.parts.first().and_then(Scalar::as_str).unwrap_or("")
  }

  pub fn parts(&self) -> &[Scalar] {
    &self.parts
  }

  pub fn param(&self, index: usize) -> Option<&Scalar> {
    self.parts.get(index + 1)
  }

  /// True if `prefix` is an element-wise prefix of this key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.parts.starts_with(&prefix.parts)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("[")?;
    for (i, part) in self.parts.iter().enumerate() {
      if i > 0 {
        f.write_str(",")?;
      }
      match part {
        Scalar::Str(s) => write!(f, "{:?}", s)?,
        other => write!(f, "{}", other)?,
      }
    }
    f.write_str("]")
  }
}

/// Build a [`QueryKey`] from an entity type and parameters.
///
/// ```
/// use sensordash::query_key;
/// let key = query_key!["incident-note", 5];
/// assert_eq!(key.to_string(), r#"["incident-note",5]"#);
/// ```
#[macro_export]
macro_rules! query_key {
  ($entity:expr $(, $part:expr)* $(,)?) => {
    $crate::cache::QueryKey::new($entity)$(.with($part))*
  };
}
