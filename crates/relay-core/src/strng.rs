//! Cheaply cloneable, immutable strings.
//!
//! Keys (route IDs, pool names, endpoint addresses) are copied onto every
//! request path object, so they need to be reference counted rather than
//! heap-cloned each time.

use std::ops::Deref;

pub use arcstr::{ArcStr, format, literal};

pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

/// RichStrng wraps [Strng] to allow additional trait implementations
/// (notably prometheus label encoding).
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct RichStrng(Strng);

impl RichStrng {
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}
}

impl Deref for RichStrng {
	type Target = Strng;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<T> From<T> for RichStrng
where
	T: AsRef<str>,
{
	fn from(value: T) -> Self {
		RichStrng(new(value))
	}
}
