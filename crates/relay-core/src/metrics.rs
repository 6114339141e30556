//! Helpers for prometheus label encoding.

use std::fmt::Write;

use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};

use crate::strng::RichStrng;

impl EncodeLabelValue for RichStrng {
	fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		encoder.write_str(self.as_str())
	}
}

/// A label that encodes as `unknown` when the value is absent.
///
/// Prometheus requires every series in a family to carry the full label set,
/// so optional dimensions need a stand-in value.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct DefaultedUnknown<T>(Option<T>);

impl<T> DefaultedUnknown<T> {
	pub fn inner(self) -> Option<T> {
		self.0
	}
}

impl<T> From<Option<T>> for DefaultedUnknown<T> {
	fn from(value: Option<T>) -> Self {
		DefaultedUnknown(value)
	}
}

impl From<&str> for DefaultedUnknown<RichStrng> {
	fn from(value: &str) -> Self {
		DefaultedUnknown(Some(value.into()))
	}
}

impl From<String> for DefaultedUnknown<RichStrng> {
	fn from(value: String) -> Self {
		DefaultedUnknown(Some(value.into()))
	}
}

impl From<crate::Strng> for DefaultedUnknown<RichStrng> {
	fn from(value: crate::Strng) -> Self {
		DefaultedUnknown(Some(value.into()))
	}
}

impl From<&crate::Strng> for DefaultedUnknown<RichStrng> {
	fn from(value: &crate::Strng) -> Self {
		DefaultedUnknown(Some(value.into()))
	}
}

impl<T: EncodeLabelValue> EncodeLabelValue for DefaultedUnknown<T> {
	fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		match &self.0 {
			Some(i) => i.encode(encoder),
			None => encoder.write_str("unknown"),
		}
	}
}

/// Encodes any [std::fmt::Display] type as its display form.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct EncodeDisplay<T>(pub T);

impl<T: std::fmt::Display> EncodeLabelValue for EncodeDisplay<T> {
	fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		write!(encoder, "{}", self.0)
	}
}

impl<T> From<T> for EncodeDisplay<T> {
	fn from(value: T) -> Self {
		EncodeDisplay(value)
	}
}

#[cfg(test)]
mod tests {
	use prometheus_client::encoding::EncodeLabelSet;
	use prometheus_client::metrics::counter::Counter;
	use prometheus_client::metrics::family::Family;
	use prometheus_client::registry::Registry;

	use super::*;
	use crate::strng;

	#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
	struct Labels {
		route: DefaultedUnknown<RichStrng>,
		status: DefaultedUnknown<EncodeDisplay<u16>>,
	}

	#[test]
	fn defaulted_unknown_encodes() {
		let mut registry = Registry::default();
		let fam = Family::<Labels, Counter>::default();
		registry.register("test", "help", fam.clone());
		fam
			.get_or_create(&Labels {
				route: strng::new("r1").into(),
				status: None.into(),
			})
			.inc();
		let mut out = String::new();
		prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
		assert!(out.contains("route=\"r1\""));
		assert!(out.contains("status=\"unknown\""));
	}
}
