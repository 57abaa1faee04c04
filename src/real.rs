//! The element type shared by host arrays and device kernels.
//!
//! `Real` is `f32` by default and `f64` with the `f64` feature. Kernel sources
//! never name a concrete float type; they use the `Real` alias that
//! [`precision_header`] declares in front of every compiled program.

/// The float stored in every buffer.
#[cfg(not(feature = "f64"))]
pub type Real = f32;

/// The float stored in every buffer.
#[cfg(feature = "f64")]
pub type Real = f64;

/// Size of one [`Real`] in bytes.
pub const REAL_BYTES: usize = core::mem::size_of::<Real>();

/// Name of the pipeline-overridable constant carrying [`REAL_BYTES`] into kernels.
pub const REAL_BYTES_CONSTANT: &str = "REAL_BYTES";

/// Returns `true` when `Real` is a 64-bit float.
#[must_use]
pub const fn is_double() -> bool {
    REAL_BYTES == core::mem::size_of::<f64>()
}

/// WGSL spelling of the concrete element type.
#[must_use]
pub const fn wgsl_type() -> &'static str {
    if is_double() { "f64" } else { "f32" }
}

/// Header prepended to every kernel program.
///
/// Maps the generic `Real` alias onto the configured width and declares the
/// overridable constant the build passes in.
#[must_use]
pub fn precision_header() -> String {
    format!(
        "alias Real = {};\noverride {}: u32;\n",
        wgsl_type(),
        REAL_BYTES_CONSTANT
    )
}

/// Converts a literal `f64` into a [`Real`].
///
/// Used for configuration arrays that are written as `f64` literals.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::unnecessary_cast)]
pub fn real(value: f64) -> Real {
    value as Real
}

/// Converts a slice of `f64` literals into owned [`Real`] values.
#[must_use]
pub fn reals(values: &[f64]) -> Vec<Real> {
    values.iter().copied().map(real).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_declares_alias_and_constant() {
        let header = precision_header();
        assert!(header.contains("alias Real = "));
        assert!(header.contains("override REAL_BYTES: u32;"));
        assert!(header.contains(wgsl_type()));
    }

    #[test]
    fn literal_conversion_keeps_length() {
        assert_eq!(reals(&[0.5, -1.0, 2.0]).len(), 3);
        assert_eq!(real(0.5), 0.5);
    }
}
