//! Process-wide kernel source registry.
//!
//! Sources are looked up by layer identity (the layer's name with spaces
//! removed). Built-in layers ship their WGSL inside the crate; others can be
//! added with [`register_kernel_source`]. Each source is validated once, when
//! it is first loaded, and cached for the life of the process.

use crate::error::{Error, Result};
use briny::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

const LINEAR: &str = include_str!("../kernels/linear.wgsl");

const BUILTIN: &[(&str, &str)] = &[("Linear", LINEAR)];

/// Upper bound on a single kernel source, in bytes.
const MAX_SOURCE_LEN: usize = 65536;

lazy_static::lazy_static! {
    static ref SOURCES: Mutex<HashMap<String, Arc<str>>> = Mutex::new(HashMap::new());
}

/// WGSL text awaiting admission to the registry.
struct WgslSource<'a>(&'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        let src = self.0;

        if src.trim().is_empty() || src.len() > MAX_SOURCE_LEN {
            return Err(ValidationError);
        }

        // no textual inclusion; everything a kernel needs is composed in
        if src.contains("#include") || src.contains("#import") {
            return Err(ValidationError);
        }

        let forbidden = ["asm", "unsafe", "std::", "\0"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }

        Ok(())
    }
}

fn admit(identity: &str, text: &str) -> Result<Arc<str>> {
    WgslSource(text).validate().map_err(|_| Error::InvalidKernel {
        identity: identity.to_string(),
        reason: "source failed safety validation".to_string(),
    })?;
    Ok(Arc::from(text))
}

/// Returns the kernel source registered for `identity`.
///
/// # Errors
///
/// [`Error::MissingKernel`] if nothing is registered or built in under that
/// identity, [`Error::InvalidKernel`] if a built-in source fails validation.
pub fn kernel_source(identity: &str) -> Result<Arc<str>> {
    let mut sources = SOURCES.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(source) = sources.get(identity) {
        return Ok(Arc::clone(source));
    }

    let (_, text) = BUILTIN
        .iter()
        .find(|(name, _)| *name == identity)
        .ok_or_else(|| Error::MissingKernel(identity.to_string()))?;

    let source = admit(identity, text)?;
    tracing::debug!(identity, bytes = source.len(), "kernel source loaded");
    sources.insert(identity.to_string(), Arc::clone(&source));
    Ok(source)
}

/// Registers the kernel source for a layer identity.
///
/// # Errors
///
/// [`Error::InvalidKernel`] if the text fails validation, [`Error::Config`]
/// if a different source is already loaded under that identity.
pub fn register_kernel_source(identity: &str, text: &str) -> Result<()> {
    let source = admit(identity, text)?;
    let mut sources = SOURCES.lock().unwrap_or_else(PoisonError::into_inner);
    match sources.get(identity) {
        Some(existing) if **existing == *text => Ok(()),
        Some(_) => Err(Error::Config(format!(
            "a different kernel source is already registered for `{identity}`"
        ))),
        None => {
            sources.insert(identity.to_string(), source);
            Ok(())
        }
    }
}

/// Checks that `source` declares every entry point in `names`.
///
/// # Errors
///
/// [`Error::InvalidKernel`] naming the first missing entry point.
pub fn require_entry_points(identity: &str, source: &str, names: &[&str]) -> Result<()> {
    for name in names {
        let declared = source.match_indices("fn ").any(|(at, _)| {
            let rest = source[at + 3..].trim_start();
            rest.strip_prefix(*name)
                .is_some_and(|tail| tail.trim_start().starts_with('('))
        });
        if !declared {
            return Err(Error::InvalidKernel {
                identity: identity.to_string(),
                reason: format!("missing entry point `{name}`"),
            });
        }
    }
    Ok(())
}
