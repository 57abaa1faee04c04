//! Kernel templates with named insertion points.
//!
//! A template is kernel source containing markers of the form `/*@Name*/`.
//! Composition replaces each marker with a fragment (or nothing) and always
//! starts from the parsed template, so composing twice with the same
//! fragments yields the same text no matter what was composed before.
//!
//! ```
//! use weft_nn::template::KernelTemplate;
//!
//! let template = KernelTemplate::parse("a /*@Slot*/ b").unwrap();
//! assert_eq!(template.compose(&[("Slot", "x")]).unwrap(), "a x b");
//! assert_eq!(template.compose::<&str>(&[]).unwrap(), "a  b");
//! ```

use crate::error::{Error, Result};

const OPEN: &str = "/*@";
const CLOSE: &str = "*/";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Slot(String),
}

/// Parsed kernel template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelTemplate {
    original: String,
    segments: Vec<Segment>,
}

fn is_slot_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl KernelTemplate {
    /// Splits `source` into text and insertion points.
    ///
    /// Comments that open with `/*@` but do not hold a plain identifier are
    /// kept as text.
    ///
    /// # Errors
    ///
    /// [`Error::Template`] if an insertion point appears more than once.
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = source;

        while let Some(start) = rest.find(OPEN) {
            let after = &rest[start + OPEN.len()..];
            let Some(end) = after.find(CLOSE) else {
                break;
            };
            let name = &after[..end];
            if is_slot_name(name) {
                text.push_str(&rest[..start]);
                if !text.is_empty() {
                    segments.push(Segment::Text(core::mem::take(&mut text)));
                }
                if segments.iter().any(|s| matches!(s, Segment::Slot(n) if n == name)) {
                    return Err(Error::Template(format!(
                        "insertion point `{name}` appears more than once"
                    )));
                }
                segments.push(Segment::Slot(name.to_string()));
            } else {
                text.push_str(&rest[..start + OPEN.len() + end + CLOSE.len()]);
            }
            rest = &after[end + CLOSE.len()..];
        }

        text.push_str(rest);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self {
            original: source.to_string(),
            segments,
        })
    }

    /// The unmodified template text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.original
    }

    /// Names of the insertion points, in order of appearance.
    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Slot(name) => Some(name.as_str()),
            Segment::Text(_) => None,
        })
    }

    /// Returns `true` if the template has an insertion point called `name`.
    #[must_use]
    pub fn has_slot(&self, name: &str) -> bool {
        self.slots().any(|slot| slot == name)
    }

    /// Produces source with each insertion point replaced by its fragment.
    ///
    /// Points without a fragment are removed.
    ///
    /// # Errors
    ///
    /// [`Error::Template`] if a fragment names an unknown insertion point or
    /// the same point is given twice.
    pub fn compose<S: AsRef<str>>(&self, fragments: &[(S, S)]) -> Result<String> {
        for (i, (name, _)) in fragments.iter().enumerate() {
            let name = name.as_ref();
            if !self.has_slot(name) {
                return Err(Error::Template(format!("unknown insertion point `{name}`")));
            }
            if fragments[..i].iter().any(|(n, _)| n.as_ref() == name) {
                return Err(Error::Template(format!(
                    "insertion point `{name}` given more than once"
                )));
            }
        }

        let mut out = String::with_capacity(self.original.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Slot(name) => {
                    if let Some((_, fragment)) = fragments.iter().find(|(n, _)| n.as_ref() == name) {
                        out.push_str(fragment.as_ref());
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_slots_in_order() {
        let t = KernelTemplate::parse("/*@Head*/ fn f() { /*@Body*/ }").unwrap();
        assert_eq!(t.slots().collect::<Vec<_>>(), ["Head", "Body"]);
    }

    #[test]
    fn plain_comments_stay_text() {
        let t = KernelTemplate::parse("/* note */ x /*@ not a slot */").unwrap();
        assert_eq!(t.slots().count(), 0);
        assert_eq!(t.compose::<&str>(&[]).unwrap(), "/* note */ x /*@ not a slot */");
    }

    #[test]
    fn recomposing_starts_from_the_template() {
        let t = KernelTemplate::parse("a /*@S*/ b").unwrap();
        let first = t.compose(&[("S", "one")]).unwrap();
        let second = t.compose(&[("S", "two")]).unwrap();
        let again = t.compose(&[("S", "one")]).unwrap();
        assert_eq!(first, "a one b");
        assert_eq!(second, "a two b");
        assert_eq!(first, again);
    }

    #[test]
    fn unknown_and_repeated_points_fail() {
        let t = KernelTemplate::parse("a /*@S*/ b").unwrap();
        assert!(matches!(t.compose(&[("T", "x")]), Err(Error::Template(_))));
        assert!(matches!(t.compose(&[("S", "x"), ("S", "y")]), Err(Error::Template(_))));
        assert!(KernelTemplate::parse("/*@S*/ /*@S*/").is_err());
    }

    #[test]
    fn unterminated_marker_is_text() {
        let t = KernelTemplate::parse("x /*@Open").unwrap();
        assert_eq!(t.compose::<&str>(&[]).unwrap(), "x /*@Open");
    }
}
