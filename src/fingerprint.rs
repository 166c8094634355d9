//! Turns a task's executable logic into a stable digest.
//!
//! A [`Fingerprint`] has three components: the stripped source text, the
//! source normalized to a whitespace- and comment-insensitive token
//! stream (a fast signal that ignores formatting-only edits), and the
//! concatenated source of every declared `depends_on` unit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use console::Style;
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

use crate::error::TaskError;
use crate::hash::Hash32;
use crate::logic::Logic;

/// A digest summarizing a task's executable logic and its declared
/// logic-level dependencies. Any mismatch between a freshly computed
/// fingerprint and the recorded one means the code changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub source: Hash32,
    pub compiled: Hash32,
    pub depends_on: Hash32,
}

/// Computes fingerprints, caching source extraction per logic identity.
///
/// The cache matters for parametrized families of tasks that share one
/// logic unit; extraction and stripping happen once per unit. The cache
/// is owned by the engine instance, so tests can [`clear`](Self::clear)
/// it between cases.
#[derive(Default)]
pub struct FingerprintEngine {
    cache: Mutex<HashMap<String, Arc<str>>>,
}

impl FingerprintEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every cached source extraction.
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// The stripped source text of a logic unit, extracted once per
    /// identity and cached.
    pub fn source_text(&self, logic: &dyn Logic) -> Result<Arc<str>, TaskError> {
        let mut cache = self.cache.lock().unwrap();

        if let Some(source) = cache.get(logic.identity()) {
            return Ok(Arc::clone(source));
        }

        let stripped: Arc<str> = strip_attributes(logic.source()?).into();
        cache.insert(logic.identity().to_owned(), Arc::clone(&stripped));

        Ok(stripped)
    }

    /// Computes the fingerprint of a logic unit together with its
    /// declared `depends_on` units, concatenated in declaration order.
    pub fn fingerprint(
        &self,
        logic: &dyn Logic,
        depends_on: &[Arc<dyn Logic>],
    ) -> Result<Fingerprint, TaskError> {
        let source = self.source_text(logic)?;

        let mut concatenated = String::new();
        for dependency in depends_on {
            concatenated.push_str(&self.source_text(dependency.as_ref())?);
        }

        Ok(Fingerprint {
            source: Hash32::hash(source.as_bytes()),
            compiled: Hash32::hash(normalize(&source)),
            depends_on: Hash32::hash(concatenated),
        })
    }
}

/// Removes attribute lines from a source text.
///
/// Lines whose trimmed text starts with the attribute marker are dropped
/// wherever they appear, so adding or reordering attributes alone never
/// changes a fingerprint. Blank lines and everything else are kept
/// verbatim.
fn strip_attributes(source: &str) -> String {
    let mut out = String::with_capacity(source.len());

    for line in source.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#[") || trimmed.starts_with("#!") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    out
}

/// Collapses a source text into its token stream: comments dropped,
/// whitespace runs folded to a single space. String literals are kept
/// intact so comment markers inside them are not misread.
fn normalize(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }

        if c == '/' {
            match chars.peek() {
                Some('/') => {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                    pending_space = !out.is_empty();
                    continue;
                }
                Some('*') => {
                    chars.next();
                    let mut depth = 1usize;
                    let mut prev = '\0';
                    for c in chars.by_ref() {
                        if prev == '/' && c == '*' {
                            depth += 1;
                            prev = '\0';
                        } else if prev == '*' && c == '/' {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                            prev = '\0';
                        } else {
                            prev = c;
                        }
                    }
                    pending_space = !out.is_empty();
                    continue;
                }
                _ => {}
            }
        }

        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);

        if c == '"' {
            let mut escaped = false;
            for c in chars.by_ref() {
                out.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    break;
                }
            }
        }
    }

    out
}

/// Renders a human-readable line diff between the source recorded at the
/// end of the last successful run and the current source.
///
/// Returns `None` when no previous record exists or when nothing changed.
pub fn diff(previous: Option<&str>, current: &str) -> Option<String> {
    let previous = previous?;
    if previous == current {
        return None;
    }

    let diff = TextDiff::from_lines(previous, current);
    let mut out = String::new();

    for change in diff.iter_all_changes() {
        let (sign, style) = match change.tag() {
            ChangeTag::Delete => ("-", Style::new().red()),
            ChangeTag::Insert => ("+", Style::new().green()),
            ChangeTag::Equal => (" ", Style::new().dim()),
        };
        out.push_str(&format!("{}{}", style.apply_to(sign), style.apply_to(change)));
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::FnLogic;

    fn unit(name: &str, source: &str) -> FnLogic {
        FnLogic::new(name, source, |_ctx| Ok(()))
    }

    #[test]
    fn test_strip_drops_attribute_lines() {
        let source = "#[tracked]\nfn body() {\n    #[allow(unused)]\n    let x = 1;\n}\n";
        assert_eq!(
            strip_attributes(source),
            "fn body() {\n    let x = 1;\n}\n",
        );
    }

    #[test]
    fn test_strip_keeps_blank_lines() {
        assert_eq!(strip_attributes("a\n\nb\n"), "a\n\nb\n");
    }

    #[test]
    fn test_normalize_ignores_formatting() {
        let a = normalize("fn f() { 1 + 1 } // comment");
        let b = normalize("fn f()   {\n    1 + 1 /* block */\n}");
        assert_eq!(a, b);
        assert_eq!(a, "fn f() { 1 + 1 }");
    }

    #[test]
    fn test_normalize_keeps_string_literals() {
        let a = normalize(r#"let s = "no // comment";"#);
        assert!(a.contains("no // comment"));
    }

    #[test]
    fn test_fingerprint_sensitive_to_body() {
        let engine = FingerprintEngine::new();
        let a = engine.fingerprint(&unit("a", "fn f() { 1 }"), &[]).unwrap();
        let b = engine.fingerprint(&unit("b", "fn f() { 2 }"), &[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_ignores_attributes() {
        let engine = FingerprintEngine::new();
        let plain = engine.fingerprint(&unit("a", "fn f() { 1 }"), &[]).unwrap();
        let decorated = engine
            .fingerprint(&unit("b", "#[tracked]\nfn f() { 1 }"), &[])
            .unwrap();
        assert_eq!(plain, decorated);
    }

    #[test]
    fn test_fingerprint_tracks_depends_on() {
        let engine = FingerprintEngine::new();
        let helper_v1: Arc<dyn Logic> = Arc::new(unit("helper", "fn helper() { 1 }"));
        let helper_v2: Arc<dyn Logic> = Arc::new(unit("helper2", "fn helper() { 2 }"));

        let a = engine
            .fingerprint(&unit("task", "fn f() {}"), &[Arc::clone(&helper_v1)])
            .unwrap();
        let b = engine
            .fingerprint(&unit("task", "fn f() {}"), &[helper_v2])
            .unwrap();

        assert_eq!(a.source, b.source);
        assert_ne!(a.depends_on, b.depends_on);
    }

    #[test]
    fn test_cache_is_keyed_by_identity() {
        let engine = FingerprintEngine::new();
        let first = engine.fingerprint(&unit("same", "fn f() { 1 }"), &[]).unwrap();
        // Same identity, different source: the cached extraction wins.
        let second = engine.fingerprint(&unit("same", "fn f() { 2 }"), &[]).unwrap();
        assert_eq!(first, second);

        engine.clear();
        let third = engine.fingerprint(&unit("same", "fn f() { 2 }"), &[]).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn test_opaque_logic_fails_loudly() {
        let engine = FingerprintEngine::new();
        let opaque = FnLogic::opaque("opaque", |_ctx| Ok(()));
        assert!(matches!(
            engine.fingerprint(&opaque, &[]),
            Err(TaskError::SourceUnavailable { .. }),
        ));
    }

    #[test]
    fn test_diff_contract() {
        assert!(diff(None, "fn f() {}").is_none());
        assert!(diff(Some("fn f() {}"), "fn f() {}").is_none());

        let rendered = diff(Some("fn f() { 1 }\n"), "fn f() { 2 }\n").unwrap();
        assert!(rendered.contains("fn f() { 1 }"));
        assert!(rendered.contains("fn f() { 2 }"));
    }
}
