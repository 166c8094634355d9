//! Executable units of work.
//!
//! A task's body may come from anywhere, as long as it has a stable
//! identity and an inspectable source text. The [`Logic`] trait is the
//! single seam: the fingerprint engine introspects it, the execution
//! controller invokes it.

use crate::error::TaskError;
use crate::run::RunContext;

/// An executable unit with inspectable source and a stable identity.
///
/// The identity seeds the task's identity hash; two tasks with the same
/// logic and the same input/output path set collide on purpose, which is
/// what lets metadata persisted on a prior run be found again.
pub trait Logic: Send + Sync {
    /// Stable name of this unit.
    fn identity(&self) -> &str;

    /// The literal source text of the unit.
    ///
    /// Implementations without an inspectable source must return
    /// [`TaskError::SourceUnavailable`] rather than an empty string; a
    /// silently omitted fingerprint component is a correctness hole.
    fn source(&self) -> Result<&str, TaskError>;

    /// Run the unit against the paths exposed by the context.
    fn execute(&self, ctx: &RunContext) -> anyhow::Result<()>;
}

type Body = Box<dyn Fn(&RunContext) -> anyhow::Result<()> + Send + Sync>;

/// A [`Logic`] built from a named closure and its captured source text.
///
/// Most callers construct this through the [`logic!`](crate::logic!)
/// macro, which captures the closure's source via `stringify!`.
pub struct FnLogic {
    identity: String,
    source: Option<String>,
    body: Body,
}

impl FnLogic {
    pub fn new(
        identity: impl Into<String>,
        source: impl Into<String>,
        body: impl Fn(&RunContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            identity: identity.into(),
            source: Some(source.into()),
            body: Box::new(body),
        }
    }

    /// A unit with no inspectable source. Fingerprinting it fails loudly.
    pub fn opaque(
        identity: impl Into<String>,
        body: impl Fn(&RunContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            identity: identity.into(),
            source: None,
            body: Box::new(body),
        }
    }
}

impl Logic for FnLogic {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn source(&self) -> Result<&str, TaskError> {
        self.source
            .as_deref()
            .ok_or_else(|| TaskError::SourceUnavailable {
                identity: self.identity.clone(),
            })
    }

    fn execute(&self, ctx: &RunContext) -> anyhow::Result<()> {
        (self.body)(ctx)
    }
}

impl std::fmt::Debug for FnLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnLogic")
            .field("identity", &self.identity)
            .field("source", &self.source.is_some())
            .finish()
    }
}

/// Builds a [`FnLogic`] from a name and a closure, capturing the closure's
/// source text so the fingerprint engine can hash it.
///
/// ```
/// use tatara::logic;
///
/// let unit = logic!("concat", |ctx| {
///     let data = std::fs::read(ctx.input("in")?)?;
///     std::fs::write(ctx.output("out")?, data)?;
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! logic {
    ($name:expr, $body:expr) => {
        $crate::FnLogic::new($name, stringify!($body), $body)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macro_captures_source() {
        let unit = logic!("noop", |_ctx| Ok(()));
        assert_eq!(unit.identity(), "noop");
        assert!(unit.source().unwrap().contains("Ok(())"));
    }

    #[test]
    fn test_opaque_has_no_source() {
        let unit = FnLogic::opaque("mystery", |_ctx| Ok(()));
        assert!(matches!(
            unit.source(),
            Err(TaskError::SourceUnavailable { identity }) if identity == "mystery",
        ));
    }
}
