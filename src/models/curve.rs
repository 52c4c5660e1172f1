//! Named curves and the curve registry.
//!
//! A curve is a pure function `f(x, p1..pk)` plus its ordered formal parameter
//! names. Dispatch is a map lookup by name; there is no code generation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::FitError;

/// Evaluator signature: `f(x, params)` with `params` in formal order.
pub type CurveFn = Arc<dyn Fn(f64, &[f64]) -> f64 + Send + Sync>;

/// A registered curve. Immutable once constructed.
#[derive(Clone)]
pub struct Curve {
    name: String,
    params: Vec<String>,
    eval: CurveFn,
}

impl Curve {
    /// Build a curve, checking that its name and parameter list are usable.
    pub fn new<F>(name: impl Into<String>, params: &[&str], eval: F) -> Result<Self, FitError>
    where
        F: Fn(f64, &[f64]) -> f64 + Send + Sync + 'static,
    {
        let name = name.into();
        let bad = |reason: &str| FitError::CurveSignature {
            curve: name.clone(),
            reason: reason.to_string(),
        };
        if name.trim().is_empty() {
            return Err(bad("curve name is empty"));
        }
        if params.is_empty() {
            return Err(bad("a curve needs at least one parameter"));
        }
        for (i, p) in params.iter().enumerate() {
            if p.trim().is_empty() {
                return Err(bad("empty parameter name"));
            }
            if params[..i].contains(p) {
                return Err(bad(&format!("duplicate parameter `{p}`")));
            }
        }
        Ok(Self {
            name,
            params: params.iter().map(|p| p.to_string()).collect(),
            eval: Arc::new(eval),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Formal parameter names, in evaluation order.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p == name)
    }

    /// Evaluate at a single `x`. `params` must be in formal order.
    pub fn evaluate(&self, x: f64, params: &[f64]) -> f64 {
        debug_assert_eq!(params.len(), self.params.len());
        (self.eval)(x, params)
    }

    /// Evaluate over many `x` values.
    pub fn evaluate_many(&self, xs: &[f64], params: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.evaluate(x, params)).collect()
    }
}

impl fmt::Debug for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Curve")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Name → curve map. Read-only once shared.
#[derive(Debug, Clone, Default)]
pub struct CurveRegistry {
    curves: BTreeMap<String, Arc<Curve>>,
}

impl CurveRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in catalog.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        for curve in super::catalog::builtin_curves() {
            // Catalog names are unique; a clash here is a programming error
            // that the catalog tests catch.
            let _ = reg.register(curve);
        }
        reg
    }

    /// Process-wide, read-only registry holding the built-in catalog.
    pub fn builtin() -> &'static CurveRegistry {
        static BUILTIN: OnceLock<CurveRegistry> = OnceLock::new();
        BUILTIN.get_or_init(CurveRegistry::with_builtins)
    }

    pub fn register(&mut self, curve: Curve) -> Result<(), FitError> {
        if self.curves.contains_key(curve.name()) {
            return Err(FitError::DuplicateCurve(curve.name().to_string()));
        }
        self.curves.insert(curve.name().to_string(), Arc::new(curve));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Curve>, FitError> {
        self.curves
            .get(name)
            .cloned()
            .ok_or_else(|| FitError::UnknownCurve(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.curves.contains_key(name)
    }

    /// Registered curves, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Curve>> {
        self.curves.values()
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curve_rejects_bad_signatures() {
        assert!(Curve::new("", &["a"], |_, _| 0.0).is_err());
        assert!(Curve::new("c", &[], |_, _| 0.0).is_err());
        assert!(Curve::new("c", &["a", "a"], |_, _| 0.0).is_err());
    }

    #[test]
    fn registry_lookup_and_duplicates() {
        let mut reg = CurveRegistry::new();
        let c = Curve::new("line", &["m", "b"], |x, p| p[0] * x + p[1]).unwrap();
        reg.register(c.clone()).unwrap();
        assert_eq!(reg.register(c), Err(FitError::DuplicateCurve("line".into())));

        let line = reg.get("line").unwrap();
        assert_eq!(line.params(), &["m".to_string(), "b".to_string()]);
        assert_eq!(line.evaluate_many(&[0.0, 2.0], &[3.0, 1.0]), vec![1.0, 7.0]);
        assert!(matches!(reg.get("nope"), Err(FitError::UnknownCurve(_))));
    }

    #[test]
    fn builtin_registry_is_shared() {
        let a = CurveRegistry::builtin();
        let b = CurveRegistry::builtin();
        assert!(std::ptr::eq(a, b));
        assert!(a.contains("linear_plateau"));
    }
}
