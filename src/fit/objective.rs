//! Objective builder: sum of squared errors over the free parameters.
//!
//! `build_loss` resolves the free/fixed partition once per group. The
//! resulting [`Loss`] only ever sees the free-parameter vector; fixed values
//! are spliced back into curve order on every evaluation.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{ParamKind, Parameter};
use crate::error::FitError;
use crate::models::Curve;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    /// Index into the free vector.
    Free(usize),
    Fixed(f64),
}

/// SSE loss for one curve under one free/fixed partition.
#[derive(Debug, Clone)]
pub struct Loss {
    curve: Arc<Curve>,
    slots: Vec<Slot>,
    free_names: Vec<String>,
}

/// Build the loss for `curve` with `fixed` held constant.
///
/// Fails with [`FitError::CurveSignature`] unless the fixed names are a strict
/// subset of the curve's parameters (at least one parameter stays free).
pub fn build_loss(curve: Arc<Curve>, fixed: &BTreeMap<String, f64>) -> Result<Loss, FitError> {
    let bad = |reason: String| FitError::CurveSignature {
        curve: curve.name().to_string(),
        reason,
    };

    for (name, value) in fixed {
        if curve.param_index(name).is_none() {
            return Err(bad(format!("fixed parameter `{name}` is not a parameter")));
        }
        if !value.is_finite() {
            return Err(bad(format!("fixed parameter `{name}` is not finite")));
        }
    }
    if fixed.len() >= curve.params().len() {
        return Err(bad("every parameter is fixed; nothing to estimate".into()));
    }

    let mut slots = Vec::with_capacity(curve.params().len());
    let mut free_names = Vec::new();
    for name in curve.params() {
        match fixed.get(name) {
            Some(&v) => slots.push(Slot::Fixed(v)),
            None => {
                slots.push(Slot::Free(free_names.len()));
                free_names.push(name.clone());
            }
        }
    }

    Ok(Loss {
        curve,
        slots,
        free_names,
    })
}

impl Loss {
    pub fn curve(&self) -> &Arc<Curve> {
        &self.curve
    }

    /// Free parameter names, in curve order.
    pub fn free_names(&self) -> &[String] {
        &self.free_names
    }

    pub fn n_free(&self) -> usize {
        self.free_names.len()
    }

    /// Splice the free vector and fixed values into curve order.
    pub fn assemble(&self, free: &[f64]) -> Vec<f64> {
        self.slots
            .iter()
            .map(|s| match *s {
                Slot::Free(i) => free[i],
                Slot::Fixed(v) => v,
            })
            .collect()
    }

    /// Tagged parameter list for a fit record.
    pub fn parameters(&self, free: &[f64]) -> Vec<Parameter> {
        self.curve
            .params()
            .iter()
            .zip(self.slots.iter())
            .map(|(name, slot)| match *slot {
                Slot::Free(i) => Parameter {
                    name: name.clone(),
                    kind: ParamKind::Free,
                    value: free[i],
                },
                Slot::Fixed(v) => Parameter {
                    name: name.clone(),
                    kind: ParamKind::Fixed,
                    value: v,
                },
            })
            .collect()
    }

    /// `Σ (y_i - f(x_i; free ∪ fixed))²`.
    pub fn value(&self, free: &[f64], x: &[f64], y: &[f64]) -> f64 {
        let full = self.assemble(free);
        x.iter()
            .zip(y.iter())
            .map(|(&xi, &yi)| {
                let r = yi - self.curve.evaluate(xi, &full);
                r * r
            })
            .sum()
    }

    /// Bind the loss to one group's data.
    pub fn bind<'a>(&'a self, x: &'a [f64], y: &'a [f64]) -> Objective<'a> {
        Objective { loss: self, x, y }
    }
}

/// A loss bound to data: a scalar function of the free vector only.
#[derive(Debug, Clone, Copy)]
pub struct Objective<'a> {
    loss: &'a Loss,
    x: &'a [f64],
    y: &'a [f64],
}

impl<'a> Objective<'a> {
    pub fn value(&self, free: &[f64]) -> f64 {
        self.loss.value(free, self.x, self.y)
    }

    /// Loss value with NaN and `-inf` mapped to `+inf`, for solvers that order points.
    pub fn value_or_inf(&self, free: &[f64]) -> f64 {
        let v = self.value(free);
        if v.is_finite() { v } else { f64::INFINITY }
    }

    pub fn dim(&self) -> usize {
        self.loss.n_free()
    }

    pub fn loss(&self) -> &'a Loss {
        self.loss
    }

    pub fn n_obs(&self) -> usize {
        self.x.len()
    }
}
