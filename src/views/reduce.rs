// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reduce functions.
//!
//! Built-ins are `_sum`, `_count` and `_stats`. Caller-supplied reducers
//! implement [`ReduceFn`] and must be associative: the engine reduces leaf
//! values in chunks and then rereduces the partial results, and expects the
//! same answer as a single pass.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

/// Caller-supplied reduce function.
///
/// `keys` holds one `[key, doc_id]` pair per value on a leaf pass and is
/// empty when `rereduce` is true.
pub trait ReduceFn: Send + Sync {
    fn reduce(&self, keys: &[Value], values: &[Value], rereduce: bool) -> Value;
}

impl<F> ReduceFn for F
where
    F: Fn(&[Value], &[Value], bool) -> Value + Send + Sync,
{
    fn reduce(&self, keys: &[Value], values: &[Value], rereduce: bool) -> Value {
        self(keys, values, rereduce)
    }
}

/// A view's reduce step.
#[derive(Clone)]
pub enum Reducer {
    Sum,
    Count,
    Stats,
    Custom(Arc<dyn ReduceFn>),
}

impl fmt::Debug for Reducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Reducer {
    /// Wrap a closure as a custom reducer.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[Value], &[Value], bool) -> Value + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Look up a built-in by its design-document name.
    #[must_use]
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "_sum" => Some(Self::Sum),
            "_count" => Some(Self::Count),
            "_stats" => Some(Self::Stats),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sum => "_sum",
            Self::Count => "_count",
            Self::Stats => "_stats",
            Self::Custom(_) => "custom",
        }
    }

    /// Reduce leaf values.
    pub fn reduce(&self, keys: &[Value], values: &[Value]) -> Value {
        match self {
            Self::Sum => sum(values.iter()),
            Self::Count => json!(values.len()),
            Self::Stats => Stats::from_values(values).to_value(),
            Self::Custom(f) => f.reduce(keys, values, false),
        }
    }

    /// Combine partial results.
    pub fn rereduce(&self, partials: &[Value]) -> Value {
        match self {
            Self::Sum | Self::Count => sum(partials.iter()),
            Self::Stats => partials
                .iter()
                .filter_map(Stats::from_partial)
                .fold(Stats::default(), Stats::merge)
                .to_value(),
            Self::Custom(f) => f.reduce(&[], partials, true),
        }
    }

    /// Reduce in chunks of `chunk` leaves, then rereduce the partials.
    /// `keys` and `values` are parallel and must have the same length.
    pub fn reduce_chunked(&self, keys: &[Value], values: &[Value], chunk: usize) -> Value {
        debug_assert_eq!(keys.len(), values.len(), "reduce keys and values out of step");
        let chunk = chunk.max(1);
        if values.len() <= chunk {
            return self.reduce(keys, values);
        }
        let partials: Vec<Value> = keys
            .chunks(chunk)
            .zip(values.chunks(chunk))
            .map(|(k, v)| self.reduce(k, v))
            .collect();
        self.rereduce(&partials)
    }
}

/// Number accumulator that stays integral while every input is.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn from_value(value: &Value) -> Option<Self> {
        let Value::Number(n) = value else {
            return None;
        };
        Some(match n.as_i64() {
            Some(i) => Self::Int(i),
            None => Self::Float(n.as_f64()?),
        })
    }

    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    fn add(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_add(b)
                .map_or_else(|| Self::Float(a as f64 + b as f64), Self::Int),
            (a, b) => Self::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn mul(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_mul(b)
                .map_or_else(|| Self::Float(a as f64 * b as f64), Self::Int),
            (a, b) => Self::Float(a.as_f64() * b.as_f64()),
        }
    }

    fn min(self, other: Self) -> Self {
        if other.as_f64() < self.as_f64() { other } else { self }
    }

    fn max(self, other: Self) -> Self {
        if other.as_f64() > self.as_f64() { other } else { self }
    }

    fn to_value(self) -> Value {
        match self {
            Self::Int(i) => json!(i),
            Self::Float(f) => json!(f),
        }
    }
}

fn sum<'a>(values: impl Iterator<Item = &'a Value>) -> Value {
    values
        .filter_map(Num::from_value)
        .fold(Num::Int(0), Num::add)
        .to_value()
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Stats {
    sum: Num,
    count: u64,
    min: Option<Num>,
    max: Option<Num>,
    sumsqr: Num,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            sum: Num::Int(0),
            count: 0,
            min: None,
            max: None,
            sumsqr: Num::Int(0),
        }
    }
}

impl Stats {
    fn from_values(values: &[Value]) -> Self {
        values
            .iter()
            .filter_map(Num::from_value)
            .fold(Self::default(), |acc, n| {
                acc.merge(Self {
                    sum: n,
                    count: 1,
                    min: Some(n),
                    max: Some(n),
                    sumsqr: n.mul(n),
                })
            })
    }

    fn from_partial(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let field = |name: &str| obj.get(name).and_then(Num::from_value);
        Some(Self {
            sum: field("sum")?,
            count: obj.get("count")?.as_u64()?,
            min: field("min"),
            max: field("max"),
            sumsqr: field("sumsqr")?,
        })
    }

    fn merge(self, other: Self) -> Self {
        let pick = |a: Option<Num>, b: Option<Num>, f: fn(Num, Num) -> Num| match (a, b) {
            (Some(a), Some(b)) => Some(f(a, b)),
            (a, b) => a.or(b),
        };
        Self {
            sum: self.sum.add(other.sum),
            count: self.count + other.count,
            min: pick(self.min, other.min, Num::min),
            max: pick(self.max, other.max, Num::max),
            sumsqr: self.sumsqr.add(other.sumsqr),
        }
    }

    fn to_value(self) -> Value {
        json!({
            "sum": self.sum.to_value(),
            "count": self.count,
            "min": self.min.map_or(Value::Null, Num::to_value),
            "max": self.max.map_or(Value::Null, Num::to_value),
            "sumsqr": self.sumsqr.to_value(),
        })
    }
}
