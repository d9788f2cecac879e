//! Expression evaluation: dice rolling and arithmetic over a [`RollData`] context.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rulebook_types::{value_as_number, Result, RollData, RulebookError};

use crate::ast::{BinaryOp, DiceTerm, Expr, Function, Keep};
use crate::format_number;
use crate::parser::parse_formula;

// ---------------------------------------------------------------------------
// Roller: source of die faces
// ---------------------------------------------------------------------------

/// Produces one die result in `1..=faces`.
pub trait Roller: Send + Sync {
    fn roll(&self, faces: u32) -> u32;
}

/// Uniform dice backed by a `StdRng`.
pub struct RandRoller {
    rng: Mutex<StdRng>,
}

impl RandRoller {
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible rolls for a given seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandRoller {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl Roller for RandRoller {
    fn roll(&self, faces: u32) -> u32 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(1..=faces.max(1)),
            Err(poisoned) => poisoned.into_inner().gen_range(1..=faces.max(1)),
        }
    }
}

/// Scripted faces, consumed in order. Each face is clamped to the die size;
/// once exhausted every die shows `fallback` (clamped likewise).
pub struct FixedRoller {
    faces: Mutex<VecDeque<u32>>,
    fallback: u32,
}

impl FixedRoller {
    pub fn new(faces: impl IntoIterator<Item = u32>) -> Self {
        Self {
            faces: Mutex::new(faces.into_iter().collect()),
            fallback: 1,
        }
    }

    pub fn with_fallback(mut self, fallback: u32) -> Self {
        self.fallback = fallback;
        self
    }
}

impl Roller for FixedRoller {
    fn roll(&self, faces: u32) -> u32 {
        let next = self
            .faces
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or(self.fallback);
        next.clamp(1, faces.max(1))
    }
}

/// Every die shows its maximum face.
pub struct MaxRoller;

impl Roller for MaxRoller {
    fn roll(&self, faces: u32) -> u32 {
        faces.max(1)
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// The result of evaluating a formula once.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub total: f64,
    /// The formula with paths resolved and dice faces shown, e.g. `1d6[4] + 2`.
    pub formula: String,
}

/// Evaluates formula strings against a flat data context.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, formula: &str, data: &RollData) -> Result<Evaluation>;
}

/// Reference evaluator: arithmetic, dice, `@path` lookups, and a handful of
/// rounding functions. A blank formula evaluates to zero.
#[derive(Clone)]
pub struct DiceEvaluator {
    roller: Arc<dyn Roller>,
}

impl DiceEvaluator {
    pub fn new(roller: impl Roller + 'static) -> Self {
        Self {
            roller: Arc::new(roller),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(RandRoller::seeded(seed))
    }

    fn eval(&self, source: &str, expr: &Expr, data: &RollData, out: &mut String) -> Result<f64> {
        match expr {
            Expr::Number(n) => {
                out.push_str(&format_number(*n));
                Ok(*n)
            }
            Expr::Dice(term) => Ok(self.roll_dice(term, out)),
            Expr::Path(path) => {
                let value = data.get(path).ok_or_else(|| RulebookError::Evaluation {
                    formula: source.to_string(),
                    message: format!("unknown data path '@{path}'"),
                })?;
                let n = value_as_number(value).ok_or_else(|| RulebookError::Evaluation {
                    formula: source.to_string(),
                    message: format!("'@{path}' is not numeric ({value})"),
                })?;
                out.push_str(&format_number(n));
                Ok(n)
            }
            Expr::Neg(inner) => {
                out.push('-');
                let wrap = matches!(**inner, Expr::Binary { .. });
                if wrap {
                    out.push('(');
                }
                let v = self.eval(source, inner, data, out)?;
                if wrap {
                    out.push(')');
                }
                Ok(-v)
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval_operand(source, lhs, *op, false, data, out)?;
                out.push(' ');
                out.push(op.symbol());
                out.push(' ');
                let r = self.eval_operand(source, rhs, *op, true, data, out)?;
                match op {
                    BinaryOp::Add => Ok(l + r),
                    BinaryOp::Sub => Ok(l - r),
                    BinaryOp::Mul => Ok(l * r),
                    BinaryOp::Div | BinaryOp::Rem if r == 0.0 => Err(RulebookError::Evaluation {
                        formula: source.to_string(),
                        message: "division by zero".into(),
                    }),
                    BinaryOp::Div => Ok(l / r),
                    BinaryOp::Rem => Ok(l % r),
                }
            }
            Expr::Call { func, args } => {
                out.push_str(func.name());
                out.push('(');
                let mut values = Vec::with_capacity(args.len());
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    values.push(self.eval(source, arg, data, out)?);
                }
                out.push(')');
                apply_function(source, *func, &values)
            }
        }
    }

    /// Evaluate a binary operand, parenthesising it in the rendered formula
    /// when its own operator binds looser than the parent.
    fn eval_operand(
        &self,
        source: &str,
        operand: &Expr,
        parent: BinaryOp,
        right: bool,
        data: &RollData,
        out: &mut String,
    ) -> Result<f64> {
        let wrap = match operand {
            Expr::Binary { op, .. } => {
                op.precedence() < parent.precedence()
                    || (right && op.precedence() == parent.precedence())
            }
            _ => false,
        };
        if wrap {
            out.push('(');
        }
        let v = self.eval(source, operand, data, out)?;
        if wrap {
            out.push(')');
        }
        Ok(v)
    }

    fn roll_dice(&self, term: &DiceTerm, out: &mut String) -> f64 {
        let mut faces: Vec<u32> = (0..term.count)
            .map(|_| self.roller.roll(term.faces))
            .collect();
        let shown = faces
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        let take = match term.keep {
            None => faces.len(),
            Some(Keep::Highest(n)) => {
                faces.sort_unstable_by(|a, b| b.cmp(a));
                n as usize
            }
            Some(Keep::Lowest(n)) => {
                faces.sort_unstable();
                n as usize
            }
        };
        let kept: u64 = faces.iter().take(take).map(|&f| u64::from(f)).sum();

        out.push_str(&format!("{}d{}", term.count, term.faces));
        match term.keep {
            Some(Keep::Highest(n)) => out.push_str(&format!("kh{n}")),
            Some(Keep::Lowest(n)) => out.push_str(&format!("kl{n}")),
            None => {}
        }
        out.push_str(&format!("[{shown}]"));
        kept as f64
    }
}

impl Default for DiceEvaluator {
    fn default() -> Self {
        Self::new(RandRoller::default())
    }
}

impl Evaluator for DiceEvaluator {
    fn evaluate(&self, formula: &str, data: &RollData) -> Result<Evaluation> {
        if formula.trim().is_empty() {
            return Ok(Evaluation {
                total: 0.0,
                formula: "0".into(),
            });
        }
        let expr = parse_formula(formula)?;
        let mut rendered = String::new();
        let total = self.eval(formula, &expr, data, &mut rendered)?;
        tracing::trace!(formula, resolved = %rendered, total, "Formula evaluated");
        Ok(Evaluation {
            total,
            formula: rendered,
        })
    }
}

fn apply_function(source: &str, func: Function, values: &[f64]) -> Result<f64> {
    let single = || -> Result<f64> {
        match values {
            [v] => Ok(*v),
            _ => Err(RulebookError::Evaluation {
                formula: source.to_string(),
                message: format!("{}() takes exactly one argument", func.name()),
            }),
        }
    };
    match func {
        Function::Floor => Ok(single()?.floor()),
        Function::Ceil => Ok(single()?.ceil()),
        Function::Round => Ok(single()?.round()),
        Function::Abs => Ok(single()?.abs()),
        Function::Min => Ok(values.iter().copied().fold(f64::INFINITY, f64::min)),
        Function::Max => Ok(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
    }
}
