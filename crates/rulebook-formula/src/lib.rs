//! Formula evaluation for Rulebook activities.
//!
//! Parses arithmetic-and-dice formulas (`1d6 + @attributes.str.value`) into a
//! typed AST with [`parse_formula`], evaluates them through the [`Evaluator`]
//! trait, and substitutes `#operationId` placeholders beforehand with
//! [`substitute_placeholders`].
//!
//! # Example
//! ```
//! use rulebook_formula::{DiceEvaluator, Evaluator, MaxRoller};
//! use rulebook_types::RollData;
//!
//! let evaluator = DiceEvaluator::new(MaxRoller);
//! let result = evaluator.evaluate("2d6 + 1", &RollData::new()).unwrap();
//! assert_eq!(result.total, 13.0);
//! ```

pub mod ast;
mod eval;
mod parser;
mod placeholder;

pub use ast::*;
pub use eval::{DiceEvaluator, Evaluation, Evaluator, FixedRoller, MaxRoller, RandRoller, Roller};
pub use parser::parse_formula;
pub use placeholder::{is_placeholder_id, placeholder_ids, render_value, substitute_placeholders};

/// Render a number the way formulas and messages show it: integral values
/// without a fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulebook_types::RollData;
    use serde_json::json;

    #[test]
    fn format_number_drops_integral_fraction() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[test]
    fn placeholder_then_evaluate() {
        let resolve = |id: &str| (id == "dmgBase").then(|| json!(4));
        let formula = substitute_placeholders("#dmgBase + 2", "b", &resolve).unwrap();
        let total = DiceEvaluator::default()
            .evaluate(&formula, &RollData::new())
            .unwrap()
            .total;
        assert_eq!(total, 6.0);
    }

    #[test]
    fn evaluator_is_object_safe() {
        let evaluator: Box<dyn Evaluator> = Box::new(DiceEvaluator::new(FixedRoller::new([3])));
        let data = RollData::from_json(&json!({"mod": 2}));
        assert_eq!(evaluator.evaluate("1d6 + @mod", &data).unwrap().total, 5.0);
    }
}
