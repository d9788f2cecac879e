use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, cut_err, delimited, opt, preceded, separated};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::{literal, one_of, take_while};
use winnow::{ModalResult, Parser};

use rulebook_types::RulebookError;

use crate::ast::*;

/// Upper bound on dice per term, so a typo cannot roll a million dice.
const MAX_DICE: u32 = 1000;
/// Upper bound on faces per die.
const MAX_FACES: u32 = 1_000_000;

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Unsigned integer.
fn integer(input: &mut &str) -> ModalResult<u32> {
    let digits: &str = digit1.parse_next(input)?;
    digits
        .parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

/// Decimal literal: digits, optionally followed by '.' digits.
fn number(input: &mut &str) -> ModalResult<f64> {
    let s: &str = (digit1, opt(('.', digit1))).take().parse_next(input)?;
    s.parse()
        .map_err(|_| ErrMode::Backtrack(ContextError::new()))
}

/// `kh<n>` or `kl<n>`.
fn keep(input: &mut &str) -> ModalResult<Keep> {
    let kind = alt((literal("kh"), literal("kl"))).parse_next(input)?;
    let n = cut_err(integer)
        .context(StrContext::Expected(StrContextValue::Description(
            "number of dice to keep",
        )))
        .parse_next(input)?;
    Ok(if kind == "kh" {
        Keep::Highest(n)
    } else {
        Keep::Lowest(n)
    })
}

/// `[count] 'd' faces [keep]`.
fn dice(input: &mut &str) -> ModalResult<DiceTerm> {
    let count = opt(integer).parse_next(input)?.unwrap_or(1);
    let _ = one_of(['d', 'D']).parse_next(input)?;
    let faces = integer.parse_next(input)?;
    let keep = opt(keep).parse_next(input)?;
    if faces == 0 {
        return Err(make_cut_error("dice with at least one face"));
    }
    if count > MAX_DICE {
        return Err(make_cut_error("at most 1000 dice per term"));
    }
    if faces > MAX_FACES {
        return Err(make_cut_error("at most 1000000 faces per die"));
    }
    Ok(DiceTerm { count, faces, keep })
}

/// `@dotted.path`.
fn path(input: &mut &str) -> ModalResult<String> {
    let _ = '@'.parse_next(input)?;
    let p: &str = cut_err(take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || c == '_' || c == '.'
    }))
    .context(StrContext::Expected(StrContextValue::Description(
        "data path after '@'",
    )))
    .parse_next(input)?;
    Ok(p.trim_end_matches('.').to_string())
}

/// `name '(' expr (',' expr)* ')'`.
fn call(input: &mut &str) -> ModalResult<Expr> {
    let name: &str = take_while(1.., |c: char| c.is_ascii_alphabetic()).parse_next(input)?;
    let func = match Function::from_name(name) {
        Some(f) => f,
        None => {
            return Err(make_cut_error(
                "a known function (floor, ceil, round, abs, min, max)",
            ))
        }
    };
    let _ = ws.parse_next(input)?;
    let _ = '('.parse_next(input)?;
    let args: Vec<Expr> = separated(1.., expr, preceded(ws, ',')).parse_next(input)?;
    let _ = ws.parse_next(input)?;
    let _ = cut_err(')')
        .context(StrContext::Expected(StrContextValue::CharLiteral(')')))
        .parse_next(input)?;
    Ok(Expr::Call { func, args })
}

fn parenthesized(input: &mut &str) -> ModalResult<Expr> {
    delimited(
        '(',
        expr,
        (
            ws,
            cut_err(')').context(StrContext::Expected(StrContextValue::CharLiteral(')'))),
        ),
    )
    .parse_next(input)
}

fn atom(input: &mut &str) -> ModalResult<Expr> {
    let _ = ws.parse_next(input)?;
    alt((
        dice.map(Expr::Dice),
        number.map(Expr::Number),
        path.map(Expr::Path),
        call,
        parenthesized,
    ))
    .context(StrContext::Expected(StrContextValue::Description(
        "a number, dice, @path, function, or '('",
    )))
    .parse_next(input)
}

fn unary(input: &mut &str) -> ModalResult<Expr> {
    let _ = ws.parse_next(input)?;
    if opt('-').parse_next(input)?.is_some() {
        let inner = cut_err(unary).parse_next(input)?;
        return Ok(Expr::Neg(Box::new(inner)));
    }
    let _ = opt('+').parse_next(input)?;
    atom.parse_next(input)
}

fn term(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = unary.parse_next(input)?;
    loop {
        let _ = ws.parse_next(input)?;
        let Some(symbol) = opt(one_of(['*', '/', '%'])).parse_next(input)? else {
            break;
        };
        let rhs = cut_err(unary).parse_next(input)?;
        lhs = binary(symbol, lhs, rhs);
    }
    Ok(lhs)
}

fn expr(input: &mut &str) -> ModalResult<Expr> {
    let mut lhs = term.parse_next(input)?;
    loop {
        let _ = ws.parse_next(input)?;
        let Some(symbol) = opt(one_of(['+', '-'])).parse_next(input)? else {
            break;
        };
        let rhs = cut_err(term).parse_next(input)?;
        lhs = binary(symbol, lhs, rhs);
    }
    Ok(lhs)
}

fn binary(symbol: char, lhs: Expr, rhs: Expr) -> Expr {
    // Only called with symbols accepted by `one_of` above.
    let op = BinaryOp::from_symbol(symbol).unwrap_or(BinaryOp::Add);
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

/// Public entry point.
///
/// Placeholders (`#id`) must already be substituted; a leftover `#` is a
/// parse error.
pub fn parse_formula(formula: &str) -> Result<Expr, RulebookError> {
    if formula.trim().is_empty() {
        return Err(RulebookError::FormulaParse {
            formula: formula.to_string(),
            position: 0,
            message: "empty formula".into(),
        });
    }

    let mut remaining = formula;
    let parsed = expr.parse_next(&mut remaining).map_err(|e| RulebookError::FormulaParse {
        formula: formula.to_string(),
        position: formula.len() - remaining.len(),
        message: format!("{}", e),
    })?;

    let rest = remaining.trim_start();
    if let Some(c) = rest.chars().next() {
        return Err(RulebookError::FormulaParse {
            formula: formula.to_string(),
            position: formula.len() - rest.len(),
            message: format!("unexpected '{c}'"),
        });
    }
    Ok(parsed)
}
