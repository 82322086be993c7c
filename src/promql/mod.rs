// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod metrics;

pub use metrics::extract_metric_names;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{char, digit0, digit1, none_of, one_of},
    combinator::{cut, map, opt, recognize, value},
    error::{ErrorKind, ParseError},
    multi::fold_many0,
    sequence::{pair, preceded, terminated},
};
use thiserror::Error;

pub const METRIC_NAME_LABEL: &str = "__name__";

/// Deepest nesting of parentheses, calls and operators the parser accepts.
const MAX_NESTING_DEPTH: usize = 64;

const AGGREGATION_OPS: &[&str] = &[
    "sum",
    "min",
    "max",
    "avg",
    "group",
    "stddev",
    "stdvar",
    "count",
    "count_values",
    "bottomk",
    "topk",
    "quantile",
    "limitk",
    "limit_ratio",
];

const PARAMETERIZED_AGGREGATIONS: &[&str] = &[
    "count_values",
    "bottomk",
    "topk",
    "quantile",
    "limitk",
    "limit_ratio",
];

const FUNCTIONS: &[&str] = &[
    "abs",
    "absent",
    "absent_over_time",
    "acos",
    "acosh",
    "asin",
    "asinh",
    "atan",
    "atanh",
    "avg_over_time",
    "ceil",
    "changes",
    "clamp",
    "clamp_max",
    "clamp_min",
    "cos",
    "cosh",
    "count_over_time",
    "day_of_month",
    "day_of_week",
    "day_of_year",
    "days_in_month",
    "deg",
    "delta",
    "deriv",
    "double_exponential_smoothing",
    "exp",
    "floor",
    "histogram_avg",
    "histogram_count",
    "histogram_fraction",
    "histogram_quantile",
    "histogram_stddev",
    "histogram_stdvar",
    "histogram_sum",
    "holt_winters",
    "hour",
    "idelta",
    "increase",
    "irate",
    "label_join",
    "label_replace",
    "last_over_time",
    "ln",
    "log10",
    "log2",
    "mad_over_time",
    "max_over_time",
    "min_over_time",
    "minute",
    "month",
    "pi",
    "predict_linear",
    "present_over_time",
    "quantile_over_time",
    "rad",
    "rate",
    "resets",
    "round",
    "scalar",
    "sgn",
    "sin",
    "sinh",
    "sort",
    "sort_by_label",
    "sort_by_label_desc",
    "sort_desc",
    "sqrt",
    "stddev_over_time",
    "stdvar_over_time",
    "sum_over_time",
    "tan",
    "tanh",
    "time",
    "timestamp",
    "vector",
    "year",
];

#[derive(Debug, Clone, PartialEq)]
pub enum PromqlExpr {
    Number(f64),
    String(String),
    Selector(VectorSelector),
    Subquery(Subquery),
    Call {
        function: String,
        args: Vec<PromqlExpr>,
    },
    Aggregate {
        op: String,
        grouping: Option<Grouping>,
        param: Option<Box<PromqlExpr>>,
        expr: Box<PromqlExpr>,
    },
    Negate(Box<PromqlExpr>),
    Binary {
        op: BinaryOp,
        modifiers: BinaryModifiers,
        lhs: Box<PromqlExpr>,
        rhs: Box<PromqlExpr>,
    },
    Paren(Box<PromqlExpr>),
}

impl PromqlExpr {
    /// Vector selectors in pre-order; an aggregation visits its vector
    /// argument before its parameter.
    pub fn vector_selectors(&self) -> Vec<&VectorSelector> {
        let mut selectors = Vec::new();
        self.collect_selectors(&mut selectors);
        selectors
    }

    fn collect_selectors<'a>(&'a self, out: &mut Vec<&'a VectorSelector>) {
        match self {
            Self::Selector(selector) => out.push(selector),
            Self::Subquery(subquery) => subquery.expr.collect_selectors(out),
            Self::Call { args, .. } => {
                for arg in args {
                    arg.collect_selectors(out);
                }
            }
            Self::Aggregate { param, expr, .. } => {
                expr.collect_selectors(out);
                if let Some(param) = param {
                    param.collect_selectors(out);
                }
            }
            Self::Negate(inner) | Self::Paren(inner) => inner.collect_selectors(out),
            Self::Binary { lhs, rhs, .. } => {
                lhs.collect_selectors(out);
                rhs.collect_selectors(out);
            }
            Self::Number(_) | Self::String(_) => {}
        }
    }

    fn modifiers_mut(&mut self) -> Option<&mut Modifiers> {
        match self {
            Self::Selector(selector) => Some(&mut selector.modifiers),
            Self::Subquery(subquery) => Some(&mut subquery.modifiers),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VectorSelector {
    pub name: Option<String>,
    pub matchers: Vec<LabelMatcher>,
    pub range: Option<DurationValue>,
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subquery {
    pub expr: Box<PromqlExpr>,
    pub range: DurationValue,
    pub step: Option<DurationValue>,
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Modifiers {
    pub offset: Option<DurationValue>,
    pub at: Option<AtModifier>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AtModifier {
    Timestamp(f64),
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl LabelMatcher {
    /// Whether the matcher accepts the empty label value. Regex matchers are
    /// approximated without compiling the pattern.
    fn matches_empty(&self) -> bool {
        match self.op {
            MatchOp::Eq => self.value.is_empty(),
            MatchOp::NotEq => !self.value.is_empty(),
            MatchOp::RegexEq => matches!(self.value.as_str(), "" | ".*" | "^.*$"),
            MatchOp::RegexNotEq => !self.value.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Eq,
    NotEq,
    RegexEq,
    RegexNotEq,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grouping {
    pub without: bool,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Unless,
    Eql,
    Neq,
    Lte,
    Lss,
    Gte,
    Gtr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Atan2,
    Pow,
}

impl BinaryOp {
    fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And | Self::Unless => 2,
            Self::Eql | Self::Neq | Self::Lte | Self::Lss | Self::Gte | Self::Gtr => 3,
            Self::Add | Self::Sub => 4,
            Self::Mul | Self::Div | Self::Mod | Self::Atan2 => 5,
            Self::Pow => 6,
        }
    }

    fn is_right_associative(self) -> bool {
        matches!(self, Self::Pow)
    }

    fn is_comparison(self) -> bool {
        self.precedence() == 3
    }

    fn is_set_operator(self) -> bool {
        matches!(self, Self::Or | Self::And | Self::Unless)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BinaryModifiers {
    pub return_bool: bool,
    pub matching: Option<VectorMatching>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatching {
    pub ignoring: bool,
    pub labels: Vec<String>,
    pub group: Option<GroupModifier>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupModifier {
    pub right: bool,
    pub include: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationValue {
    millis: i64,
}

impl DurationValue {
    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    fn negated(self) -> Self {
        Self {
            millis: -self.millis,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromqlError {
    #[error("no expression found in input")]
    Empty,
    #[error("{line}:{column}: parse error: {message}")]
    Invalid {
        line: usize,
        column: usize,
        message: String,
    },
}

pub fn parse_promql(input: &str) -> Result<PromqlExpr, PromqlError> {
    let start = skip_space(input);
    if start.is_empty() {
        return Err(PromqlError::Empty);
    }
    let (rest, expr) = expression(start, 0).map_err(|err| describe(input, err))?;
    let rest = skip_space(rest);
    if !rest.is_empty() {
        return Err(invalid_at(
            input,
            rest,
            format!("unexpected {}", describe_token(rest)),
        ));
    }
    Ok(expr)
}

#[derive(Debug)]
struct ParseFault<'a> {
    input: &'a str,
    message: Option<&'static str>,
}

impl<'a> ParseError<&'a str> for ParseFault<'a> {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        Self {
            input,
            message: None,
        }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

type PResult<'a, T> = IResult<&'a str, T, ParseFault<'a>>;

fn fail<'a>(input: &'a str, message: &'static str) -> nom::Err<ParseFault<'a>> {
    nom::Err::Failure(ParseFault {
        input,
        message: Some(message),
    })
}

fn backtrack<'a, T>(input: &'a str) -> PResult<'a, T> {
    Err(nom::Err::Error(ParseFault {
        input,
        message: None,
    }))
}

/// Turns a recoverable miss into `None` while letting hard failures through.
fn optional<'a, T>(
    result: PResult<'a, T>,
) -> Result<Option<(&'a str, T)>, nom::Err<ParseFault<'a>>> {
    match result {
        Ok(parsed) => Ok(Some(parsed)),
        Err(nom::Err::Error(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

fn committed<'a, T>(result: PResult<'a, T>) -> PResult<'a, T> {
    result.map_err(|err| match err {
        nom::Err::Error(fault) => nom::Err::Failure(fault),
        other => other,
    })
}

fn describe(source: &str, err: nom::Err<ParseFault<'_>>) -> PromqlError {
    match err {
        nom::Err::Incomplete(_) => invalid_at(source, "", "unexpected end of input".into()),
        nom::Err::Error(fault) | nom::Err::Failure(fault) => {
            let remaining = skip_space(fault.input);
            let message = fault
                .message
                .map(str::to_string)
                .unwrap_or_else(|| format!("unexpected {}", describe_token(remaining)));
            invalid_at(source, remaining, message)
        }
    }
}

fn invalid_at(source: &str, remaining: &str, message: String) -> PromqlError {
    let consumed = &source[..source.len() - remaining.len()];
    let line = consumed.matches('\n').count() + 1;
    let line_start = consumed.rfind('\n').map_or(0, |idx| idx + 1);
    PromqlError::Invalid {
        line,
        column: consumed.len() - line_start + 1,
        message,
    }
}

fn describe_token(rest: &str) -> String {
    match rest.chars().next() {
        None => "end of input".into(),
        Some(ch) if is_ident_start(ch) => {
            let end = rest
                .find(|c: char| !is_ident_char(c))
                .unwrap_or(rest.len());
            format!("identifier {:?}", &rest[..end])
        }
        Some(ch) => format!("character {ch:?}"),
    }
}

/// Whitespace and `#` line comments.
fn skip_space(input: &str) -> &str {
    let mut rest = input;
    loop {
        rest = rest.trim_start();
        match rest.strip_prefix('#') {
            Some(comment) => rest = comment.find('\n').map_or("", |idx| &comment[idx..]),
            None => return rest,
        }
    }
}

fn ws(input: &str) -> PResult<'_, ()> {
    Ok((skip_space(input), ()))
}

fn symbol<'a>(expected: &'static str) -> impl Fn(&'a str) -> PResult<'a, &'a str> {
    move |input: &'a str| -> PResult<'a, &'a str> { preceded(ws, tag(expected)).parse(input) }
}

/// Case-insensitive keyword that must not run into further identifier chars.
fn keyword<'a>(word: &'static str) -> impl Fn(&'a str) -> PResult<'a, &'a str> {
    move |input: &'a str| -> PResult<'a, &'a str> {
        let (rest, ()) = ws(input)?;
        let (after, ident) = identifier(rest)?;
        if ident.eq_ignore_ascii_case(word) {
            Ok((after, ident))
        } else {
            backtrack(input)
        }
    }
}

fn expression(input: &str, depth: usize) -> PResult<'_, PromqlExpr> {
    binary_expr(input, 1, depth)
}

/// Every recursive path re-enters here with `depth + 1`, so the check bounds
/// stack use for arbitrarily nested input.
fn binary_expr(input: &str, min_precedence: u8, depth: usize) -> PResult<'_, PromqlExpr> {
    if depth > MAX_NESTING_DEPTH {
        return Err(fail(input, "expression nested too deeply"));
    }
    let (mut rest, mut lhs) = unary_expr(input, depth)?;
    while let Some((after_op, op)) = optional(binary_op(rest))? {
        let precedence = op.precedence();
        if precedence < min_precedence {
            break;
        }
        let (after_modifiers, modifiers) = binary_modifiers(after_op, op)?;
        let next_precedence = if op.is_right_associative() {
            precedence
        } else {
            precedence + 1
        };
        let (after_rhs, rhs) = committed(binary_expr(after_modifiers, next_precedence, depth + 1))?;
        lhs = PromqlExpr::Binary {
            op,
            modifiers,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        };
        rest = after_rhs;
    }
    Ok((rest, lhs))
}

fn binary_op(input: &str) -> PResult<'_, BinaryOp> {
    alt((
        value(BinaryOp::Eql, symbol("==")),
        value(BinaryOp::Neq, symbol("!=")),
        value(BinaryOp::Lte, symbol("<=")),
        value(BinaryOp::Gte, symbol(">=")),
        value(BinaryOp::Lss, symbol("<")),
        value(BinaryOp::Gtr, symbol(">")),
        value(BinaryOp::Add, symbol("+")),
        value(BinaryOp::Sub, symbol("-")),
        value(BinaryOp::Mul, symbol("*")),
        value(BinaryOp::Div, symbol("/")),
        value(BinaryOp::Mod, symbol("%")),
        value(BinaryOp::Pow, symbol("^")),
        value(BinaryOp::And, keyword("and")),
        value(BinaryOp::Or, keyword("or")),
        value(BinaryOp::Unless, keyword("unless")),
        value(BinaryOp::Atan2, keyword("atan2")),
    ))
    .parse(input)
}

fn binary_modifiers(input: &str, op: BinaryOp) -> PResult<'_, BinaryModifiers> {
    let mut modifiers = BinaryModifiers::default();
    let mut rest = input;
    if let Some((after, _)) = optional(keyword("bool")(rest))? {
        if !op.is_comparison() {
            return Err(fail(
                rest,
                "bool modifier can only be used on comparison operators",
            ));
        }
        modifiers.return_bool = true;
        rest = after;
    }
    let mut matching_kind = alt((value(false, keyword("on")), value(true, keyword("ignoring"))));
    if let Some((after, ignoring)) = optional(matching_kind.parse(rest))? {
        let (after, labels) = committed(label_list(after))?;
        rest = after;
        let mut group_side = alt((
            value(false, keyword("group_left")),
            value(true, keyword("group_right")),
        ));
        let group = match optional(group_side.parse(rest))? {
            Some((after, right)) => {
                if op.is_set_operator() {
                    return Err(fail(rest, "no grouping allowed for set operations"));
                }
                let (after, include) = match optional(label_list(after))? {
                    Some(parsed) => parsed,
                    None => (after, Vec::new()),
                };
                rest = after;
                Some(GroupModifier { right, include })
            }
            None => None,
        };
        modifiers.matching = Some(VectorMatching {
            ignoring,
            labels,
            group,
        });
    }
    Ok((rest, modifiers))
}

fn unary_expr(input: &str, depth: usize) -> PResult<'_, PromqlExpr> {
    if let Some((rest, sign)) = optional(alt((symbol("-"), symbol("+"))).parse(input))? {
        // Unary operators bind tighter than everything except `^`.
        let (rest, operand) = committed(binary_expr(rest, BinaryOp::Pow.precedence(), depth + 1))?;
        let expr = match (sign, operand) {
            ("+", operand) => operand,
            (_, PromqlExpr::Number(number)) => PromqlExpr::Number(-number),
            (_, operand) => PromqlExpr::Negate(Box::new(operand)),
        };
        return Ok((rest, expr));
    }
    postfix_expr(input, depth)
}

fn postfix_expr(input: &str, depth: usize) -> PResult<'_, PromqlExpr> {
    let (mut rest, mut expr) = primary_expr(input, depth)?;
    loop {
        if let Some((after, _)) = optional(symbol("[")(rest))? {
            let (after, range) = committed(preceded(ws, duration_literal).parse(after))?;
            if let Some((after, _)) = optional(symbol(":")(after))? {
                let (after, step) = match optional(preceded(ws, duration_literal).parse(after))? {
                    Some((after, step)) => (after, Some(step)),
                    None => (after, None),
                };
                let (after, _) = committed(symbol("]")(after))?;
                expr = PromqlExpr::Subquery(Subquery {
                    expr: Box::new(expr),
                    range,
                    step,
                    modifiers: Modifiers::default(),
                });
                rest = after;
                continue;
            }
            let (after, _) = committed(symbol("]")(after))?;
            match &mut expr {
                PromqlExpr::Selector(selector)
                    if selector.range.is_none() && selector.modifiers == Modifiers::default() =>
                {
                    selector.range = Some(range);
                }
                _ => return Err(fail(rest, "ranges only allowed for vector selectors")),
            }
            rest = after;
            continue;
        }
        if let Some((after, _)) = optional(keyword("offset")(rest))? {
            let (after, negative) = match optional(symbol("-")(after))? {
                Some((after, _)) => (after, true),
                None => (after, false),
            };
            let (after, offset) = committed(preceded(ws, duration_literal).parse(after))?;
            let Some(modifiers) = expr.modifiers_mut() else {
                return Err(fail(
                    rest,
                    "offset modifier must be preceded by an instant vector selector or range vector selector or a subquery",
                ));
            };
            if modifiers.offset.is_some() {
                return Err(fail(rest, "offset may not be set multiple times"));
            }
            modifiers.offset = Some(if negative { offset.negated() } else { offset });
            rest = after;
            continue;
        }
        if let Some((after, _)) = optional(symbol("@")(rest))? {
            let (after, at) = committed(at_modifier(after))?;
            let Some(modifiers) = expr.modifiers_mut() else {
                return Err(fail(
                    rest,
                    "@ modifier must be preceded by an instant vector selector or range vector selector or a subquery",
                ));
            };
            if modifiers.at.is_some() {
                return Err(fail(rest, "@ <timestamp> may not be set multiple times"));
            }
            modifiers.at = Some(at);
            rest = after;
            continue;
        }
        return Ok((rest, expr));
    }
}

fn at_modifier(input: &str) -> PResult<'_, AtModifier> {
    alt((
        value(
            AtModifier::Start,
            (keyword("start"), symbol("("), symbol(")")),
        ),
        value(AtModifier::End, (keyword("end"), symbol("("), symbol(")"))),
        map(preceded(ws, signed_number), AtModifier::Timestamp),
    ))
    .parse(input)
}

fn primary_expr(input: &str, depth: usize) -> PResult<'_, PromqlExpr> {
    let (input, ()) = ws(input)?;
    if let Some((rest, _)) = optional(char('(').parse(input))? {
        let (rest, inner) = committed(expression(rest, depth + 1))?;
        let (rest, _) = committed(symbol(")")(rest))?;
        return Ok((rest, PromqlExpr::Paren(Box::new(inner))));
    }
    if let Some((rest, text)) = optional(string_literal(input))? {
        return Ok((rest, PromqlExpr::String(text)));
    }
    if let Some((rest, number)) = optional(number_literal(input))? {
        return Ok((rest, PromqlExpr::Number(number)));
    }
    if input.starts_with('{') {
        let (rest, matchers) = label_matchers(input)?;
        let selector = vector_selector(input, None, matchers)?;
        return Ok((rest, PromqlExpr::Selector(selector)));
    }

    let (rest, ident) = identifier(input)?;
    let lookahead = skip_space(rest);
    let lowered = ident.to_ascii_lowercase();
    if AGGREGATION_OPS.contains(&lowered.as_str())
        && (lookahead.starts_with('(') || starts_grouping(lookahead))
    {
        return aggregate_expr(lowered, rest, depth);
    }
    if lookahead.starts_with('(') {
        if !FUNCTIONS.contains(&ident) {
            return Err(fail(input, "unknown function"));
        }
        let (rest, args) = call_args(rest, depth)?;
        return Ok((
            rest,
            PromqlExpr::Call {
                function: ident.to_string(),
                args,
            },
        ));
    }
    if lowered == "inf" || lowered == "nan" {
        let number = if lowered == "inf" {
            f64::INFINITY
        } else {
            f64::NAN
        };
        return Ok((rest, PromqlExpr::Number(number)));
    }

    let (rest, matchers) = match optional(label_matchers(rest))? {
        Some(parsed) => parsed,
        None => (rest, Vec::new()),
    };
    let selector = vector_selector(input, Some(ident.to_string()), matchers)?;
    Ok((rest, PromqlExpr::Selector(selector)))
}

fn vector_selector<'a>(
    input: &'a str,
    name: Option<String>,
    matchers: Vec<LabelMatcher>,
) -> Result<VectorSelector, nom::Err<ParseFault<'a>>> {
    let named_twice = name.is_some()
        && matchers
            .iter()
            .any(|matcher| matcher.name == METRIC_NAME_LABEL);
    if named_twice {
        return Err(fail(input, "metric name must not be set twice"));
    }
    if name.is_none() && matchers.iter().all(LabelMatcher::matches_empty) {
        return Err(fail(
            input,
            "vector selector must contain at least one non-empty matcher",
        ));
    }
    Ok(VectorSelector {
        name,
        matchers,
        range: None,
        modifiers: Modifiers::default(),
    })
}

fn starts_grouping(input: &str) -> bool {
    identifier(input).is_ok_and(|(_, ident)| {
        ident.eq_ignore_ascii_case("by") || ident.eq_ignore_ascii_case("without")
    })
}

fn aggregate_expr(op: String, input: &str, depth: usize) -> PResult<'_, PromqlExpr> {
    let (mut rest, mut grouping) = match optional(grouping_clause(input))? {
        Some((rest, grouping)) => (rest, Some(grouping)),
        None => (input, None),
    };
    let (after, mut args) = committed(call_args(rest, depth))?;
    rest = after;
    if grouping.is_none() {
        if let Some((after, parsed)) = optional(grouping_clause(rest))? {
            grouping = Some(parsed);
            rest = after;
        }
    }

    let expected = if PARAMETERIZED_AGGREGATIONS.contains(&op.as_str()) {
        2
    } else {
        1
    };
    if args.is_empty() {
        return Err(fail(input, "no arguments for aggregate expression provided"));
    }
    if args.len() != expected {
        return Err(fail(input, "wrong number of arguments for aggregate expression"));
    }
    let expr = args.pop().map(Box::new);
    let param = args.pop().map(Box::new);
    let Some(expr) = expr else {
        return backtrack(input);
    };
    Ok((
        rest,
        PromqlExpr::Aggregate {
            op,
            grouping,
            param,
            expr,
        },
    ))
}

fn grouping_clause(input: &str) -> PResult<'_, Grouping> {
    let (rest, without) =
        alt((value(false, keyword("by")), value(true, keyword("without")))).parse(input)?;
    let (rest, labels) = committed(label_list(rest))?;
    Ok((rest, Grouping { without, labels }))
}

fn call_args(input: &str, depth: usize) -> PResult<'_, Vec<PromqlExpr>> {
    let (mut rest, _) = symbol("(")(input)?;
    let mut args = Vec::new();
    if let Some((after, _)) = optional(symbol(")")(rest))? {
        return Ok((after, args));
    }
    loop {
        let (after, arg) = committed(expression(rest, depth + 1))?;
        args.push(arg);
        if let Some((after, _)) = optional(symbol(",")(after))? {
            rest = after;
            continue;
        }
        let (after, _) = committed(symbol(")")(after))?;
        return Ok((after, args));
    }
}

fn label_list(input: &str) -> PResult<'_, Vec<String>> {
    let (mut rest, _) = symbol("(")(input)?;
    let mut labels = Vec::new();
    loop {
        if let Some((after, _)) = optional(symbol(")")(rest))? {
            return Ok((after, labels));
        }
        if !labels.is_empty() {
            let (after, _) = committed(symbol(",")(rest))?;
            rest = after;
            if let Some((after, _)) = optional(symbol(")")(rest))? {
                return Ok((after, labels));
            }
        }
        let (after, label) = committed(preceded(ws, label_name).parse(rest))?;
        labels.push(label.to_string());
        rest = after;
    }
}

fn label_matchers(input: &str) -> PResult<'_, Vec<LabelMatcher>> {
    let (mut rest, _) = symbol("{")(input)?;
    let mut matchers = Vec::new();
    loop {
        if let Some((after, _)) = optional(symbol("}")(rest))? {
            return Ok((after, matchers));
        }
        if !matchers.is_empty() {
            let (after, _) = committed(symbol(",")(rest))?;
            rest = after;
            if let Some((after, _)) = optional(symbol("}")(rest))? {
                return Ok((after, matchers));
            }
        }
        let (after, matcher) = committed(label_matcher(rest))?;
        matchers.push(matcher);
        rest = after;
    }
}

fn label_matcher(input: &str) -> PResult<'_, LabelMatcher> {
    let (rest, name) = preceded(ws, label_name).parse(input)?;
    let (rest, op) = alt((
        value(MatchOp::RegexEq, symbol("=~")),
        value(MatchOp::RegexNotEq, symbol("!~")),
        value(MatchOp::NotEq, symbol("!=")),
        value(MatchOp::Eq, symbol("=")),
    ))
    .parse(rest)?;
    let (rest, text) = preceded(ws, string_literal).parse(rest)?;
    Ok((
        rest,
        LabelMatcher {
            name: name.to_string(),
            op,
            value: text,
        },
    ))
}

fn duration_literal(input: &str) -> PResult<'_, DurationValue> {
    let mut rest = input;
    let mut total: i64 = 0;
    let mut parts = 0;
    loop {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            break;
        }
        let after = &rest[digits..];
        let (unit_ms, unit_len): (i64, usize) = if after.starts_with("ms") {
            (1, 2)
        } else {
            match after.chars().next() {
                Some('s') => (1_000, 1),
                Some('m') => (60_000, 1),
                Some('h') => (3_600_000, 1),
                Some('d') => (86_400_000, 1),
                Some('w') => (604_800_000, 1),
                Some('y') => (31_536_000_000, 1),
                _ => break,
            }
        };
        let amount: i64 = rest[..digits]
            .parse()
            .map_err(|_| fail(rest, "duration out of range"))?;
        total = amount
            .checked_mul(unit_ms)
            .and_then(|value| total.checked_add(value))
            .ok_or_else(|| fail(rest, "duration out of range"))?;
        rest = &after[unit_len..];
        parts += 1;
    }
    if parts == 0 {
        return backtrack(input);
    }
    Ok((rest, DurationValue::from_millis(total)))
}

fn number_literal(input: &str) -> PResult<'_, f64> {
    if let Some(hex) = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        let digits = hex
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(hex.len());
        return match u64::from_str_radix(&hex[..digits], 16) {
            Ok(number) if digits > 0 => Ok((&hex[digits..], number as f64)),
            _ => backtrack(input),
        };
    }
    let parsed: PResult<'_, &str> = recognize(pair(
        alt((
            recognize(pair(digit1, opt(pair(char('.'), digit0)))),
            recognize(pair(char('.'), digit1)),
        )),
        opt(pair(one_of("eE"), pair(opt(one_of("+-")), digit1))),
    ))
    .parse(input);
    let (rest, text) = parsed?;
    // `5m` and friends are durations, not numbers.
    if rest.starts_with(is_ident_char) {
        return backtrack(input);
    }
    match text.parse::<f64>() {
        Ok(number) => Ok((rest, number)),
        Err(_) => backtrack(input),
    }
}

fn signed_number(input: &str) -> PResult<'_, f64> {
    let signed: PResult<'_, Option<char>> = opt(alt((char('-'), char('+')))).parse(input);
    let (rest, sign) = signed?;
    let (rest, number) = number_literal(rest)?;
    Ok((rest, if sign == Some('-') { -number } else { number }))
}

fn string_literal(input: &str) -> PResult<'_, String> {
    alt((quoted('"'), quoted('\''), backtick_literal)).parse(input)
}

fn quoted<'a>(quote: char) -> impl Fn(&'a str) -> PResult<'a, String> {
    move |input: &'a str| -> PResult<'a, String> {
        let excluded = if quote == '"' { "\\\"" } else { "\\'" };
        preceded(
            char(quote),
            cut(terminated(
                fold_many0(
                    alt((none_of(excluded), escaped_char)),
                    String::new,
                    |mut acc, item| {
                        acc.push(item);
                        acc
                    },
                ),
                char(quote),
            )),
        )
        .parse(input)
    }
}

fn backtick_literal(input: &str) -> PResult<'_, String> {
    preceded(
        char('`'),
        cut(terminated(
            map(take_until("`"), |raw: &str| raw.to_string()),
            char('`'),
        )),
    )
    .parse(input)
}

fn escaped_char(input: &str) -> PResult<'_, char> {
    preceded(
        char('\\'),
        alt((
            value('\\', char('\\')),
            value('"', char('"')),
            value('\'', char('\'')),
            value('\n', char('n')),
            value('\r', char('r')),
            value('\t', char('t')),
            value('\u{07}', char('a')),
            value('\u{08}', char('b')),
            value('\u{0c}', char('f')),
            value('\u{0b}', char('v')),
        )),
    )
    .parse(input)
}

fn identifier(input: &str) -> PResult<'_, &str> {
    recognize(pair(take_while1(is_ident_start), take_while(is_ident_char))).parse(input)
}

fn label_name(input: &str) -> PResult<'_, &str> {
    recognize(pair(
        take_while1(is_label_start),
        take_while(is_label_char),
    ))
    .parse(input)
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == ':'
}

fn is_ident_char(ch: char) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit()
}

fn is_label_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_label_char(ch: char) -> bool {
    is_label_start(ch) || ch.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector_names(input: &str) -> Vec<Option<String>> {
        parse_promql(input)
            .unwrap()
            .vector_selectors()
            .into_iter()
            .map(|selector| selector.name.clone())
            .collect()
    }

    #[test]
    fn parse_plain_selector_with_matchers() {
        let expr = parse_promql("up{job=\"node\", instance!~'db-.*',}").unwrap();
        let PromqlExpr::Selector(selector) = expr else {
            panic!("expected selector");
        };
        assert_eq!(selector.name.as_deref(), Some("up"));
        assert_eq!(selector.matchers.len(), 2);
        assert_eq!(selector.matchers[0].op, MatchOp::Eq);
        assert_eq!(selector.matchers[1].op, MatchOp::RegexNotEq);
        assert_eq!(selector.matchers[1].value, "db-.*");
    }

    #[test]
    fn parse_range_offset_and_at_modifiers() {
        let expr = parse_promql("rate(http_requests_total[5m] offset -1h30m @ 1700000000)").unwrap();
        let PromqlExpr::Call { function, args } = expr else {
            panic!("expected call");
        };
        assert_eq!(function, "rate");
        let PromqlExpr::Selector(selector) = &args[0] else {
            panic!("expected selector");
        };
        assert_eq!(selector.range, Some(DurationValue::from_millis(300_000)));
        assert_eq!(
            selector.modifiers.offset,
            Some(DurationValue::from_millis(-5_400_000))
        );
        assert_eq!(
            selector.modifiers.at,
            Some(AtModifier::Timestamp(1_700_000_000.0))
        );
    }

    #[test]
    fn parse_aggregations_with_grouping_on_either_side() {
        for input in [
            "sum by (job) (rate(x[5m]))",
            "sum(rate(x[5m])) by (job)",
            "SUM WITHOUT (instance) (rate(x[5m]))",
        ] {
            match parse_promql(input).unwrap() {
                PromqlExpr::Aggregate { op, grouping, .. } => {
                    assert_eq!(op, "sum");
                    assert!(grouping.is_some(), "{input}");
                }
                other => panic!("unexpected expression for {input}: {other:?}"),
            }
        }
    }

    #[test]
    fn parameterized_aggregation_visits_expr_before_param() {
        let expr = parse_promql("topk(scalar(limit_metric), requests_total)").unwrap();
        assert_eq!(
            expr.vector_selectors()
                .into_iter()
                .map(|selector| selector.name.clone().unwrap())
                .collect::<Vec<_>>(),
            vec!["requests_total", "limit_metric"]
        );
    }

    #[test]
    fn binary_precedence_and_associativity() {
        let expr = parse_promql("a + b * c").unwrap();
        let PromqlExpr::Binary { op, rhs, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(*rhs, PromqlExpr::Binary { op: BinaryOp::Mul, .. }));

        let expr = parse_promql("2 ^ 3 ^ 2").unwrap();
        let PromqlExpr::Binary { lhs, rhs, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(*lhs, PromqlExpr::Number(2.0));
        assert!(matches!(*rhs, PromqlExpr::Binary { op: BinaryOp::Pow, .. }));

        let expr = parse_promql("-2 ^ 2").unwrap();
        assert!(matches!(expr, PromqlExpr::Negate(_)));
    }

    #[test]
    fn binary_vector_matching() {
        let expr = parse_promql(
            "a > bool on (instance) group_left (role) b or ignoring(job) c",
        )
        .unwrap();
        let PromqlExpr::Binary { op, lhs, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Or);
        let PromqlExpr::Binary { modifiers, .. } = *lhs else {
            panic!("expected binary");
        };
        assert!(modifiers.return_bool);
        let matching = modifiers.matching.unwrap();
        assert!(!matching.ignoring);
        assert_eq!(matching.labels, vec!["instance"]);
        assert_eq!(matching.group.unwrap().include, vec!["role"]);
    }

    #[test]
    fn subqueries_and_nested_calls() {
        assert_eq!(
            selector_names("max_over_time(rate(errors_total[1m])[30m:1m])"),
            vec![Some("errors_total".to_string())]
        );
        assert!(parse_promql("max_over_time(deriv(x[5m])[1h:])").is_ok());
    }

    #[test]
    fn numbers_strings_and_comments() {
        assert_eq!(parse_promql("0x1F").unwrap(), PromqlExpr::Number(31.0));
        assert_eq!(parse_promql(" 1.5e3 ").unwrap(), PromqlExpr::Number(1500.0));
        assert_eq!(parse_promql("-Inf").unwrap(), PromqlExpr::Number(f64::NEG_INFINITY));
        assert_eq!(
            parse_promql("`raw\\string`").unwrap(),
            PromqlExpr::String("raw\\string".into())
        );
        assert_eq!(
            selector_names("# leading comment\nup # trailing"),
            vec![Some("up".to_string())]
        );
    }

    #[test]
    fn reports_empty_input() {
        assert_eq!(parse_promql("   "), Err(PromqlError::Empty));
        assert_eq!(
            PromqlError::Empty.to_string(),
            "no expression found in input"
        );
    }

    #[test]
    fn reports_position_of_syntax_errors() {
        let err = parse_promql("sum(rate(x[5m])").unwrap_err();
        assert_eq!(
            err.to_string(),
            "1:16: parse error: unexpected end of input"
        );
        let err = parse_promql("up +").unwrap_err();
        assert!(matches!(err, PromqlError::Invalid { column: 5, .. }), "{err}");
        let err = parse_promql("up{job=\"a\"").unwrap_err();
        assert!(matches!(err, PromqlError::Invalid { .. }));
    }

    #[test]
    fn rejects_invalid_constructs() {
        for input in [
            "{}",
            "up{__name__=\"x\"}",
            "(up)[5m]",
            "sum(x) offset 5m",
            "unknown_fn(up)",
            "topk(x)",
            "a and group_left b",
            "a + bool b",
            "rate(x[5])",
            "up{job=\"unterminated}",
        ] {
            assert!(parse_promql(input).is_err(), "{input} should not parse");
        }
    }

    #[test]
    fn deeply_nested_input_is_rejected() {
        let depth = 10_000;
        for input in [
            format!("{}1{}", "(".repeat(depth), ")".repeat(depth)),
            format!("{}1", "-".repeat(depth)),
            format!("{}up{}", "abs(".repeat(depth), ")".repeat(depth)),
            format!("1{}", " ^ 1".repeat(depth)),
        ] {
            let err = parse_promql(&input).unwrap_err();
            assert!(err.to_string().contains("expression nested too deeply"), "{err}");
        }
    }

    #[test]
    fn moderate_nesting_still_parses() {
        let input = format!("{}up{}", "(".repeat(30), ")".repeat(30));
        assert!(parse_promql(&input).is_ok());
        let input = format!("{}rate(x[5m]){}", "abs(".repeat(20), ")".repeat(20));
        assert!(parse_promql(&input).is_ok());
    }
}
