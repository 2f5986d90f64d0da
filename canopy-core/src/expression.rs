//! Filter Expressions
//!
//! The predicate language itself lives outside this crate. The engine only
//! needs to evaluate an already compiled expression against a node, so the
//! contract is a pair of traits: [`ExpressionCompiler`] turns text into an
//! [`Expression`], and an [`Expression`] answers questions about one node
//! through an [`EvalContext`].

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::graph::NodeView;

/// What an expression sees while it runs.
pub struct EvalContext<'a> {
    /// The node under evaluation, including its data object.
    pub node: &'a dyn NodeView,

    /// Indexed string registers bound at compile time (`$0`, `$1`, ...).
    pub registers: &'a [String],
}

impl<'a> EvalContext<'a> {
    /// Bind a node and a register file.
    pub fn new(node: &'a dyn NodeView, registers: &'a [String]) -> Self {
        Self { node, registers }
    }

    /// Read register `index`.
    pub fn register(&self, index: usize) -> Option<&'a str> {
        self.registers.get(index).map(String::as_str)
    }
}

/// A compiled predicate.
pub trait Expression: Send + Sync {
    /// Evaluate the predicate against the context node.
    fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool>;

    /// Field names an expression traversal should follow from the context node.
    fn select_fields(&self, _ctx: &EvalContext<'_>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Fields whose change alters the result of [`select_fields`](Self::select_fields).
    fn referenced_fields(&self) -> &[String] {
        &[]
    }
}

/// Turns expression text into a compiled [`Expression`].
pub trait ExpressionCompiler {
    /// Compile `text`. Syntax errors map to [`Error::Expression`](crate::Error::Expression).
    fn compile(&self, text: &str) -> Result<Arc<dyn Expression>>;
}

/// A compiled expression together with its register file.
#[derive(Clone)]
pub struct Filter {
    /// The compiled predicate.
    pub expression: Arc<dyn Expression>,

    /// Registers handed to every evaluation.
    pub registers: Vec<String>,
}

impl Filter {
    /// Wrap an expression with no registers.
    pub fn new(expression: Arc<dyn Expression>) -> Self {
        Self {
            expression,
            registers: Vec::new(),
        }
    }

    /// Wrap a native closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&EvalContext<'_>) -> Result<bool> + Send + Sync + 'static,
    {
        Self::new(Arc::new(FnExpression::new(f)))
    }

    /// Attach registers.
    pub fn with_registers(mut self, registers: Vec<String>) -> Self {
        self.registers = registers;
        self
    }

    /// Evaluate against `node` using this filter's registers.
    pub fn matches(&self, node: &dyn NodeView) -> Result<bool> {
        self.expression
            .evaluate(&EvalContext::new(node, &self.registers))
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("registers", &self.registers)
            .finish_non_exhaustive()
    }
}

/// True when the node's alias list contains register 0.
///
/// Alias markers are built with this predicate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AliasMatch;

impl AliasMatch {
    /// A filter matching nodes that carry `alias`.
    pub fn filter(alias: &str) -> Filter {
        Filter::new(Arc::new(AliasMatch)).with_registers(vec![alias.to_string()])
    }
}

impl Expression for AliasMatch {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool> {
        Ok(ctx
            .register(0)
            .map_or(false, |alias| ctx.node.aliases().iter().any(|a| a == alias)))
    }
}

/// Adapter turning a closure into an [`Expression`].
///
/// Used by embedders that compile their predicates to native closures.
pub struct FnExpression<F>(F);

impl<F> FnExpression<F>
where
    F: Fn(&EvalContext<'_>) -> Result<bool> + Send + Sync,
{
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Expression for FnExpression<F>
where
    F: Fn(&EvalContext<'_>) -> Result<bool> + Send + Sync,
{
    fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool> {
        (self.0)(ctx)
    }
}
