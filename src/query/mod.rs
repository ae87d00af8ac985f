//! Query-evaluation facade.
//!
//! The query algebra and its evaluation live outside this crate. What the
//! store supplies is narrow: statement access by pattern, cardinality
//! hints for join ordering, and the fixed order in which rewrite passes
//! run over a plan before evaluation. The plan type itself belongs to the
//! evaluation strategy.

use tracing::warn;

use crate::error::Result;
use crate::model::{Quad, Term, UNKNOWN_ID};
use crate::store::QuadStore;
use crate::values::ValueStore;

/// Rewrite stages applied to a query plan, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerStage {
    /// Fold externally supplied bindings into the plan.
    BindingAssignment,
    /// Evaluate constant expressions once.
    ConstantFolding,
    /// Normalize comparison operators.
    ComparisonNormalization,
    /// Split conjunctive constraints into separate filters.
    ConjunctiveConstraintSplit,
    /// Rewrite disjunctive constraints into unions.
    DisjunctiveConstraintOptimization,
    /// Drop filters made redundant by same-term equality.
    SameTermFilterRemoval,
    /// Prune and normalize the plan shape.
    PlanNormalization,
    /// Reorder joins using pattern cardinality estimates.
    JoinOrderOptimization,
    /// Restructure for iterative evaluation.
    IterativeEvaluation,
    /// Push filters toward the statement patterns they constrain.
    FilterPushdown,
    /// Push order and limit clauses below projections.
    OrderLimitPushdown,
}

/// The fixed pass order a connection applies before delegating to the
/// evaluation strategy.
pub const OPTIMIZER_PIPELINE: [OptimizerStage; 11] = [
    OptimizerStage::BindingAssignment,
    OptimizerStage::ConstantFolding,
    OptimizerStage::ComparisonNormalization,
    OptimizerStage::ConjunctiveConstraintSplit,
    OptimizerStage::DisjunctiveConstraintOptimization,
    OptimizerStage::SameTermFilterRemoval,
    OptimizerStage::PlanNormalization,
    OptimizerStage::JoinOrderOptimization,
    OptimizerStage::IterativeEvaluation,
    OptimizerStage::FilterPushdown,
    OptimizerStage::OrderLimitPushdown,
];

/// One rewrite pass over a plan of type `P`.
pub trait QueryOptimizer<P> {
    /// Rewrites the plan in place.
    fn optimize(&self, plan: &mut P);
}

/// Cursor over materialized statements.
pub type QuadCursor = Box<dyn Iterator<Item = Result<Quad>> + Send>;

/// Statement access handed to the evaluation strategy.
pub trait StatementSource {
    /// Statements matching the pattern. `None` is a wildcard; an empty
    /// context list means all graphs, and a `None` entry in it names the
    /// default graph.
    fn statements(
        &self,
        subj: Option<&Term>,
        pred: Option<&Term>,
        obj: Option<&Term>,
        contexts: &[Option<Term>],
    ) -> Result<QuadCursor>;
}

/// A query-evaluation engine plugged in from outside the crate.
///
/// The strategy owns the plan representation; the store contributes the
/// statement source, the statistics, and the pass order. Stages the
/// strategy has no pass for are skipped.
pub trait EvaluationStrategy {
    /// The plan representation rewritten by the passes.
    type Plan;
    /// What evaluation produces.
    type Output;

    /// The rewrite pass for `stage`, if the strategy implements one.
    fn optimizer(
        &self,
        stage: OptimizerStage,
        statistics: &PatternStatistics<'_>,
    ) -> Option<Box<dyn QueryOptimizer<Self::Plan> + '_>>;

    /// Runs the rewritten plan against the statement source.
    fn evaluate(&mut self, plan: Self::Plan, source: &dyn StatementSource)
        -> Result<Self::Output>;
}

/// Cardinality fallback when the store cannot answer, scaled down by each
/// bound position.
const GENERIC_CARDINALITY: f64 = 1000.0;

/// Cardinality estimation for single statement patterns.
///
/// A bound term of the wrong kind for its position (a literal subject, a
/// non-IRI predicate) can never match and is treated as unbound; a term
/// the store has never seen gives zero. I/O failures degrade to a generic
/// pattern-shape estimate instead of failing the query.
pub struct PatternStatistics<'a> {
    quads: &'a QuadStore,
    values: &'a dyn ValueStore,
}

impl<'a> PatternStatistics<'a> {
    /// Builds statistics over a store's indexes and interned terms.
    pub fn new(quads: &'a QuadStore, values: &'a dyn ValueStore) -> Self {
        Self { quads, values }
    }

    /// Estimated number of statements matching the pattern.
    pub fn cardinality(
        &self,
        subj: Option<&Term>,
        pred: Option<&Term>,
        obj: Option<&Term>,
        context: Option<&Term>,
    ) -> f64 {
        let subj = subj.filter(|t| t.is_resource());
        let pred = pred.filter(|t| t.is_iri());
        let context = context.filter(|t| t.is_resource());
        let bound = [
            subj.is_some(),
            pred.is_some(),
            obj.is_some(),
            context.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count() as i32;

        let mut lookup_failed = false;
        let mut resolve = |term: Option<&Term>| -> Option<i32> {
            match term {
                None => Some(-1),
                Some(term) => match self.values.get_id(term) {
                    Ok(id) if id == UNKNOWN_ID => None,
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(error = %e, "term lookup failed during cardinality estimation");
                        lookup_failed = true;
                        None
                    }
                },
            }
        };
        let ids = (
            resolve(subj),
            resolve(pred),
            resolve(obj),
            resolve(context),
        );
        if lookup_failed {
            return GENERIC_CARDINALITY / 10f64.powi(bound);
        }
        let (Some(s), Some(p), Some(o), Some(c)) = ids else {
            // A never-seen term matches nothing.
            return 0.0;
        };

        match self.quads.cardinality(s, p, o, c) {
            Ok(count) => count as f64,
            Err(e) => {
                warn!(error = %e, "cardinality estimation failed, using generic estimate");
                GENERIC_CARDINALITY / 10f64.powi(bound)
            }
        }
    }
}
