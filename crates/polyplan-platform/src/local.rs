//! In-process reference platform.
//!
//! Evaluates the built-in operator kinds over in-memory quanta through a
//! capability table (operator key -> executor fn). Name, channel kinds, the
//! supported keys, and the cost model are all configurable, so one process can
//! host several "engines" with different capabilities.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use polyplan_core::channel::ChannelKind;
use polyplan_core::id::PlatformId;
use polyplan_core::plan::{Operator, OperatorKind, Source, Transform};
use polyplan_core::types::Quantum;
use polyplan_cost::{LinearLoadEstimator, LoadEstimator};

use crate::error::PlatformError;
use crate::instance::ChannelInstance;
use crate::lineage::ExecutionLineageNode;
use crate::materialize::materialize;
use crate::platform::{ExecutionContext, ExecutionOutcome, OutputPlaceholder, Platform};

type Inputs<'a> = &'a [Arc<Vec<Quantum>>];
type ExecFn = fn(&OperatorKind, Inputs<'_>, usize) -> Result<Vec<Quantum>, PlatformError>;

const CAPABILITIES: &[(&str, ExecFn)] = &[
    ("source.collection", exec_source),
    ("transform.map", exec_map),
    ("transform.flat_map", exec_flat_map),
    ("transform.filter", exec_filter),
    ("transform.group_by", exec_group_by),
    ("transform.reduce_by", exec_reduce_by),
    ("transform.union", exec_union),
    ("transform.distinct", exec_distinct),
    ("transform.count", exec_count),
    ("transform.sort", exec_sort),
    ("sink.collect", exec_forward),
    ("loop.head", exec_forward),
    ("loop.output", exec_forward),
];

pub struct LocalPlatform {
    id: PlatformId,
    produced: Vec<ChannelKind>,
    consumed: Vec<ChannelKind>,
    table: HashMap<&'static str, ExecFn>,
    estimator: Arc<LinearLoadEstimator>,
}

impl LocalPlatform {
    /// Every built-in operator; reads and writes `collection` and `stream`.
    pub fn new(name: impl Into<PlatformId>) -> Self {
        Self {
            id: name.into(),
            produced: vec![ChannelKind::COLLECTION, ChannelKind::STREAM],
            consumed: vec![ChannelKind::COLLECTION, ChannelKind::STREAM],
            table: CAPABILITIES.iter().copied().collect(),
            estimator: Arc::new(LinearLoadEstimator::default()),
        }
    }

    pub fn with_channel_kinds(mut self, produced: Vec<ChannelKind>, consumed: Vec<ChannelKind>) -> Self {
        self.produced = produced;
        self.consumed = consumed;
        self
    }

    /// Keep only the listed operator keys (loop control is always kept).
    pub fn with_operators(mut self, keys: &[&str]) -> Self {
        let keep: BTreeSet<&str> = keys.iter().copied().collect();
        self.table
            .retain(|k, _| keep.contains(k) || k.starts_with("loop."));
        self
    }

    pub fn without_operator(mut self, key: &str) -> Self {
        self.table.remove(key);
        self
    }

    pub fn with_estimator(mut self, estimator: LinearLoadEstimator) -> Self {
        self.estimator = Arc::new(estimator);
        self
    }

    /// Shorthand for a linear estimator with the given startup and per-quantum cost.
    pub fn with_cost(self, startup: f64, per_quantum: f64) -> Self {
        self.with_estimator(LinearLoadEstimator::new(startup, per_quantum))
    }

    pub fn estimator(&self) -> &Arc<LinearLoadEstimator> {
        &self.estimator
    }

    /// Evaluate `kind` over `inputs` without any channel bookkeeping.
    pub fn evaluate(&self, kind: &OperatorKind, inputs: Inputs<'_>) -> Result<Vec<Quantum>, PlatformError> {
        self.evaluate_at(kind, inputs, 0)
    }

    /// Same as [`LocalPlatform::evaluate`], as seen from loop iteration `iteration`.
    pub fn evaluate_at(
        &self,
        kind: &OperatorKind,
        inputs: Inputs<'_>,
        iteration: usize,
    ) -> Result<Vec<Quantum>, PlatformError> {
        let f = self.table.get(kind.key()).ok_or_else(|| PlatformError::Unsupported {
            platform: self.id.clone(),
            key: kind.key().to_string(),
        })?;
        f(kind, inputs, iteration)
    }
}

impl fmt::Debug for LocalPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.table.keys().copied().collect();
        keys.sort_unstable();
        f.debug_struct("LocalPlatform")
            .field("id", &self.id)
            .field("produced", &self.produced)
            .field("consumed", &self.consumed)
            .field("operators", &keys)
            .finish()
    }
}

impl Platform for LocalPlatform {
    fn id(&self) -> &PlatformId {
        &self.id
    }

    fn produced_channel_kinds(&self) -> Vec<ChannelKind> {
        self.produced.clone()
    }

    fn consumed_channel_kinds(&self) -> Vec<ChannelKind> {
        self.consumed.clone()
    }

    fn supports(&self, kind: &OperatorKind) -> bool {
        self.table.contains_key(kind.key())
    }

    fn load_estimator(&self, _key: &str) -> Option<Arc<dyn LoadEstimator>> {
        let e: Arc<dyn LoadEstimator> = self.estimator.clone();
        Some(e)
    }

    fn execute(
        &self,
        op: &Operator,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[OutputPlaceholder],
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, PlatformError> {
        ctx.check_cancelled()?;
        for inst in inputs {
            if !self.consumed.contains(&inst.kind()) {
                return Err(PlatformError::Exec(format!(
                    "{} cannot read channel kind '{}'",
                    self.id,
                    inst.kind()
                )));
            }
        }

        let data = inputs
            .iter()
            .map(|i| i.read())
            .collect::<Result<Vec<_>, _>>()?;
        let result = Arc::new(self.evaluate_at(op.kind(), &data, ctx.iteration.unwrap_or(0))?);
        ctx.check_cancelled()?;

        let mut produced = Vec::with_capacity(outputs.len());
        for out in outputs {
            if !self.produced.contains(&out.kind) {
                return Err(PlatformError::Exec(format!(
                    "{} cannot write channel kind '{}'",
                    self.id, out.kind
                )));
            }
            let stored = materialize(Arc::clone(&result), out.kind, &ctx.scratch_dir, out.instance)?;
            produced.push(Arc::new(out.fill(op.id(), stored, result.len() as u64)));
        }

        let collected = op.is_sink().then(|| result.as_ref().clone());
        Ok(ExecutionOutcome {
            produced,
            lineage: ExecutionLineageNode {
                operator: op.id(),
                platform: self.id.clone(),
                iteration: ctx.iteration,
                consumed: inputs.iter().map(|i| i.lineage()).collect(),
                measurement: None,
            },
            collected,
        })
    }
}

// ----- capability table -----

fn mismatch(kind: &OperatorKind) -> PlatformError {
    PlatformError::Exec(format!("executor does not handle {kind:?}"))
}

fn first<'a>(inputs: Inputs<'a>) -> Result<&'a [Quantum], PlatformError> {
    inputs
        .first()
        .map(|v| v.as_slice())
        .ok_or(PlatformError::MissingInput(0))
}

fn exec_source(kind: &OperatorKind, _inputs: Inputs<'_>, _iteration: usize) -> Result<Vec<Quantum>, PlatformError> {
    match kind {
        OperatorKind::Source(Source::Collection(items)) => Ok(items.as_ref().clone()),
        other => Err(mismatch(other)),
    }
}

fn exec_forward(_kind: &OperatorKind, inputs: Inputs<'_>, _iteration: usize) -> Result<Vec<Quantum>, PlatformError> {
    Ok(first(inputs)?.to_vec())
}

fn exec_map(kind: &OperatorKind, inputs: Inputs<'_>, iteration: usize) -> Result<Vec<Quantum>, PlatformError> {
    match kind.transform() {
        Some(Transform::Map(f)) => Ok(first(inputs)?.iter().map(|q| f(q)).collect()),
        Some(Transform::IterationMap(f)) => Ok(first(inputs)?.iter().map(|q| f(q, iteration)).collect()),
        _ => Err(mismatch(kind)),
    }
}

fn exec_flat_map(kind: &OperatorKind, inputs: Inputs<'_>, _iteration: usize) -> Result<Vec<Quantum>, PlatformError> {
    match kind.transform() {
        Some(Transform::FlatMap { f, .. }) => Ok(first(inputs)?.iter().flat_map(|q| f(q)).collect()),
        _ => Err(mismatch(kind)),
    }
}

fn exec_filter(kind: &OperatorKind, inputs: Inputs<'_>, _iteration: usize) -> Result<Vec<Quantum>, PlatformError> {
    match kind.transform() {
        Some(Transform::Filter { predicate, .. }) => Ok(first(inputs)?
            .iter()
            .filter(|q| predicate(*q))
            .cloned()
            .collect()),
        _ => Err(mismatch(kind)),
    }
}

fn exec_group_by(kind: &OperatorKind, inputs: Inputs<'_>, _iteration: usize) -> Result<Vec<Quantum>, PlatformError> {
    match kind.transform() {
        Some(Transform::GroupBy(key)) => {
            let mut groups: BTreeMap<Quantum, Vec<Quantum>> = BTreeMap::new();
            for q in first(inputs)? {
                groups.entry(key(q)).or_default().push(q.clone());
            }
            Ok(groups.into_values().map(Quantum::Group).collect())
        }
        _ => Err(mismatch(kind)),
    }
}

fn exec_reduce_by(kind: &OperatorKind, inputs: Inputs<'_>, _iteration: usize) -> Result<Vec<Quantum>, PlatformError> {
    match kind.transform() {
        Some(Transform::ReduceBy { key, reduce }) => {
            let mut acc: BTreeMap<Quantum, Quantum> = BTreeMap::new();
            for q in first(inputs)? {
                let k = key(q);
                let next = match acc.remove(&k) {
                    Some(prev) => reduce(&prev, q),
                    None => q.clone(),
                };
                acc.insert(k, next);
            }
            Ok(acc.into_values().collect())
        }
        _ => Err(mismatch(kind)),
    }
}

fn exec_union(_kind: &OperatorKind, inputs: Inputs<'_>, _iteration: usize) -> Result<Vec<Quantum>, PlatformError> {
    Ok(inputs.iter().flat_map(|v| v.iter().cloned()).collect())
}

fn exec_distinct(_kind: &OperatorKind, inputs: Inputs<'_>, _iteration: usize) -> Result<Vec<Quantum>, PlatformError> {
    let mut seen = BTreeSet::new();
    Ok(first(inputs)?
        .iter()
        .filter(|q| seen.insert((*q).clone()))
        .cloned()
        .collect())
}

fn exec_count(_kind: &OperatorKind, inputs: Inputs<'_>, _iteration: usize) -> Result<Vec<Quantum>, PlatformError> {
    Ok(vec![Quantum::Int(first(inputs)?.len() as i64)])
}

fn exec_sort(_kind: &OperatorKind, inputs: Inputs<'_>, _iteration: usize) -> Result<Vec<Quantum>, PlatformError> {
    let mut items = first(inputs)?.to_vec();
    items.sort();
    Ok(items)
}
