//! Test platforms and small plan builders shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use polyplan_core::channel::ChannelKind;
use polyplan_core::id::PlatformId;
use polyplan_core::plan::{Operator, OperatorKind};
use polyplan_core::types::{DataUnitType, Quantum, SlotType};
use polyplan_cost::LoadEstimator;
use polyplan_exec::CancelHandle;
use polyplan_platform::{
    ChannelInstance, ExecutionContext, ExecutionOutcome, LocalPlatform, OutputPlaceholder,
    Platform, PlatformError, PlatformRegistry,
};

pub const INT: SlotType = SlotType::single(DataUnitType::Int);
pub const STR: SlotType = SlotType::single(DataUnitType::Str);

pub fn ints(values: &[i64]) -> Vec<Quantum> {
    values.iter().map(|v| Quantum::Int(*v)).collect()
}

pub fn strs(values: &[&str]) -> Vec<Quantum> {
    values.iter().map(|v| Quantum::str(*v)).collect()
}

/// Output strings in sorted order, for order-independent comparisons.
pub fn sorted_strs(output: &[Quantum]) -> Vec<String> {
    let mut out: Vec<String> = output
        .iter()
        .filter_map(|q| q.as_str().map(str::to_string))
        .collect();
    out.sort();
    out
}

pub fn increment() -> Operator {
    Operator::map(DataUnitType::Int, DataUnitType::Int, |q| {
        Quantum::Int(q.as_int().unwrap_or(0) + 1)
    })
}

pub fn uppercase() -> Operator {
    Operator::map(DataUnitType::Str, DataUnitType::Str, |q| {
        Quantum::str(q.as_str().unwrap_or_default().to_uppercase())
    })
}

/// One in-process platform that runs everything.
pub fn local_registry() -> PlatformRegistry {
    PlatformRegistry::builder()
        .register(Arc::new(LocalPlatform::new("local")))
        .expect("register local")
        .build()
}

/// `alpha` speaks only `collection`, `beta` only `dataset`; edges between
/// them go through a file.
pub fn alpha_beta_registry() -> PlatformRegistry {
    PlatformRegistry::builder()
        .register(Arc::new(LocalPlatform::new("alpha").with_channel_kinds(
            vec![ChannelKind::COLLECTION],
            vec![ChannelKind::COLLECTION],
        )))
        .expect("register alpha")
        .register(Arc::new(LocalPlatform::new("beta").with_channel_kinds(
            vec![ChannelKind::DATASET],
            vec![ChannelKind::DATASET],
        )))
        .expect("register beta")
        .build()
}

/// A cheap platform that fails dispatches of one operator key.
///
/// With `failures` set to N, the first N matching dispatches fail and the rest
/// run normally.
pub struct FlakyPlatform {
    inner: LocalPlatform,
    key: &'static str,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyPlatform {
    pub fn new(name: &str, key: &'static str, failures: usize) -> Self {
        Self::wrapping(LocalPlatform::new(name).with_cost(0.1, 0.1), key, failures)
    }

    /// Same, around a platform configured by the caller.
    pub fn wrapping(inner: LocalPlatform, key: &'static str, failures: usize) -> Self {
        Self {
            inner,
            key,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Platform for FlakyPlatform {
    fn id(&self) -> &PlatformId {
        self.inner.id()
    }

    fn produced_channel_kinds(&self) -> Vec<ChannelKind> {
        self.inner.produced_channel_kinds()
    }

    fn consumed_channel_kinds(&self) -> Vec<ChannelKind> {
        self.inner.consumed_channel_kinds()
    }

    fn supports(&self, kind: &OperatorKind) -> bool {
        self.inner.supports(kind)
    }

    fn load_estimator(&self, key: &str) -> Option<Arc<dyn LoadEstimator>> {
        self.inner.load_estimator(key)
    }

    fn execute(
        &self,
        op: &Operator,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[OutputPlaceholder],
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, PlatformError> {
        if op.key() == self.key {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(PlatformError::Exec(format!("simulated failure of {}", op.display_name())));
            }
        }
        self.inner.execute(op, inputs, outputs, ctx)
    }
}

/// Cancels the job it runs in as soon as it dispatches an operator with `key`.
pub struct CancellingPlatform {
    inner: LocalPlatform,
    key: &'static str,
    pub handle: Arc<Mutex<Option<CancelHandle>>>,
}

impl CancellingPlatform {
    pub fn new(name: &str, key: &'static str) -> Self {
        Self {
            inner: LocalPlatform::new(name),
            key,
            handle: Arc::new(Mutex::new(None)),
        }
    }
}

impl Platform for CancellingPlatform {
    fn id(&self) -> &PlatformId {
        self.inner.id()
    }

    fn produced_channel_kinds(&self) -> Vec<ChannelKind> {
        self.inner.produced_channel_kinds()
    }

    fn consumed_channel_kinds(&self) -> Vec<ChannelKind> {
        self.inner.consumed_channel_kinds()
    }

    fn supports(&self, kind: &OperatorKind) -> bool {
        self.inner.supports(kind)
    }

    fn execute(
        &self,
        op: &Operator,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[OutputPlaceholder],
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, PlatformError> {
        if op.key() == self.key {
            if let Some(handle) = self.handle.lock().as_ref() {
                handle.cancel();
            }
        }
        self.inner.execute(op, inputs, outputs, ctx)
    }
}
