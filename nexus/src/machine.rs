//! The Machine (spec.md section 4.4): the scheduler over one pool of
//! typed values. Classifies each operation as generator/mutator/invariant,
//! samples satisfiable operations, executes them, integrates results back
//! into the pool.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;

use crate::errors::{NexusError, NexusResult};
use crate::function::FunctionDescriptor;
use crate::rng::TestRng;
use crate::trace::{ReplayOutcome, Trace};
use crate::value::{TypeOps, TypeRegistry, Value};

/// The three fixed tuning constants from spec.md section 4.4, named per
/// SPEC_FULL.md section 4.4.
pub mod tuning {
    /// Bound on pivot attempts while hunting for a satisfiable test
    /// function (spec.md: "≈500 tries").
    pub const MAX_PIVOT_TRIES: u32 = 500;
    /// Bound on argument-sampling attempts against a declared precondition
    /// (spec.md: "≈10 times").
    pub const MAX_ARG_TRIES: u32 = 10;
    /// Consecutive fallback attempts that make no progress before the
    /// Machine gives up with "unable to satisfy any precondition"
    /// (spec.md: "1000 consecutive fallbacks").
    pub const MAX_STARVED_FALLBACKS: u32 = 1000;
}

fn uniform_index(rng: &mut TestRng, len: usize) -> usize {
    debug_assert!(len > 0);
    (rng.next_u64() % (len as u64)) as usize
}

/// One type's slice of the value pool (spec.md section 3 "ValueSet").
pub struct ValueSet {
    pub type_id: TypeId,
    pub vars: Vec<Value>,
    pub safe_generators: Vec<usize>,
    pub mutators_or_generators: Vec<usize>,
    pub invariants: Vec<usize>,
}

impl ValueSet {
    fn new(type_id: TypeId) -> Self {
        ValueSet {
            type_id,
            vars: Vec::new(),
            safe_generators: Vec::new(),
            mutators_or_generators: Vec::new(),
            invariants: Vec::new(),
        }
    }
}

use rand::RngCore as _;

/// The single-pool scheduler (spec.md section 3 "Machine", section 4.4).
pub struct Machine {
    pub values: HashMap<TypeId, ValueSet>,
    pub functions: Vec<FunctionDescriptor>,
    test_functions: RefCell<Vec<usize>>,
    pub max_arity: usize,
    pub type_registry: TypeRegistry,
    consecutive_fallbacks: u32,
}

impl Machine {
    /// Builds a Machine from a list of Function Descriptors (spec.md
    /// section 4.4 "Build"). `default_min_executions` fills in
    /// `min_executions` for any descriptor that left it at 0.
    pub fn build(
        mut functions: Vec<FunctionDescriptor>,
        default_min_executions: u32,
    ) -> NexusResult<Self> {
        for f in &mut functions {
            f.reset_executions();
            if f.min_executions == 0 && !f.is_invariant {
                f.min_executions = default_min_executions;
            }
        }
        for (i, f) in functions.iter().enumerate() {
            f.set_internal_index(i);
        }

        let mut values: HashMap<TypeId, ValueSet> = HashMap::new();
        for f in &functions {
            for &t in &f.arg_types {
                values.entry(t).or_insert_with(|| ValueSet::new(t));
            }
            if let Some(rt) = f.return_type {
                values.entry(rt).or_insert_with(|| ValueSet::new(rt));
            }
        }

        let mut test_functions = Vec::new();
        let mut max_arity = 0;
        for (i, f) in functions.iter().enumerate() {
            max_arity = max_arity.max(f.arity());
            if f.is_invariant {
                for &t in &f.arg_types {
                    values.get_mut(&t).unwrap().invariants.push(i);
                }
                continue;
            }
            if let Some(rt) = f.return_type {
                if f.is_safe_generator_of(rt) {
                    values.get_mut(&rt).unwrap().safe_generators.push(i);
                }
                let set = values.get_mut(&rt).unwrap();
                if !set.mutators_or_generators.contains(&i) {
                    set.mutators_or_generators.push(i);
                }
            }
            for (pos, &t) in f.arg_types.iter().enumerate() {
                if f.arg_is_mutable[pos] {
                    let set = values.get_mut(&t).unwrap();
                    if !set.mutators_or_generators.contains(&i) {
                        set.mutators_or_generators.push(i);
                    }
                }
            }
            test_functions.push(i);
        }

        for f in &functions {
            for &t in &f.arg_types {
                if values.get(&t).map_or(true, |s| s.safe_generators.is_empty()) {
                    return Err(NexusError::SetupError(
                        format!(
                            "no safe generator for an argument type of `{}`",
                            f.name
                        )
                        .into(),
                    ));
                }
            }
        }
        if test_functions.is_empty() {
            return Err(NexusError::SetupError(
                "no test functions registered".into(),
            ));
        }

        Ok(Machine {
            values,
            functions,
            test_functions: RefCell::new(test_functions),
            max_arity,
            type_registry: TypeRegistry::new(),
            consecutive_fallbacks: 0,
        })
    }

    /// Registers a printer/equality pair for `id`, so that equivalence-mode
    /// comparisons (`mct::compare_values`) and check-failure reprs
    /// (spec.md section 4.2 step 4) can see past the "never equal, opaque
    /// type name" fallback for a type the test author cares about. A no-op
    /// for the first registration to "win" if called twice for the same
    /// `TypeId` (mirrors `TypeRegistry::register`'s own `or_insert`).
    pub fn register_type(&mut self, id: TypeId, ops: TypeOps) {
        self.type_registry.register(id, ops);
    }

    pub fn is_done(&self) -> bool {
        self.test_functions.borrow().is_empty()
    }

    /// Whether every argument position of `fn_idx` currently has at least
    /// one value to sample from. Exposed `pub(crate)` so the equivalence
    /// MCT Driver can pivot machine A's candidate the same way the normal
    /// loop does (spec.md section 4.5 step 4).
    pub(crate) fn args_satisfiable(&self, fn_idx: usize) -> bool {
        self.functions[fn_idx]
            .arg_types
            .iter()
            .all(|t| !self.values[t].vars.is_empty())
    }

    /// Runs the Machine's sample/execute/integrate loop until
    /// `test_functions` is empty (spec.md section 4.4 "Stopping").
    pub fn run(&mut self, rng: &mut TestRng, trace: &mut Trace) -> NexusResult<()> {
        while !self.is_done() {
            self.step(rng, trace)?;
        }
        Ok(())
    }

    /// Executes one sample/execute/integrate iteration.
    pub(crate) fn step(&mut self, rng: &mut TestRng, trace: &mut Trace) -> NexusResult<()> {
        let mut candidate = self.pick_test_function(rng);

        for _ in 0..tuning::MAX_PIVOT_TRIES {
            if self.args_satisfiable(candidate) {
                break;
            }
            let missing_ty = self.pick_missing_arg_type(candidate, rng);
            candidate = self.pick_safe_generator(missing_ty, rng);
        }

        if let Some(slots) = self.sample_args(candidate, rng) {
            self.execute_and_integrate(candidate, slots, rng, trace);
            self.consecutive_fallbacks = 0;
        } else {
            let progressed = self.fallback(candidate, rng, trace);
            if progressed {
                self.consecutive_fallbacks = 0;
            } else {
                self.consecutive_fallbacks += 1;
                if self.consecutive_fallbacks >= tuning::MAX_STARVED_FALLBACKS {
                    return Err(NexusError::PreconditionStarvation {
                        stuck: vec![self.functions[candidate].name],
                    });
                }
            }
        }

        self.test_functions.borrow_mut().retain(|&i| {
            self.functions[i].executions() < self.functions[i].min_executions
        });
        Ok(())
    }

    pub(crate) fn pick_test_function(&self, rng: &mut TestRng) -> usize {
        let tf = self.test_functions.borrow();
        tf[uniform_index(rng, tf.len())]
    }

    pub(crate) fn pick_missing_arg_type(&self, fn_idx: usize, rng: &mut TestRng) -> TypeId {
        let missing: Vec<TypeId> = self.functions[fn_idx]
            .arg_types
            .iter()
            .copied()
            .filter(|t| self.values[t].vars.is_empty())
            .collect();
        missing[uniform_index(rng, missing.len())]
    }

    pub(crate) fn pick_safe_generator(&self, ty: TypeId, rng: &mut TestRng) -> usize {
        let gens = &self.values[&ty].safe_generators;
        gens[uniform_index(rng, gens.len())]
    }

    /// Samples argument slot indices for `fn_idx`, retrying against a
    /// declared precondition up to `MAX_ARG_TRIES` times (spec.md section
    /// 4.4 "Sampling arguments").
    pub(crate) fn sample_args(&self, fn_idx: usize, rng: &mut TestRng) -> Option<Vec<usize>> {
        if !self.args_satisfiable(fn_idx) {
            return None;
        }
        let desc = &self.functions[fn_idx];
        let tries = if desc.has_precondition() {
            tuning::MAX_ARG_TRIES
        } else {
            1
        };
        for _ in 0..tries {
            let slots: Vec<usize> = desc
                .arg_types
                .iter()
                .map(|t| uniform_index(rng, self.values[t].vars.len()))
                .collect();
            if !desc.has_precondition() {
                return Some(slots);
            }
            let refs: Vec<&Value> = desc
                .arg_types
                .iter()
                .zip(slots.iter())
                .map(|(t, &s)| &self.values[t].vars[s])
                .collect();
            if desc.satisfies_precondition(&refs) {
                return Some(slots);
            }
        }
        None
    }

    /// Fallback generation (spec.md section 4.4 "Fallback generation").
    /// Returns whether any value was actually produced/perturbed.
    fn fallback(&mut self, fn_idx: usize, rng: &mut TestRng, trace: &mut Trace) -> bool {
        let pick_local = uniform_index(rng, 2) == 0;
        let chosen = if pick_local {
            let desc = &self.functions[fn_idx];
            if desc.arg_types.is_empty() {
                fn_idx
            } else {
                let ty = desc.arg_types[uniform_index(rng, desc.arg_types.len())];
                let candidates = &self.values[&ty].mutators_or_generators;
                if candidates.is_empty() {
                    fn_idx
                } else {
                    candidates[uniform_index(rng, candidates.len())]
                }
            }
        } else {
            uniform_index(rng, self.functions.len())
        };

        match self.sample_args(chosen, rng) {
            Some(slots) => {
                self.execute_and_integrate(chosen, slots, rng, trace);
                true
            }
            None => false,
        }
    }

    fn take_args(&mut self, types: &[TypeId], slots: &[usize]) -> Vec<Value> {
        types
            .iter()
            .zip(slots.iter())
            .map(|(ty, &slot)| {
                let set = self.values.get_mut(ty).unwrap();
                std::mem::replace(&mut set.vars[slot], Value::new(()))
            })
            .collect()
    }

    fn put_back_args(&mut self, types: &[TypeId], slots: &[usize], mut values: Vec<Value>) {
        for (i, (ty, &slot)) in types.iter().zip(slots.iter()).enumerate() {
            let set = self.values.get_mut(ty).unwrap();
            set.vars[slot] = std::mem::replace(&mut values[i], Value::new(()));
        }
    }

    /// Executes `fn_idx` against `slots` and integrates its return value,
    /// without checking invariants (spec.md section 4.4 "Integrate
    /// result"). Split from invariant-checking so the Trace can always
    /// record an op *before* any invariant it triggers has a chance to
    /// unwind the test — otherwise a minimized replay would be missing the
    /// very op that caused the failure. Returns the return slot (`-1` for
    /// void), matching the `return_value_idx` a Trace op records.
    pub(crate) fn perform_op(&mut self, fn_idx: usize, slots: &[usize], rng: &mut TestRng) -> i32 {
        let arg_types = self.functions[fn_idx].arg_types.clone();
        let mut args = self.take_args(&arg_types, slots);
        let ret = self.functions[fn_idx].execute(&mut args);
        self.put_back_args(&arg_types, slots, args);

        if let Some(val) = ret {
            let rty = self.functions[fn_idx].return_type.unwrap();
            self.integrate(rty, val, rng) as i32
        } else {
            -1
        }
    }

    /// Runs every invariant registered under each mutable argument's type,
    /// and under the return type if there is one (spec.md section 4.4
    /// "Execute").
    pub(crate) fn check_invariants(&mut self, fn_idx: usize, slots: &[usize], return_slot: i32) {
        let arg_types = self.functions[fn_idx].arg_types.clone();
        let arg_mutable = self.functions[fn_idx].arg_is_mutable.clone();
        for (pos, &ty) in arg_types.iter().enumerate() {
            if arg_mutable[pos] {
                self.run_invariants_on(ty, slots[pos]);
            }
        }
        if return_slot >= 0 {
            if let Some(rty) = self.functions[fn_idx].return_type {
                self.run_invariants_on(rty, return_slot as usize);
            }
        }
    }

    /// `perform_op` + `check_invariants`, for callers that don't need to
    /// interleave a shared Trace recording in between (the normal-mode
    /// sample/execute/integrate loop below).
    pub(crate) fn execute_and_integrate_silent(
        &mut self,
        fn_idx: usize,
        slots: &[usize],
        rng: &mut TestRng,
    ) -> i32 {
        let return_slot = self.perform_op(fn_idx, slots, rng);
        self.check_invariants(fn_idx, slots, return_slot);
        return_slot
    }

    /// As `execute_and_integrate_silent`, but records the op into `trace`
    /// in between `perform_op` and `check_invariants` (spec.md section 4.5
    /// "Tracing": "Each executed op (in both modes) appends ..." — exactly
    /// one record per logical step, even in equivalence mode where the MCT
    /// Driver calls `perform_op`/`check_invariants` directly on the paired
    /// machine instead of recording twice).
    fn execute_and_integrate(
        &mut self,
        fn_idx: usize,
        slots: Vec<usize>,
        rng: &mut TestRng,
        trace: &mut Trace,
    ) {
        let return_slot = self.perform_op(fn_idx, &slots, rng);
        trace.record_op(
            fn_idx,
            slots.iter().map(|&s| s as i32).collect(),
            return_slot,
        );
        self.check_invariants(fn_idx, &slots, return_slot);
    }

    fn run_invariants_on(&mut self, ty: TypeId, slot: usize) {
        let inv_indices = self.values[&ty].invariants.clone();
        for idx in inv_indices {
            let arg_types = self.functions[idx].arg_types.clone();
            let arg_slots: Vec<usize> = arg_types
                .iter()
                .map(|&t| if t == ty { slot } else { 0 })
                .collect();
            if arg_slots
                .iter()
                .zip(arg_types.iter())
                .any(|(&s, t)| s >= self.values[t].vars.len())
            {
                continue;
            }
            let mut args = self.take_args(&arg_types, &arg_slots);
            let result = self.functions[idx].execute(&mut args);
            self.put_back_args(&arg_types, &arg_slots, args);
            let ok = match result {
                None => true,
                Some(v) => v.downcast_ref::<bool>().copied().unwrap_or(false),
            };
            if !ok {
                let name = self.functions[idx].name;
                // An invariant violation leaves the pool in a state the
                // Machine can no longer reason about meaningfully, so it
                // always raises the assertion signal rather than merely
                // incrementing the failed-check counter.
                crate::assertion::record_check(false, "machine", 0, true, || {
                    format!("invariant `{}` failed", name)
                })
            }
        }
    }

    /// Replays a previously recorded trace deterministically: no sampling,
    /// each op writes to the exact slot the trace recorded (spec.md
    /// section 4.5 "Reproduction", section 4.6 minimization loop). Returns
    /// `Invalid` the moment an op's slots don't yet exist or its
    /// precondition is false on the current pool (spec.md section 7:
    /// "Trace replay invalid ... reported as invalid trace and skipped").
    pub fn replay_trace(&mut self, trace: &Trace) -> ReplayOutcome {
        for op in &trace.ops {
            let desc_arity = self.functions[op.function_index].arity();
            assert_eq!(
                desc_arity,
                op.args.len(),
                "nexus: replay arity mismatch for `{}` (registered functions changed since the trace was recorded)",
                self.functions[op.function_index].name
            );

            let arg_types = self.functions[op.function_index].arg_types.clone();
            let arg_mutable = self.functions[op.function_index].arg_is_mutable.clone();
            let slots: Vec<usize> = op.args.iter().map(|&a| a as usize).collect();

            if slots.iter().zip(arg_types.iter()).any(|(&s, t)| {
                self.values.get(t).map_or(true, |v| s >= v.vars.len())
            }) {
                return ReplayOutcome::Invalid;
            }

            let mut args = self.take_args(&arg_types, &slots);
            let refs: Vec<&Value> = args.iter().collect();
            if !self.functions[op.function_index].satisfies_precondition(&refs) {
                self.put_back_args(&arg_types, &slots, args);
                return ReplayOutcome::Invalid;
            }

            let ret = self.functions[op.function_index].execute(&mut args);
            self.put_back_args(&arg_types, &slots, args);

            for (pos, &ty) in arg_types.iter().enumerate() {
                if arg_mutable[pos] {
                    self.run_invariants_on(ty, slots[pos]);
                }
            }

            if let Some(val) = ret {
                let rty = self.functions[op.function_index].return_type.unwrap();
                let slot = op.return_value_idx as usize;
                let set = self.values.get_mut(&rty).unwrap();
                if slot == set.vars.len() {
                    set.vars.push(val);
                } else if slot < set.vars.len() {
                    set.vars[slot] = val;
                } else {
                    return ReplayOutcome::Invalid;
                }
                self.run_invariants_on(rty, slot);
            }
        }
        ReplayOutcome::Completed
    }

    /// Integrates a freshly produced value into its type's pool (spec.md
    /// section 4.4 "Integrate result"): with probability `1/(1+vars.len())`
    /// append a new slot, otherwise overwrite a uniformly chosen existing
    /// slot.
    fn integrate(&mut self, ty: TypeId, val: Value, rng: &mut TestRng) -> usize {
        let set = self.values.get_mut(&ty).unwrap();
        let n = set.vars.len();
        if n == 0 || uniform_index(rng, n + 1) == 0 {
            set.vars.push(val);
            set.vars.len() - 1
        } else {
            let idx = uniform_index(rng, n);
            set.vars[idx] = val;
            idx
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{op, Ref, RefMut};

    struct Stack(Vec<i32>);

    fn gen_stack() -> Stack {
        Stack(Vec::new())
    }
    fn gen_int() -> i32 {
        1
    }
    fn push(mut s: RefMut<Stack>, v: Ref<i32>) {
        s.0.push(*v);
    }
    fn pop(mut s: RefMut<Stack>) -> i32 {
        s.0.pop().unwrap_or(0)
    }
    fn size(s: Ref<Stack>) -> usize {
        s.0.len()
    }
    fn size_non_negative(s: Ref<usize>) -> bool {
        *s <= usize::MAX
    }

    fn build_stack_machine(min_exec: u32) -> Machine {
        let fns = vec![
            op("gen_stack", gen_stack),
            op("gen_int", gen_int),
            op("push", push),
            op("pop", pop),
            op("size", size),
            op("size_non_negative", size_non_negative).invariant(),
        ];
        Machine::build(fns, min_exec).unwrap()
    }

    #[test]
    fn s4_mct_over_a_stack() {
        let mut machine = build_stack_machine(20);
        let mut rng = TestRng::from_seed_u64(42);
        let mut trace = Trace::new();
        machine.run(&mut rng, &mut trace).unwrap();
        assert!(machine.is_done());
        for f in &machine.functions {
            if !f.is_invariant {
                assert!(f.executions() >= f.min_executions);
            }
        }
    }

    #[test]
    fn build_rejects_missing_safe_generator() {
        fn only_push(_s: RefMut<Stack>, _v: Ref<i32>) {}
        let fns = vec![op("only_push", only_push)];
        assert!(Machine::build(fns, 10).is_err());
    }
}
