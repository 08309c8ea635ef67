use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;

use crate::exec::block::{BlockCall, ExecContext, ExecutionBlock, Step, Upstream};
use crate::exec::blocks::{emit, expect_rows};
use crate::exec::row::Row;
use crate::query::logical::{Aggregate, AggregateFunction, CollectGroup, VariableId};
use crate::query::value::{compare_values, number_value, to_number, NULL};
use crate::types::Result;

/// Group key ordered by the query language value order.
#[derive(Debug)]
struct GroupKey(Vec<Value>);

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupKey {}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(&other.0) {
            match compare_values(a, b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

#[derive(Clone, Debug)]
enum Accumulator {
    Length(u64),
    Sum(f64),
    Min(Option<Value>),
    Max(Option<Value>),
    Average { sum: f64, count: u64 },
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::Length => Accumulator::Length(0),
            AggregateFunction::Sum => Accumulator::Sum(0.0),
            AggregateFunction::Min => Accumulator::Min(None),
            AggregateFunction::Max => Accumulator::Max(None),
            AggregateFunction::Average => Accumulator::Average { sum: 0.0, count: 0 },
        }
    }

    fn add(&mut self, value: &Value) {
        if let Accumulator::Length(n) = self {
            *n += 1;
            return;
        }
        if value.is_null() {
            return;
        }
        match self {
            Accumulator::Length(_) => {}
            Accumulator::Sum(sum) => *sum += to_number(value),
            Accumulator::Min(current) => {
                if current
                    .as_ref()
                    .map_or(true, |c| compare_values(value, c) == Ordering::Less)
                {
                    *current = Some(value.clone());
                }
            }
            Accumulator::Max(current) => {
                if current
                    .as_ref()
                    .map_or(true, |c| compare_values(value, c) == Ordering::Greater)
                {
                    *current = Some(value.clone());
                }
            }
            Accumulator::Average { sum, count } => {
                *sum += to_number(value);
                *count += 1;
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Length(n) => Value::from(n),
            Accumulator::Sum(sum) => number_value(sum),
            Accumulator::Min(v) | Accumulator::Max(v) => v.unwrap_or(Value::Null),
            Accumulator::Average { count: 0, .. } => Value::Null,
            Accumulator::Average { sum, count } => number_value(sum / count as f64),
        }
    }
}

struct GroupState {
    rows: u64,
    aggregates: Vec<Accumulator>,
}

/// Groups all input rows. Output is ordered by group key and carries only
/// the seed row's bindings plus the collect outputs.
pub struct CollectBlock {
    groups: Vec<CollectGroup>,
    aggregates: Vec<Aggregate>,
    count: Option<VariableId>,
    seed: Row,
    state: BTreeMap<GroupKey, GroupState>,
    output: Option<VecDeque<Row>>,
}

impl CollectBlock {
    /// Block for one Collect node.
    pub fn new(groups: Vec<CollectGroup>, aggregates: Vec<Aggregate>, count: Option<VariableId>) -> Self {
        Self {
            groups,
            aggregates,
            count,
            seed: Row::new(),
            state: BTreeMap::new(),
            output: None,
        }
    }

    fn absorb(&mut self, rows: Vec<Row>) {
        for row in rows {
            let key = GroupKey(
                self.groups
                    .iter()
                    .map(|g| row.get(g.input).cloned().unwrap_or(Value::Null))
                    .collect(),
            );
            let aggregates = &self.aggregates;
            let group = self.state.entry(key).or_insert_with(|| GroupState {
                rows: 0,
                aggregates: aggregates.iter().map(|a| Accumulator::new(a.function)).collect(),
            });
            group.rows += 1;
            for (acc, aggregate) in group.aggregates.iter_mut().zip(aggregates) {
                let value = aggregate
                    .input
                    .and_then(|var| row.get(var))
                    .unwrap_or(&NULL);
                acc.add(value);
            }
        }
    }

    fn finish(&mut self) -> VecDeque<Row> {
        if self.groups.is_empty() && self.state.is_empty() {
            self.state.insert(
                GroupKey(Vec::new()),
                GroupState {
                    rows: 0,
                    aggregates: self
                        .aggregates
                        .iter()
                        .map(|a| Accumulator::new(a.function))
                        .collect(),
                },
            );
        }
        let state = std::mem::take(&mut self.state);
        state
            .into_iter()
            .map(|(key, group)| {
                let mut row = self.seed.clone();
                for (g, value) in self.groups.iter().zip(key.0) {
                    row.set(g.out, value);
                }
                for (a, acc) in self.aggregates.iter().zip(group.aggregates) {
                    row.set(a.out, acc.finish());
                }
                if let Some(var) = self.count {
                    row.set(var, Value::from(group.rows));
                }
                row
            })
            .collect()
    }
}

impl ExecutionBlock for CollectBlock {
    fn kind(&self) -> &'static str {
        "Collect"
    }

    fn step(&mut self, call: BlockCall, input: Option<Upstream>, ctx: &ExecContext) -> Result<Step> {
        if let Some((rows, done)) = expect_rows(self.kind(), input)? {
            self.absorb(rows);
            if done {
                self.output = Some(self.finish());
            }
        }
        match self.output.as_mut() {
            Some(output) => Ok(emit(call, output, true)),
            None => Ok(Step::Pull(BlockCall::Get(ctx.batch_size()))),
        }
    }

    fn reset(&mut self, seed: &Row) {
        self.seed = seed.clone();
        self.state.clear();
        self.output = None;
    }
}
