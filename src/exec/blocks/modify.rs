use std::collections::VecDeque;

use serde_json::Value;
use tracing::{debug, warn};

use crate::exec::block::ExecContext;
use crate::exec::blocks::{RowTransform, TransformBlock};
use crate::exec::row::Row;
use crate::primitives::fault::points;
use crate::query::logical::{ModifyOp, VariableId};
use crate::query::value::{document_key, NULL};
use crate::types::{AqlError, Result};

/// Key of a remove/update/replace target: a key string or a document carrying `_key`.
fn target_key(value: &Value) -> Result<String> {
    match value {
        Value::String(key) => Ok(key.clone()),
        Value::Object(_) => document_key(value)
            .map(str::to_owned)
            .ok_or_else(|| AqlError::DocumentKeyBad("document has no _key attribute".into())),
        other => Err(AqlError::DocumentKeyBad(format!(
            "expected a key string or a document, got {other}"
        ))),
    }
}

/// Applies one write per input row through the query transaction.
pub struct Modify {
    op: ModifyOp,
    collection: String,
    input: VariableId,
    key: Option<VariableId>,
    ignore_errors: bool,
    old: Option<VariableId>,
    new: Option<VariableId>,
}

impl Modify {
    fn apply(&self, row: &Row, ctx: &ExecContext) -> Result<(Value, Value)> {
        let txn = ctx.txn();
        let input = row.get(self.input).unwrap_or(&NULL);
        match self.op {
            ModifyOp::Insert => {
                let new = txn.insert(&self.collection, input.clone())?;
                Ok((Value::Null, new))
            }
            ModifyOp::Update | ModifyOp::Replace => {
                let key = match self.key {
                    Some(var) => target_key(row.get(var).unwrap_or(&NULL))?,
                    None => target_key(input)?,
                };
                if self.op == ModifyOp::Update {
                    txn.update(&self.collection, &key, input.clone())
                } else {
                    txn.replace(&self.collection, &key, input.clone())
                }
            }
            ModifyOp::Remove => {
                let key = target_key(input)?;
                let old = txn.remove(&self.collection, &key)?;
                Ok((old, Value::Null))
            }
        }
    }
}

impl RowTransform for Modify {
    fn kind(&self) -> &'static str {
        self.op.name()
    }

    fn process(&mut self, rows: Vec<Row>, out: &mut VecDeque<Row>, ctx: &ExecContext) -> Result<()> {
        for mut row in rows {
            ctx.check_fault(points::MODIFICATION_APPLY)?;
            match self.apply(&row, ctx) {
                Ok((old, new)) => {
                    ctx.summary().lock().record_written();
                    if let Some(var) = self.old {
                        row.set(var, old);
                    }
                    if let Some(var) = self.new {
                        row.set(var, new);
                    }
                    out.push_back(row);
                }
                Err(err) if self.ignore_errors && err.is_document_error() => {
                    debug!(collection = %self.collection, code = err.code(), %err, "write ignored");
                    ctx.summary().lock().record_ignored(&err);
                }
                Err(err) => {
                    warn!(collection = %self.collection, op = self.op.name(), %err, "write failed");
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

/// Insert, Update, Replace or Remove node.
pub type ModifyBlock = TransformBlock<Modify>;

impl TransformBlock<Modify> {
    /// Block applying `op` to `collection`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        op: ModifyOp,
        collection: impl Into<String>,
        input: VariableId,
        key: Option<VariableId>,
        ignore_errors: bool,
        old: Option<VariableId>,
        new: Option<VariableId>,
    ) -> Self {
        Self::from_transform(Modify {
            op,
            collection: collection.into(),
            input,
            key,
            ignore_errors,
            old,
            new,
        })
    }
}

/// Replaces a partial document by the full stored document.
pub struct Materialize {
    collection: String,
    input: VariableId,
    out: VariableId,
    fetched: u64,
}

impl RowTransform for Materialize {
    fn kind(&self) -> &'static str {
        "Materialize"
    }

    fn process(&mut self, rows: Vec<Row>, out: &mut VecDeque<Row>, ctx: &ExecContext) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        ctx.check_fault(points::MATERIALIZE_FETCH)?;
        for mut row in rows {
            let partial = row.get(self.input).unwrap_or(&NULL);
            let key = document_key(partial)
                .ok_or_else(|| AqlError::DocumentKeyBad("partial document has no _key".into()))?
                .to_owned();
            let document = ctx
                .txn()
                .fetch(&self.collection, &key)?
                .ok_or_else(|| AqlError::DocumentNotFound(format!("{}/{key}", self.collection)))?;
            self.fetched += 1;
            row.set(self.out, document);
            out.push_back(row);
        }
        Ok(())
    }

    // Skipped rows are never fetched.
    fn skips_through(&self) -> bool {
        true
    }

    fn documents_fetched(&self) -> u64 {
        self.fetched
    }
}

/// Materialize node.
pub type MaterializeBlock = TransformBlock<Materialize>;

impl TransformBlock<Materialize> {
    /// Block fetching `collection` documents for the partial documents in `input`.
    pub fn new(collection: impl Into<String>, input: VariableId, out: VariableId) -> Self {
        Self::from_transform(Materialize {
            collection: collection.into(),
            input,
            out,
            fetched: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::block::{BlockCall, ExecutionBlock, Step, Upstream};
    use crate::exec::testing;
    use crate::query::metadata::{CollectionInfo, IndexDescriptor, IndexKind};
    use crate::storage::Storage;
    use serde_json::json;

    fn users() -> crate::storage::InMemoryStorage {
        testing::storage(vec![(
            CollectionInfo::new("users", 0)
                .with_index(IndexDescriptor::new("by_mail", IndexKind::Sorted, &["mail"]).unique()),
            vec![json!({"_key": "a", "mail": "a@x"}), json!({"_key": "b", "mail": "b@x"})],
        )])
    }

    fn run(block: &mut ModifyBlock, rows: Vec<Row>, ctx: &ExecContext) -> Result<Vec<Row>> {
        match block.step(BlockCall::Get(100), Some(Upstream::Rows { rows, done: true }), ctx)? {
            Step::Rows { rows, .. } => Ok(rows),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn insert_binds_new_and_counts() {
        let storage = users();
        let ctx = testing::context(&storage);
        let mut block = ModifyBlock::new(
            ModifyOp::Insert,
            "users",
            VariableId(0),
            None,
            false,
            None,
            Some(VariableId(1)),
        );
        let rows = run(
            &mut block,
            vec![Row::new().with(VariableId(0), json!({"_key": "c", "mail": "c@x"}))],
            &ctx,
        )
        .expect("insert");
        assert_eq!(rows[0].get(VariableId(1)).and_then(|d| d.get("_key")), Some(&json!("c")));
        assert_eq!(ctx.summary().lock().written, 1);
    }

    #[test]
    fn ignored_errors_are_recorded_and_rows_dropped() {
        let storage = users();
        let ctx = testing::context(&storage);
        let mut block = ModifyBlock::new(ModifyOp::Remove, "users", VariableId(0), None, true, None, None);
        let rows = run(
            &mut block,
            vec![
                Row::new().with(VariableId(0), json!("a")),
                Row::new().with(VariableId(0), json!("missing")),
                Row::new().with(VariableId(0), json!({"_key": "b"})),
            ],
            &ctx,
        )
        .expect("remove");
        assert_eq!(rows.len(), 2);
        let summary = ctx.summary().lock().clone();
        assert_eq!((summary.written, summary.ignored), (2, 1));
        assert_eq!(summary.errors[0].code, 1202);
    }

    #[test]
    fn errors_abort_without_ignore() {
        let storage = users();
        let ctx = testing::context(&storage);
        let mut block = ModifyBlock::new(ModifyOp::Insert, "users", VariableId(0), None, false, None, None);
        let err = run(
            &mut block,
            vec![Row::new().with(VariableId(0), json!({"mail": "a@x"}))],
            &ctx,
        )
        .expect_err("unique violation");
        assert_eq!(err.code(), 1210);
    }

    #[test]
    fn apply_fault_is_never_ignored() {
        let storage = users();
        let ctx = testing::context(&storage);
        ctx.faults().arm(points::MODIFICATION_APPLY);
        let mut block = ModifyBlock::new(ModifyOp::Remove, "users", VariableId(0), None, true, None, None);
        let err = run(&mut block, vec![Row::new().with(VariableId(0), json!("a"))], &ctx)
            .expect_err("fault");
        assert_eq!(err.code(), 22);
    }

    #[test]
    fn update_with_key_variable_merges() {
        let storage = users();
        let ctx = testing::context(&storage);
        let mut block = ModifyBlock::new(
            ModifyOp::Update,
            "users",
            VariableId(0),
            Some(VariableId(1)),
            false,
            Some(VariableId(2)),
            Some(VariableId(3)),
        );
        let rows = run(
            &mut block,
            vec![Row::new()
                .with(VariableId(0), json!({"age": 3}))
                .with(VariableId(1), json!("a"))],
            &ctx,
        )
        .expect("update");
        assert_eq!(rows[0].get(VariableId(2)), Some(&json!({"_key": "a", "mail": "a@x"})));
        assert_eq!(
            rows[0].get(VariableId(3)),
            Some(&json!({"_key": "a", "mail": "a@x", "age": 3}))
        );
    }

    #[test]
    fn materialize_fetches_full_documents() {
        let storage = users();
        let ctx = testing::context(&storage);
        let mut block = MaterializeBlock::new("users", VariableId(0), VariableId(1));
        let step = block
            .step(
                BlockCall::Get(10),
                Some(Upstream::Rows {
                    rows: vec![Row::new().with(VariableId(0), json!({"_key": "b"}))],
                    done: true,
                }),
                &ctx,
            )
            .expect("materialize");
        match step {
            Step::Rows { rows, .. } => {
                assert_eq!(rows[0].get(VariableId(1)), Some(&json!({"_key": "b", "mail": "b@x"})));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(block.documents_fetched(), 1);
        assert_eq!(storage.stats().documents_fetched, 1);
    }
}
