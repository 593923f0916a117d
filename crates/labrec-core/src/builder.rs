use crate::error::RecordError;
use crate::feed::{FeedPublisher, LiveFeed};
use crate::index::{IndexAllocator, RecordGroup, RecordGroupInd, RecordIndex, RecordKey};
use crate::schema::{Category, RecordSchema, TableSchema};
use crate::table::{CategoryTable, GroupTables};
use crate::value::ValueMap;
use tracing::{debug, info, warn};

struct PendingGroup {
    group: RecordGroup,
    data: Option<CategoryTable>,
    params: CategoryTable,
    metadata: CategoryTable,
}

/// Accumulates one producer's output into the data, procedure-parameter and
/// metadata tables of the current record group.
///
/// Column sets are fixed for the builder's lifetime. They are either declared
/// up front with [`CategoryTableBuilder::with_schema`] or established by the
/// first `begin_record` (parameters and metadata) and the first `add_sample`
/// (data); every later call must offer exactly the same keys.
pub struct CategoryTableBuilder {
    allocator: IndexAllocator,
    data_schema: Option<TableSchema>,
    params_schema: Option<TableSchema>,
    metadata_schema: Option<TableSchema>,
    pending: Option<PendingGroup>,
    feed: FeedPublisher,
}

impl CategoryTableBuilder {
    pub fn new(allocator: IndexAllocator) -> Self {
        Self {
            allocator,
            data_schema: None,
            params_schema: None,
            metadata_schema: None,
            pending: None,
            feed: FeedPublisher::default(),
        }
    }

    pub fn with_schema(allocator: IndexAllocator, schema: RecordSchema) -> Self {
        Self {
            data_schema: Some(schema.data),
            params_schema: Some(schema.params),
            metadata_schema: Some(schema.metadata),
            ..Self::new(allocator)
        }
    }

    pub fn subscribe(&mut self, capacity: usize) -> LiveFeed {
        self.feed.subscribe(capacity)
    }

    /// All three column sets, once each has been declared or established.
    pub fn schema(&self) -> Option<RecordSchema> {
        Some(RecordSchema {
            data: self.data_schema.clone()?,
            params: self.params_schema.clone()?,
            metadata: self.metadata_schema.clone()?,
        })
    }

    pub fn current_group(&self) -> Option<RecordGroup> {
        self.pending.as_ref().map(|pending| pending.group)
    }

    pub fn current_record(&self) -> Option<RecordKey> {
        self.allocator.current_record()
    }

    pub fn allocator(&self) -> &IndexAllocator {
        &self.allocator
    }

    pub fn begin_record(
        &mut self,
        params: &ValueMap,
        metadata: &ValueMap,
    ) -> Result<RecordGroupInd, RecordError> {
        let params_schema = resolve_schema(&self.params_schema, Category::ProcParams, params)?;
        let metadata_schema =
            resolve_schema(&self.metadata_schema, Category::Metadata, metadata)?;

        if self.pending.is_none() {
            let group = self.allocator.next_group();
            debug!(event = "record_group_opened", group);
            self.pending = Some(PendingGroup {
                group,
                data: self.data_schema.clone().map(CategoryTable::new),
                params: CategoryTable::new(params_schema.clone()),
                metadata: CategoryTable::new(metadata_schema.clone()),
            });
        }
        let group_ind = self.allocator.next_record()?;

        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| RecordError::sequencing("record group vanished while opening"))?;
        let key = RecordKey {
            group: pending.group,
            group_ind,
        };
        pending.params.push(key, None, params);
        pending.metadata.push(key, None, metadata);

        self.params_schema = Some(params_schema);
        self.metadata_schema = Some(metadata_schema);
        Ok(group_ind)
    }

    pub fn add_sample(&mut self, data: &ValueMap) -> Result<RecordIndex, RecordError> {
        let key = match (&self.pending, self.allocator.current_record()) {
            (Some(_), Some(key)) => key,
            _ => {
                return Err(RecordError::sequencing(
                    "add_sample called before begin_record in the current record group",
                ))
            }
        };
        let data_schema = resolve_schema(&self.data_schema, Category::Data, data)?;
        let row = self.allocator.next_row()?;

        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| RecordError::sequencing("record group vanished while sampling"))?;
        pending
            .data
            .get_or_insert_with(|| CategoryTable::new(data_schema.clone()))
            .push(key, Some(row), data);
        self.data_schema = Some(data_schema);

        let index = RecordIndex {
            group: key.group,
            group_ind: key.group_ind,
            row,
        };
        self.feed.publish(index, data);
        Ok(index)
    }

    /// Hands the finished group's tables to the caller and resets the buffers.
    pub fn end_group(&mut self) -> Result<GroupTables, RecordError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| RecordError::sequencing("end_group called with no open record group"))?;
        self.allocator.close_group();

        let data = pending.data.unwrap_or_else(|| {
            CategoryTable::new(self.data_schema.clone().unwrap_or(TableSchema {
                category: Category::Data,
                columns: Vec::new(),
            }))
        });
        let tables = GroupTables {
            group: pending.group,
            data,
            params: pending.params,
            metadata: pending.metadata,
        };
        info!(
            event = "record_group_closed",
            group = tables.group,
            records = tables.record_count(),
            samples = tables.sample_count()
        );
        Ok(tables)
    }

    /// Drops an aborted group without handing anything downstream. The group
    /// number stays consumed.
    pub fn discard_group(&mut self) -> Option<RecordGroup> {
        let pending = self.pending.take()?;
        self.allocator.close_group();
        warn!(
            event = "record_group_discarded",
            group = pending.group,
            records = pending.params.len(),
            samples = pending.data.as_ref().map_or(0, CategoryTable::len)
        );
        Some(pending.group)
    }
}

fn resolve_schema(
    established: &Option<TableSchema>,
    category: Category,
    values: &ValueMap,
) -> Result<TableSchema, RecordError> {
    match established {
        Some(schema) => {
            schema.check(values)?;
            Ok(schema.clone())
        }
        None => TableSchema::from_values(category, values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{value_map, CellValue};

    fn heater_params(voltage: f64) -> ValueMap {
        value_map([("voltage", voltage), ("sample_time", 2.0), ("sample_rate", 1.0)])
    }

    fn testbed_metadata() -> ValueMap {
        value_map([("sensor", "keysight-p9374a"), ("testbed", "cryostat-2")])
    }

    #[test]
    fn rows_are_contiguous_per_record_in_call_order() {
        let mut builder = CategoryTableBuilder::new(IndexAllocator::new());
        for (step, samples) in [3_u64, 1, 4].into_iter().enumerate() {
            let group_ind = builder
                .begin_record(&heater_params(step as f64), &testbed_metadata())
                .expect("begin record");
            assert_eq!(group_ind, step as u64);
            for expected_row in 0..samples {
                let index = builder
                    .add_sample(&value_map([("power", expected_row as f64)]))
                    .expect("add sample");
                assert_eq!(index.row, expected_row);
                assert_eq!(index.group_ind, step as u64);
            }
        }
        let tables = builder.end_group().expect("end group");
        let rows = tables
            .data
            .rows
            .iter()
            .map(|row| (row.group_ind, row.row.expect("data row index")))
            .collect::<Vec<_>>();
        assert_eq!(
            rows,
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (2, 0), (2, 1), (2, 2), (2, 3)]
        );
        assert_eq!(tables.params.len(), 3);
        assert_eq!(tables.metadata.len(), 3);
    }

    #[test]
    fn sample_before_record_is_a_sequencing_error() {
        let mut builder = CategoryTableBuilder::new(IndexAllocator::new());
        let err = builder
            .add_sample(&value_map([("power", 1.0)]))
            .expect_err("no record");
        assert!(matches!(err, RecordError::Sequencing(_)));
        assert!(matches!(
            builder.end_group(),
            Err(RecordError::Sequencing(_))
        ));

        builder
            .begin_record(&heater_params(1.0), &testbed_metadata())
            .expect("begin");
        builder.end_group().expect("end");
        let err = builder
            .add_sample(&value_map([("power", 1.0)]))
            .expect_err("group closed");
        assert!(matches!(err, RecordError::Sequencing(_)));
    }

    #[test]
    fn new_measurement_key_is_rejected_without_touching_buffers() {
        let mut builder = CategoryTableBuilder::new(IndexAllocator::new());
        builder
            .begin_record(&heater_params(5.0), &testbed_metadata())
            .expect("begin");
        builder
            .add_sample(&value_map([("power", 1.0)]))
            .expect("first sample");
        let err = builder
            .add_sample(&value_map([("power", 1.0), ("frequency", 2.4e9)]))
            .expect_err("schema change");
        match err {
            RecordError::Schema { category, diff } => {
                assert_eq!(category, Category::Data);
                assert_eq!(diff.unexpected, vec!["frequency".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let index = builder
            .add_sample(&value_map([("power", 2.0)]))
            .expect("retry with fixed schema");
        assert_eq!(index.row, 1);

        let err = builder
            .begin_record(&value_map([("current", 0.1)]), &testbed_metadata())
            .expect_err("params schema change");
        assert!(matches!(
            err,
            RecordError::Schema {
                category: Category::ProcParams,
                ..
            }
        ));
        assert_eq!(builder.end_group().expect("end").data.len(), 2);
    }

    #[test]
    fn reserved_prefix_in_data_is_a_naming_error() {
        let mut builder = CategoryTableBuilder::new(IndexAllocator::new());
        builder
            .begin_record(&heater_params(5.0), &testbed_metadata())
            .expect("begin");
        let err = builder
            .add_sample(&value_map([("proc.voltage", 1.0)]))
            .expect_err("reserved");
        assert!(matches!(err, RecordError::Naming { .. }));

        let err = builder
            .begin_record(&value_map([("meta.x", 1.0)]), &testbed_metadata())
            .expect_err("reserved");
        assert!(matches!(err, RecordError::Naming { .. }));
    }

    #[test]
    fn declared_schema_is_enforced_from_the_first_call() {
        let schema = RecordSchema::new(
            vec!["time", "power"],
            vec!["voltage"],
            Vec::<&str>::new(),
        )
        .expect("schema");
        let mut builder = CategoryTableBuilder::with_schema(IndexAllocator::new(), schema);
        builder
            .begin_record(&value_map([("voltage", 5.0)]), &ValueMap::new())
            .expect("begin");
        let err = builder
            .add_sample(&value_map([("power", 1.0)]))
            .expect_err("time missing");
        match err {
            RecordError::Schema { diff, .. } => assert_eq!(diff.missing, vec!["time"]),
            other => panic!("unexpected error: {other:?}"),
        }
        builder
            .add_sample(&value_map([
                ("time", CellValue::Float(0.0)),
                ("power", CellValue::Float(-12.5)),
            ]))
            .expect("sample");
        let tables = builder.end_group().expect("end");
        assert_eq!(tables.data.columns(), ["time", "power"]);
        assert_eq!(tables.metadata.len(), 1);
        assert!(tables.metadata.columns().is_empty());
    }

    #[test]
    fn discarded_group_consumes_its_number() {
        let mut builder = CategoryTableBuilder::new(IndexAllocator::resume(Some(3)));
        builder
            .begin_record(&heater_params(5.0), &testbed_metadata())
            .expect("begin");
        builder
            .add_sample(&value_map([("power", 1.0)]))
            .expect("sample");
        assert_eq!(builder.discard_group(), Some(4));
        assert_eq!(builder.discard_group(), None);

        builder
            .begin_record(&heater_params(5.0), &testbed_metadata())
            .expect("begin");
        assert_eq!(builder.end_group().expect("end").group, 5);
    }

    #[test]
    fn live_feed_sees_every_appended_row() {
        let mut builder = CategoryTableBuilder::new(IndexAllocator::new());
        let feed = builder.subscribe(16);
        builder
            .begin_record(&heater_params(5.0), &testbed_metadata())
            .expect("begin");
        for step in 0..3 {
            builder
                .add_sample(&value_map([("power", step as f64)]))
                .expect("sample");
        }
        let seen = feed.drain();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].index.row, 2);
        assert_eq!(seen[2].values.get("power"), Some(&CellValue::Float(2.0)));
    }
}
