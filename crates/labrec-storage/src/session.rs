use crate::config::RecorderConfig;
use crate::error::RecorderError;
use crate::recorder::{Recorder, ResumePoint, WriteReport};
use labrec_core::{
    CategoryTableBuilder, GroupTables, IndexAllocator, LiveFeed, RecordError, RecordGroup,
    RecordGroupInd, RecordIndex, RecordSchema, ValueMap,
};
use tracing::warn;

/// Producer-facing handle: one recorder plus the builder feeding it.
///
/// Groups are numbered from where the target left off, so appending to an
/// existing target never reuses a persisted group number.
pub struct ArchiveSession {
    recorder: Recorder,
    builder: CategoryTableBuilder,
    resume: ResumePoint,
    unwritten: Option<GroupTables>,
}

impl ArchiveSession {
    pub fn open(config: RecorderConfig) -> Result<Self, RecorderError> {
        let mut recorder = Recorder::new(config);
        let resume = recorder.open()?;
        let builder = CategoryTableBuilder::new(IndexAllocator::resume(resume.last_group));
        Ok(Self {
            recorder,
            builder,
            resume,
            unwritten: None,
        })
    }

    /// Like [`ArchiveSession::open`], with column sets declared up front.
    pub fn open_with_schema(
        config: RecorderConfig,
        schema: RecordSchema,
    ) -> Result<Self, RecorderError> {
        let mut session = Self::open(config)?;
        session.builder = CategoryTableBuilder::with_schema(
            IndexAllocator::resume(session.resume.last_group),
            schema,
        );
        Ok(session)
    }

    pub fn resume_point(&self) -> ResumePoint {
        self.resume
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn current_group(&self) -> Option<RecordGroup> {
        self.builder.current_group()
    }

    pub fn subscribe(&mut self, capacity: usize) -> LiveFeed {
        self.builder.subscribe(capacity)
    }

    pub fn begin_record(
        &mut self,
        params: &ValueMap,
        metadata: &ValueMap,
    ) -> Result<RecordGroupInd, RecorderError> {
        Ok(self.builder.begin_record(params, metadata)?)
    }

    pub fn add_sample(&mut self, data: &ValueMap) -> Result<RecordIndex, RecorderError> {
        Ok(self.builder.add_sample(data)?)
    }

    /// Closes the current group and persists it. When the write fails the
    /// group is kept and can be written again with [`Self::retry_unwritten`].
    pub fn end_group(&mut self) -> Result<WriteReport, RecorderError> {
        if let Some(pending) = &self.unwritten {
            return Err(RecordError::sequencing(format!(
                "group {} is still unwritten; retry or abort it first",
                pending.group
            ))
            .into());
        }
        let tables = self.builder.end_group()?;
        match self.recorder.write(&tables) {
            Ok(report) => Ok(report),
            Err(err) => {
                self.unwritten = Some(tables);
                Err(err)
            }
        }
    }

    pub fn retry_unwritten(&mut self) -> Result<Option<WriteReport>, RecorderError> {
        let Some(tables) = self.unwritten.take() else {
            return Ok(None);
        };
        match self.recorder.write(&tables) {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                self.unwritten = Some(tables);
                Err(err)
            }
        }
    }

    /// Drops the group being built, or a group whose write failed.
    pub fn abort_group(&mut self) -> Option<RecordGroup> {
        if let Some(tables) = self.unwritten.take() {
            warn!(
                event = "record_group_abandoned",
                group = tables.group,
                samples = tables.sample_count()
            );
            return Some(tables.group);
        }
        self.builder.discard_group()
    }

    /// Discards any group still in memory and releases the target.
    pub fn close(mut self) -> Result<(), RecorderError> {
        self.abort_group();
        self.recorder.close()
    }
}
