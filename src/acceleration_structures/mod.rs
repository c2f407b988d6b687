//! Build, update and compaction lifecycle shared by both acceleration levels.
//!
//! Both [`GeometryAccelerationStructure`] and [`InstanceAccelerationStructure`]
//! drive the same state machine:
//!
//! ```text
//! Unbuilt -> ReadyToBuild -> Built -> ReadyToCompact -> Compacted -> CompactedOnly
//!              (prepare)    (rebuild)  (prepare_for_     (compact)    (remove_
//!                                       compact)                       uncompacted)
//! ```
//!
//! `update` re-enters the current ready state in place; any structural
//! mutation falls back to `Unbuilt`.
//!
//! [`GeometryAccelerationStructure`]: geometry_accel::GeometryAccelerationStructure
//! [`InstanceAccelerationStructure`]: instance_accel::InstanceAccelerationStructure

pub mod geometry_accel;
pub mod instance_accel;

use std::sync::Arc;

use crate::{
    device::{
        AccelBuildOptions, BufferPlacement, BufferView, BuildInput, BuildOperation, DeviceBackend,
        EventHandle, MemoryRequirements, Stream, TraversableHandle,
    },
    error::{Error, Result},
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BuildState {
    Unbuilt,
    ReadyToBuild,
    Built,
    ReadyToCompact,
    Compacted,
    CompactedOnly,
}

impl BuildState {
    fn is_ready(self) -> bool {
        matches!(
            self,
            BuildState::Built
                | BuildState::ReadyToCompact
                | BuildState::Compacted
                | BuildState::CompactedOnly
        )
    }

    fn compacted_available(self) -> bool {
        matches!(self, BuildState::Compacted | BuildState::CompactedOnly)
    }
}

/// Device-side bookkeeping common to both acceleration levels: the state
/// machine, configuration flags, the traversable handles, the completion
/// event and the compacted-size readback slot.
pub(crate) struct AccelState {
    backend: Arc<dyn DeviceBackend>,
    state: BuildState,
    prefer_fast_trace: bool,
    allow_update: bool,
    allow_compaction: bool,
    requirements: Option<MemoryRequirements>,
    handle: TraversableHandle,
    compacted_handle: TraversableHandle,
    accel_buffer: Option<BufferView>,
    compacted_buffer: Option<BufferView>,
    finish_event: EventHandle,
    compacted_size_slot: BufferView,
    compacted_size: u64,
}

impl AccelState {
    pub(crate) fn new(
        backend: Arc<dyn DeviceBackend>,
        placement: BufferPlacement,
        label: &str,
    ) -> Result<Self> {
        let finish_event = backend.create_event()?;
        let compacted_size_slot =
            match backend.allocate(std::mem::size_of::<u64>() as u64, placement, label) {
                Ok(slot) => slot,
                Err(e) => {
                    backend.destroy_event(finish_event);
                    return Err(e.into());
                }
            };
        Ok(Self {
            backend,
            state: BuildState::Unbuilt,
            prefer_fast_trace: true,
            allow_update: false,
            allow_compaction: false,
            requirements: None,
            handle: TraversableHandle::NULL,
            compacted_handle: TraversableHandle::NULL,
            accel_buffer: None,
            compacted_buffer: None,
            finish_event,
            compacted_size_slot,
            compacted_size: 0,
        })
    }

    pub(crate) fn set_configuration(
        &mut self,
        prefer_fast_trace: bool,
        allow_update: bool,
        allow_compaction: bool,
    ) {
        self.prefer_fast_trace = prefer_fast_trace;
        self.allow_update = allow_update;
        self.allow_compaction = allow_compaction;
    }

    fn build_options(&self, operation: BuildOperation) -> AccelBuildOptions {
        AccelBuildOptions {
            prefer_fast_trace: self.prefer_fast_trace,
            allow_update: self.allow_update,
            allow_compaction: self.allow_compaction,
            operation,
        }
    }

    /// A child was added or removed: the memory requirement is void and only
    /// a full `prepare_for_build` + `rebuild` can make the structure ready
    /// again.
    pub(crate) fn mark_structural_change(&mut self) {
        self.state = BuildState::Unbuilt;
        self.requirements = None;
        self.handle = TraversableHandle::NULL;
        self.compacted_handle = TraversableHandle::NULL;
        self.accel_buffer = None;
        self.compacted_buffer = None;
    }

    pub(crate) fn query_memory_usage(&mut self, inputs: &[BuildInput]) -> Result<MemoryRequirements> {
        let requirements = self
            .backend
            .compute_accel_memory_usage(&self.build_options(BuildOperation::Build), inputs)?;
        self.requirements = Some(requirements);
        self.state = BuildState::ReadyToBuild;
        Ok(requirements)
    }

    pub(crate) fn requirements(&self) -> Option<MemoryRequirements> {
        self.requirements
    }

    pub(crate) fn rebuild(
        &mut self,
        stream: Stream,
        inputs: &[BuildInput],
        accel_buffer: BufferView,
        scratch_buffer: BufferView,
    ) -> Result<TraversableHandle> {
        let requirements = self.requirements.ok_or_else(|| {
            Error::precondition("prepare_for_build has not been called since the last change")
        })?;
        check_size("acceleration structure", accel_buffer, requirements.accel_size)?;
        check_size("build scratch", scratch_buffer, requirements.scratch_size)?;

        if self.state.compacted_available() {
            log::warn!("rebuild discards the compacted acceleration structure");
        }
        let handle = self.backend.build_accel(
            stream,
            &self.build_options(BuildOperation::Build),
            inputs,
            accel_buffer,
            scratch_buffer,
            Some(self.compacted_size_slot.ptr),
        )?;
        self.backend.record_event(stream, self.finish_event)?;

        self.handle = handle;
        self.accel_buffer = Some(accel_buffer);
        // a fresh build supersedes any previous compaction
        self.compacted_handle = TraversableHandle::NULL;
        self.compacted_buffer = None;
        self.state = BuildState::Built;
        Ok(handle)
    }

    /// Block until the build that emitted the compacted size has completed,
    /// then read it back. The sole synchronous wait in the crate.
    pub(crate) fn prepare_for_compact(&mut self) -> Result<u64> {
        if !self.allow_compaction {
            return Err(Error::precondition(
                "compaction was not requested in the configuration",
            ));
        }
        match self.state {
            BuildState::Built => {
                self.backend.wait_event(self.finish_event)?;
                self.compacted_size = self.backend.read_device_u64(self.compacted_size_slot.ptr)?;
                self.state = BuildState::ReadyToCompact;
                Ok(self.compacted_size)
            }
            BuildState::ReadyToCompact => Ok(self.compacted_size),
            _ => Err(Error::precondition(
                "no build has completed on this acceleration structure",
            )),
        }
    }

    pub(crate) fn compact(
        &mut self,
        stream: Stream,
        compacted_buffer: BufferView,
    ) -> Result<TraversableHandle> {
        if self.state != BuildState::ReadyToCompact {
            return Err(Error::precondition(
                "prepare_for_compact has not been called since the last build",
            ));
        }
        check_size("compacted buffer", compacted_buffer, self.compacted_size)?;

        let handle = self
            .backend
            .compact_accel(stream, self.handle, compacted_buffer)?;
        self.backend.record_event(stream, self.finish_event)?;

        self.compacted_handle = handle;
        self.compacted_buffer = Some(compacted_buffer);
        self.state = BuildState::Compacted;
        Ok(handle)
    }

    /// Forget the pre-compaction buffer and handle. The caller must not free
    /// the uncompacted buffer before the compaction copy has completed on
    /// its stream.
    pub(crate) fn remove_uncompacted(&mut self) -> Result<()> {
        if self.state != BuildState::Compacted {
            return Err(Error::precondition(
                "no compacted version is available to replace the uncompacted one",
            ));
        }
        self.handle = TraversableHandle::NULL;
        self.accel_buffer = None;
        self.state = BuildState::CompactedOnly;
        Ok(())
    }

    /// In-place refresh over the buffer of the preferred (compacted if
    /// available) version.
    pub(crate) fn update(
        &mut self,
        stream: Stream,
        inputs: &[BuildInput],
        scratch_buffer: BufferView,
    ) -> Result<TraversableHandle> {
        if !self.allow_update {
            return Err(Error::precondition(
                "update was not allowed in the configuration",
            ));
        }
        if !self.state.is_ready() {
            return Err(Error::precondition(
                "update requires a completed build with no structural change since",
            ));
        }
        let requirements = self.requirements.ok_or_else(|| {
            Error::precondition("prepare_for_build has not been called since the last change")
        })?;
        check_size("update scratch", scratch_buffer, requirements.update_scratch_size)?;

        let dest = if self.state.compacted_available() {
            self.compacted_buffer
        } else {
            self.accel_buffer
        };
        let Some(dest) = dest else {
            debug_assert!(false, "ready state without a destination buffer");
            return Err(Error::HandleNotReady);
        };

        let handle = self.backend.build_accel(
            stream,
            &self.build_options(BuildOperation::Update),
            inputs,
            dest,
            scratch_buffer,
            Some(self.compacted_size_slot.ptr),
        )?;
        self.backend.record_event(stream, self.finish_event)?;

        if self.state.compacted_available() {
            self.compacted_handle = handle;
        } else {
            self.handle = handle;
        }
        Ok(handle)
    }

    pub(crate) fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// The traversable handle to launch with, preferring the compacted one.
    pub(crate) fn handle(&self) -> Result<TraversableHandle> {
        match self.state {
            BuildState::Compacted | BuildState::CompactedOnly => Ok(self.compacted_handle),
            BuildState::Built | BuildState::ReadyToCompact => Ok(self.handle),
            BuildState::Unbuilt | BuildState::ReadyToBuild => Err(Error::HandleNotReady),
        }
    }
}

impl Drop for AccelState {
    fn drop(&mut self) {
        self.backend.deallocate(self.compacted_size_slot);
        self.backend.destroy_event(self.finish_event);
    }
}

fn check_size(what: &'static str, buffer: BufferView, required: u64) -> Result<()> {
    if buffer.size < required {
        return Err(Error::BufferTooSmall {
            what,
            size: buffer.size,
            required,
        });
    }
    Ok(())
}
