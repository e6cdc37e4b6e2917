//! Frame scheduling across multiple frames in flight.
//!
//! Every swapchain image owns one [`FrameSlot`]: a fence, a command buffer,
//! a mapped uniform buffer and two semaphores. Each loop iteration drives one
//! slot through
//!
//! ```text
//! Idle -> Acquiring -> Recording -> Submitted -> Presenting -> Idle
//! ```
//!
//! while up to `image_count` slots may still be executing on the GPU. The
//! CPU blocks only on the fence of the slot it is about to reuse, so a
//! command buffer or uniform buffer is never rewritten while the GPU can
//! still read it.

use std::mem;
use std::ops::ControlFlow;

use log::{info, trace};

use crate::camera::UniformBufferObject;
use crate::error::RenderError;
use crate::mesh::Mesh;

/// GPU capabilities consumed by the scheduler.
///
/// `Slot` bundles the per-image resources (fence, command buffer, uniform
/// buffer and its mapping, descriptor set, render-done semaphore).
pub trait FrameBackend {
    type Semaphore;
    type Slot;

    /// Number of presentable images, and therefore of frame slots.
    fn image_count(&self) -> usize;

    fn create_semaphore(&mut self) -> Result<Self::Semaphore, RenderError>;
    fn destroy_semaphore(&mut self, semaphore: Self::Semaphore);

    /// Creates the resources for the slot bound to `image_index`. The fence
    /// starts signaled.
    fn create_slot(&mut self, image_index: usize) -> Result<Self::Slot, RenderError>;
    fn destroy_slot(&mut self, slot: Self::Slot);

    /// Uploads vertex and index data into GPU-visible buffers.
    fn import_mesh(&mut self, mesh: &Mesh) -> Result<(), RenderError>;

    /// Requests the next presentable image; `signal` is signaled once it is ready.
    fn acquire_next_image(&mut self, signal: &Self::Semaphore) -> Result<u32, RenderError>;

    /// Blocks until the last submission that used `slot` has completed.
    fn wait_for_slot(&mut self, slot: &Self::Slot) -> Result<(), RenderError>;

    fn write_uniform(
        &mut self,
        slot: &mut Self::Slot,
        ubo: &UniformBufferObject,
    ) -> Result<(), RenderError>;

    /// Re-encodes the slot's command buffer: one indexed strip draw over the imported mesh.
    fn record(
        &mut self,
        slot: &Self::Slot,
        image_index: u32,
        index_count: u32,
    ) -> Result<(), RenderError>;

    /// Submits the slot's command buffer after `wait`, signaling the slot's
    /// render-done semaphore and fence.
    fn submit(&mut self, slot: &Self::Slot, wait: &Self::Semaphore) -> Result<(), RenderError>;

    /// Queues `image_index` for presentation after the slot's render-done semaphore.
    fn present(&mut self, slot: &Self::Slot, image_index: u32) -> Result<(), RenderError>;

    fn wait_idle(&mut self) -> Result<(), RenderError>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presenting,
}

impl SlotState {
    fn next(self) -> Self {
        match self {
            Self::Idle => Self::Acquiring,
            Self::Acquiring => Self::Recording,
            Self::Recording => Self::Submitted,
            Self::Submitted => Self::Presenting,
            Self::Presenting => Self::Idle,
        }
    }

    /// Submitted work may still be executing on the GPU.
    fn is_in_flight(self) -> bool {
        matches!(self, Self::Submitted | Self::Presenting)
    }
}

struct FrameSlot<B: FrameBackend> {
    resources: B::Slot,
    /// Index into `FrameScheduler::acquire_semaphores`.
    acquire: usize,
    state: SlotState,
}

impl<B: FrameBackend> FrameSlot<B> {
    fn advance(&mut self, index: usize, next: SlotState) {
        debug_assert_eq!(self.state.next(), next, "illegal transition on slot {index}");
        trace!("Slot {}: {:?} -> {:?}", index, self.state, next);
        self.state = next;
    }
}

/// Owns the backend and one [`FrameSlot`] per swapchain image.
pub struct FrameScheduler<B: FrameBackend> {
    backend: B,
    slots: Vec<FrameSlot<B>>,
    // One more than there are slots: the image index is unknown until after
    // the acquire, so the spare is swapped into the acquired slot afterwards.
    acquire_semaphores: Vec<B::Semaphore>,
    spare_acquire: usize,
    index_count: Option<u32>,
    frame_count: u64,
}

impl<B: FrameBackend> FrameScheduler<B> {
    /// Creates one slot per swapchain image plus the acquire semaphores.
    ///
    /// On failure everything created so far is released through `Drop`.
    pub fn new(backend: B) -> Result<Self, RenderError> {
        let image_count = backend.image_count();
        let mut scheduler = Self {
            backend,
            slots: Vec::with_capacity(image_count),
            acquire_semaphores: Vec::with_capacity(image_count + 1),
            spare_acquire: image_count,
            index_count: None,
            frame_count: 0,
        };

        for image_index in 0..image_count {
            let semaphore = scheduler.backend.create_semaphore()?;
            scheduler.acquire_semaphores.push(semaphore);
            let resources = scheduler.backend.create_slot(image_index)?;
            scheduler.slots.push(FrameSlot {
                resources,
                acquire: image_index,
                state: SlotState::Idle,
            });
        }
        let spare = scheduler.backend.create_semaphore()?;
        scheduler.acquire_semaphores.push(spare);

        Ok(scheduler)
    }

    /// One-time upload of the mesh. Must precede the first frame.
    pub fn import_mesh(&mut self, mesh: &Mesh) -> Result<(), RenderError> {
        if self.index_count.is_some() {
            return Err(RenderError::MeshAlreadyImported);
        }
        self.backend.import_mesh(mesh)?;
        self.index_count = Some(mesh.indices().len() as u32);
        info!(
            "Imported mesh ({} vertices, {} strip indices).",
            mesh.vertices().len(),
            mesh.indices().len()
        );
        Ok(())
    }

    /// Runs frames until `poll` breaks, then waits for the GPU to go idle.
    ///
    /// `poll` is called once at the top of every iteration; it handles
    /// pending input and returns the camera snapshot for the frame.
    pub fn run<F>(&mut self, mut poll: F) -> Result<(), RenderError>
    where
        F: FnMut() -> ControlFlow<(), UniformBufferObject>,
    {
        info!("Entering frame loop ({} frame slots).", self.slots.len());
        while let ControlFlow::Continue(ubo) = poll() {
            self.draw_frame(&ubo)?;
        }
        self.backend.wait_idle()?;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Presenting {
                slot.advance(index, SlotState::Idle);
            }
        }
        info!("Frame loop finished after {} frames.", self.frame_count);
        Ok(())
    }

    /// Acquire, wait for the slot, update its uniform, record, submit, present.
    pub fn draw_frame(&mut self, ubo: &UniformBufferObject) -> Result<(), RenderError> {
        let index_count = self.index_count.ok_or(RenderError::MeshNotImported)?;

        let image_index = self
            .backend
            .acquire_next_image(&self.acquire_semaphores[self.spare_acquire])?;
        let slot_count = self.slots.len();
        let index = image_index as usize;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(RenderError::ImageIndexOutOfRange {
                index: image_index,
                slots: slot_count,
            })?;

        // The only CPU wait in the loop.
        self.backend.wait_for_slot(&slot.resources)?;
        if slot.state == SlotState::Presenting {
            slot.advance(index, SlotState::Idle);
        }
        mem::swap(&mut self.spare_acquire, &mut slot.acquire);
        slot.advance(index, SlotState::Acquiring);

        slot.advance(index, SlotState::Recording);
        self.backend.write_uniform(&mut slot.resources, ubo)?;
        self.backend.record(&slot.resources, image_index, index_count)?;

        self.backend
            .submit(&slot.resources, &self.acquire_semaphores[slot.acquire])?;
        slot.advance(index, SlotState::Submitted);

        self.backend.present(&slot.resources, image_index)?;
        slot.advance(index, SlotState::Presenting);

        self.frame_count += 1;
        trace!(
            "Frame {} on slot {} ({} in flight).",
            self.frame_count,
            index,
            self.in_flight()
        );
        Ok(())
    }

    /// Slots whose submitted work may still be executing.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_in_flight()).count()
    }
}

impl<B: FrameBackend> Drop for FrameScheduler<B> {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::error!("Failed to wait for the GPU before releasing frame slots: {}", e);
        }
        for slot in self.slots.drain(..).rev() {
            self.backend.destroy_slot(slot.resources);
        }
        for semaphore in self.acquire_semaphores.drain(..).rev() {
            self.backend.destroy_semaphore(semaphore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraSettings, CameraState};
    use crate::grid::Grid;
    use ash::vk;
    use rstest::rstest;
    use std::cell::RefCell;
    use std::collections::{HashSet, VecDeque};
    use std::rc::Rc;

    /// What the simulated GPU observed.
    #[derive(Default)]
    struct GpuLog {
        violations: Vec<String>,
        max_pending: usize,
        uniform_writes: Vec<(usize, UniformBufferObject)>,
        draws: Vec<(usize, u32, u32)>,
        presents: Vec<u32>,
        live_slots: usize,
        live_semaphores: usize,
        idle_waits: usize,
        blocking_waits: usize,
    }

    struct FakeSlot {
        id: usize,
    }

    /// GPU that completes work in submission order, and only when the CPU
    /// waits on a fence.
    struct FakeGpu {
        images: usize,
        acquire_order: Vec<u32>,
        acquires: usize,
        fences: Vec<bool>,
        pending: VecDeque<usize>,
        signaled: HashSet<usize>,
        next_semaphore: usize,
        imported: bool,
        fail_slot: Option<usize>,
        fail_semaphore: Option<usize>,
        log: Rc<RefCell<GpuLog>>,
    }

    impl FakeGpu {
        fn new(images: usize, acquire_order: Vec<u32>) -> (Self, Rc<RefCell<GpuLog>>) {
            let log = Rc::new(RefCell::new(GpuLog::default()));
            let gpu = Self {
                images,
                acquire_order,
                acquires: 0,
                fences: vec![true; images],
                pending: VecDeque::new(),
                signaled: HashSet::new(),
                next_semaphore: 0,
                imported: false,
                fail_slot: None,
                fail_semaphore: None,
                log: Rc::clone(&log),
            };
            (gpu, log)
        }

        /// Makes `create_slot` fail for `image_index`.
        fn failing_slot(mut self, image_index: usize) -> Self {
            self.fail_slot = Some(image_index);
            self
        }

        /// Makes the `nth` (1-based) `create_semaphore` call fail.
        fn failing_semaphore(mut self, nth: usize) -> Self {
            self.fail_semaphore = Some(nth);
            self
        }

        fn violation(&self, message: String) {
            self.log.borrow_mut().violations.push(message);
        }

        fn check_fence(&self, slot: &FakeSlot, what: &str) {
            if !self.fences[slot.id] {
                self.violation(format!("{what} on slot {} while the GPU still owns it", slot.id));
            }
        }
    }

    impl FrameBackend for FakeGpu {
        type Semaphore = usize;
        type Slot = FakeSlot;

        fn image_count(&self) -> usize {
            self.images
        }

        fn create_semaphore(&mut self) -> Result<usize, RenderError> {
            if self.fail_semaphore == Some(self.next_semaphore + 1) {
                return Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
            }
            self.next_semaphore += 1;
            self.log.borrow_mut().live_semaphores += 1;
            Ok(self.next_semaphore)
        }

        fn destroy_semaphore(&mut self, _semaphore: usize) {
            self.log.borrow_mut().live_semaphores -= 1;
        }

        fn create_slot(&mut self, image_index: usize) -> Result<FakeSlot, RenderError> {
            if self.fail_slot == Some(image_index) {
                return Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
            self.log.borrow_mut().live_slots += 1;
            Ok(FakeSlot { id: image_index })
        }

        fn destroy_slot(&mut self, slot: FakeSlot) {
            if !self.fences[slot.id] {
                self.violation(format!("slot {} destroyed while in flight", slot.id));
            }
            self.log.borrow_mut().live_slots -= 1;
        }

        fn import_mesh(&mut self, _mesh: &Mesh) -> Result<(), RenderError> {
            self.imported = true;
            Ok(())
        }

        fn acquire_next_image(&mut self, signal: &usize) -> Result<u32, RenderError> {
            if !self.signaled.insert(*signal) {
                self.violation(format!("acquire semaphore {signal} signaled twice"));
            }
            let image = self.acquire_order[self.acquires % self.acquire_order.len()];
            self.acquires += 1;
            Ok(image)
        }

        fn wait_for_slot(&mut self, slot: &FakeSlot) -> Result<(), RenderError> {
            if self.fences[slot.id] {
                return Ok(());
            }
            self.log.borrow_mut().blocking_waits += 1;
            while let Some(done) = self.pending.pop_front() {
                self.fences[done] = true;
                if done == slot.id {
                    break;
                }
            }
            Ok(())
        }

        fn write_uniform(
            &mut self,
            slot: &mut FakeSlot,
            ubo: &UniformBufferObject,
        ) -> Result<(), RenderError> {
            self.check_fence(slot, "uniform write");
            self.log.borrow_mut().uniform_writes.push((slot.id, *ubo));
            Ok(())
        }

        fn record(
            &mut self,
            slot: &FakeSlot,
            image_index: u32,
            index_count: u32,
        ) -> Result<(), RenderError> {
            self.check_fence(slot, "record");
            if !self.imported {
                self.violation("record before mesh import".to_string());
            }
            self.log
                .borrow_mut()
                .draws
                .push((slot.id, image_index, index_count));
            Ok(())
        }

        fn submit(&mut self, slot: &FakeSlot, wait: &usize) -> Result<(), RenderError> {
            self.check_fence(slot, "submit");
            if !self.signaled.remove(wait) {
                self.violation(format!("submit waits on unsignaled semaphore {wait}"));
            }
            self.fences[slot.id] = false;
            self.pending.push_back(slot.id);
            let pending = self.pending.len();
            let mut log = self.log.borrow_mut();
            log.max_pending = log.max_pending.max(pending);
            Ok(())
        }

        fn present(&mut self, _slot: &FakeSlot, image_index: u32) -> Result<(), RenderError> {
            self.log.borrow_mut().presents.push(image_index);
            Ok(())
        }

        fn wait_idle(&mut self) -> Result<(), RenderError> {
            while let Some(done) = self.pending.pop_front() {
                self.fences[done] = true;
            }
            self.log.borrow_mut().idle_waits += 1;
            Ok(())
        }
    }

    fn mesh() -> Mesh {
        Mesh::from_grid(Grid::parse("0 1 2\n3 4 5").unwrap()).unwrap()
    }

    fn camera() -> CameraState {
        CameraState::new(CameraSettings {
            aspect: 1.0,
            rotate_step: 5.0,
            zoom_factor: 1.1,
        })
    }

    #[test]
    fn drawing_requires_an_imported_mesh() {
        let (gpu, _log) = FakeGpu::new(2, vec![0, 1]);
        let mut scheduler = FrameScheduler::new(gpu).unwrap();
        let err = scheduler.draw_frame(&camera().uniform()).unwrap_err();
        assert!(matches!(err, RenderError::MeshNotImported));
    }

    #[test]
    fn mesh_is_imported_once() {
        let (gpu, _log) = FakeGpu::new(2, vec![0, 1]);
        let mut scheduler = FrameScheduler::new(gpu).unwrap();
        scheduler.import_mesh(&mesh()).unwrap();
        assert!(matches!(
            scheduler.import_mesh(&mesh()),
            Err(RenderError::MeshAlreadyImported)
        ));
    }

    #[test]
    fn slots_are_never_reused_before_their_fence() {
        let (gpu, log) = FakeGpu::new(3, vec![0, 1, 2]);
        let mut scheduler = FrameScheduler::new(gpu).unwrap();
        scheduler.import_mesh(&mesh()).unwrap();

        let ubo = camera().uniform();
        for _ in 0..10 {
            scheduler.draw_frame(&ubo).unwrap();
            assert!(scheduler.in_flight() <= 3);
        }

        let log = log.borrow();
        assert!(log.violations.is_empty(), "{:?}", log.violations);
        assert_eq!(log.max_pending, 3);
        // Frames 3..9 each had to wait on the slot used three frames earlier.
        assert_eq!(log.blocking_waits, 7);
        assert_eq!(log.draws.len(), 10);
        assert!(log.draws.iter().all(|&(slot, image, count)| {
            slot == image as usize && count == 11
        }));
        assert_eq!(log.presents, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn irregular_acquire_order_keeps_semaphores_paired() {
        let (gpu, log) = FakeGpu::new(3, vec![0, 0, 2, 1, 2, 2, 0]);
        let mut scheduler = FrameScheduler::new(gpu).unwrap();
        scheduler.import_mesh(&mesh()).unwrap();

        for _ in 0..14 {
            scheduler.draw_frame(&camera().uniform()).unwrap();
        }

        let log = log.borrow();
        assert!(log.violations.is_empty(), "{:?}", log.violations);
        assert!(log.max_pending <= 3);
    }

    #[test]
    fn out_of_range_image_is_an_error() {
        let (gpu, _log) = FakeGpu::new(2, vec![5]);
        let mut scheduler = FrameScheduler::new(gpu).unwrap();
        scheduler.import_mesh(&mesh()).unwrap();
        assert!(matches!(
            scheduler.draw_frame(&camera().uniform()),
            Err(RenderError::ImageIndexOutOfRange { index: 5, slots: 2 })
        ));
    }

    #[test]
    fn run_samples_camera_each_frame_and_drains_on_close() {
        let (gpu, log) = FakeGpu::new(2, vec![0, 1]);
        let mut scheduler = FrameScheduler::new(gpu).unwrap();
        scheduler.import_mesh(&mesh()).unwrap();

        let mut cam = camera();
        let mut iterations = 0;
        scheduler
            .run(|| {
                iterations += 1;
                if iterations > 4 {
                    return ControlFlow::Break(());
                }
                cam.zoom(1.0);
                ControlFlow::Continue(cam.uniform())
            })
            .unwrap();

        assert_eq!(scheduler.in_flight(), 0);
        let log = log.borrow();
        assert_eq!(log.idle_waits, 1);
        assert_eq!(log.uniform_writes.len(), 4);
        // The last write carries all four zoom steps.
        assert_eq!(log.uniform_writes[3].1, cam.uniform());
        assert_ne!(log.uniform_writes[0].1, log.uniform_writes[3].1);
    }

    #[test]
    fn drop_releases_every_slot_and_semaphore() {
        let (gpu, log) = FakeGpu::new(3, vec![0, 1, 2]);
        {
            let mut scheduler = FrameScheduler::new(gpu).unwrap();
            assert_eq!(log.borrow().live_slots, 3);
            assert_eq!(log.borrow().live_semaphores, 4);
            scheduler.import_mesh(&mesh()).unwrap();
            scheduler.draw_frame(&camera().uniform()).unwrap();
        }
        let log = log.borrow();
        assert_eq!(log.live_slots, 0);
        assert_eq!(log.live_semaphores, 0);
        assert!(log.violations.is_empty(), "{:?}", log.violations);
    }

    #[rstest]
    #[case::first_slot(FakeGpu::new(3, vec![0]).0.failing_slot(0))]
    #[case::last_slot(FakeGpu::new(3, vec![0]).0.failing_slot(2))]
    #[case::second_semaphore(FakeGpu::new(3, vec![0]).0.failing_semaphore(2))]
    #[case::spare_semaphore(FakeGpu::new(3, vec![0]).0.failing_semaphore(4))]
    fn failed_creation_releases_what_was_built(#[case] gpu: FakeGpu) {
        let log = Rc::clone(&gpu.log);
        assert!(matches!(
            FrameScheduler::new(gpu),
            Err(RenderError::Vulkan(_))
        ));

        let log = log.borrow();
        assert_eq!(log.live_slots, 0);
        assert_eq!(log.live_semaphores, 0);
        assert!(log.violations.is_empty(), "{:?}", log.violations);
    }
}
