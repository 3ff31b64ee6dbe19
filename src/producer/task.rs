//! Tasks producing tile content.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{CreateContext, TileProducer};
use crate::cache::{TileCache, TileCoord, TileId};
use crate::error::GraphError;
use crate::storage::Slot;
use crate::task::{Deadline, NodeId, Reason, Task, TaskGraph, TaskId, TaskState, TaskStatus};

// =============================================================================
// Create Tile Task
// =============================================================================

/// Produces the content of one tile into its slot.
///
/// The task acquires whatever its producer's layers need in `start` and
/// releases it in `stop`. Inputs are never held while the task is done:
/// becoming done stops the task, becoming pending because the data is needed
/// again starts it.
pub struct CreateTileTask {
    id: TaskId,
    tile: TileId,
    gpu: bool,
    owner: Weak<TileProducer>,
    cache: Weak<TileCache>,

    /// Slot written by `run`; replaced when an evicted task is reused
    slot: Mutex<Arc<Slot>>,

    graph: OnceLock<Weak<CreateTileTaskGraph>>,
    status: TaskStatus,

    /// Whether inputs are currently acquired
    started: Mutex<bool>,
}

impl CreateTileTask {
    pub(crate) fn new(
        owner: &TileProducer,
        coord: TileCoord,
        slot: Arc<Slot>,
        deadline: Deadline,
    ) -> Self {
        Self {
            id: TaskId::next(),
            tile: TileId::from_coord(owner.id(), coord),
            gpu: owner.is_gpu(),
            owner: owner.downgrade(),
            cache: Arc::downgrade(owner.cache()),
            slot: Mutex::new(slot),
            graph: OnceLock::new(),
            status: TaskStatus::new(deadline),
            started: Mutex::new(false),
        }
    }

    pub fn tile_id(&self) -> TileId {
        self.tile
    }

    pub fn coord(&self) -> TileCoord {
        self.tile.coord
    }

    pub fn slot(&self) -> Arc<Slot> {
        Arc::clone(&self.slot.lock())
    }

    pub(crate) fn set_slot(&self, slot: Arc<Slot>) {
        *self.slot.lock() = slot;
    }

    /// The graph this task is the result of, if any.
    pub fn graph(&self) -> Option<Arc<CreateTileTaskGraph>> {
        self.graph.get()?.upgrade()
    }

    /// Whether the task currently holds its inputs.
    pub fn is_started(&self) -> bool {
        *self.started.lock()
    }

    fn context<'a>(&self, graph: Option<&'a CreateTileTaskGraph>) -> CreateContext<'a> {
        CreateContext {
            coord: self.tile.coord,
            deadline: self.status.deadline(),
            task: self.id,
            graph,
        }
    }

    /// Acquires the task's inputs, unless already acquired.
    pub(crate) fn start(&self) {
        let mut started = self.started.lock();
        if *started {
            return;
        }
        *started = true;
        if let Some(owner) = self.owner.upgrade() {
            let graph = self.graph();
            owner.start_create_tile(&self.context(graph.as_deref()));
        }
    }

    /// Releases the inputs acquired by `start`, if any.
    pub(crate) fn stop(&self) {
        let mut started = self.started.lock();
        if !*started {
            return;
        }
        *started = false;
        if let Some(owner) = self.owner.upgrade() {
            let graph = self.graph();
            owner.stop_create_tile(&self.context(graph.as_deref()));
        }
    }
}

impl Task for CreateTileTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn deadline(&self) -> Deadline {
        self.status.deadline()
    }

    fn set_deadline(&self, deadline: Deadline) {
        self.status.set_deadline(deadline);
    }

    fn is_gpu_task(&self) -> bool {
        self.gpu
    }

    fn state(&self) -> TaskState {
        self.status.state()
    }

    fn set_state(&self, state: TaskState) {
        self.status.replace_state(state);
        match state {
            TaskState::Done => self.stop(),
            TaskState::Pending(Reason::DataNeeded) => self.start(),
            TaskState::Pending(_) => {}
        }
    }

    fn generation(&self) -> u64 {
        self.status.generation()
    }

    fn complete(&self, generation: u64) -> bool {
        if !self.status.complete(generation) {
            return false;
        }
        self.stop();
        true
    }

    fn init(&self) {
        self.start();
    }

    fn begin(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.begin_create_tile(&self.context(None));
        }
    }

    fn run(&self) -> bool {
        let Some(owner) = self.owner.upgrade() else {
            debug!(task = %self.id, tile = %self.tile, "Producer gone, skipping tile");
            return false;
        };
        let graph = self.graph();
        let ctx = self.context(graph.as_deref());

        let slot = self.slot();
        let mut contents = slot.lock();
        if !contents.is_owned_by(self.id) {
            debug!(
                task = %self.id,
                tile = %self.tile,
                slot = slot.index(),
                "Slot was reassigned, discarding result"
            );
            return false;
        }
        let changed = owner.do_create_tile(&ctx, &mut contents);
        trace!(task = %self.id, tile = %self.tile, changed, "Tile created");
        changed
    }

    fn end(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.end_create_tile(&self.context(None));
        }
    }
}

impl Drop for CreateTileTask {
    fn drop(&mut self) {
        self.stop();
        if let Some(owner) = self.owner.upgrade() {
            owner.forget_task(self.id);
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.create_tile_task_deleted(self.tile, self.id);
        }
    }
}

impl fmt::Debug for CreateTileTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateTileTask")
            .field("id", &self.id)
            .field("tile", &self.tile)
            .field("state", &self.status.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Create Tile Task Graph
// =============================================================================

/// A [`CreateTileTask`] together with the tasks it depends on.
///
/// Used by producers whose tiles are computed from other tiles. The root task
/// is the graph's result; layers add the tasks of the tiles they read as its
/// dependencies.
pub struct CreateTileTaskGraph {
    graph: TaskGraph,
    root: Arc<CreateTileTask>,
}

impl CreateTileTaskGraph {
    pub(crate) fn new(root: Arc<CreateTileTask>) -> Arc<Self> {
        let graph = TaskGraph::with_result(Arc::clone(&root) as Arc<dyn Task>);
        graph.set_deadline(root.deadline());
        let this = Arc::new(Self { graph, root });
        if this.root.graph.set(Arc::downgrade(&this)).is_err() {
            warn!(task = %this.root.id, "Task already belongs to a graph");
        }
        this
    }

    pub fn root(&self) -> &Arc<CreateTileTask> {
        &self.root
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Makes the root task run after `task`.
    pub fn add_dependency(&self, task: Arc<dyn Task>) -> Result<NodeId, GraphError> {
        self.graph.add_result_dependency(task)
    }

    pub(crate) fn release(&self) -> Vec<Arc<dyn Task>> {
        self.graph.release()
    }

    pub(crate) fn restore(&self) -> usize {
        self.graph.restore()
    }
}

impl Task for CreateTileTaskGraph {
    fn id(&self) -> TaskId {
        self.graph.id()
    }

    fn deadline(&self) -> Deadline {
        self.graph.deadline()
    }

    fn set_deadline(&self, deadline: Deadline) {
        self.graph.set_deadline(deadline);
    }

    fn is_gpu_task(&self) -> bool {
        self.graph.is_gpu_task()
    }

    fn state(&self) -> TaskState {
        self.graph.state()
    }

    fn set_state(&self, state: TaskState) {
        self.graph.set_state(state);
    }

    fn complete(&self, generation: u64) -> bool {
        self.graph.complete(generation)
    }

    fn init(&self) {
        self.graph.init();
    }

    fn begin(&self) {
        self.graph.begin();
    }

    fn run(&self) -> bool {
        self.graph.run()
    }

    fn end(&self) {
        self.graph.end();
    }
}

impl fmt::Debug for CreateTileTaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateTileTaskGraph")
            .field("root", &self.root)
            .field("nodes", &self.graph.len())
            .finish()
    }
}

// =============================================================================
// Tile Task
// =============================================================================

/// The task owned by a cached tile: either a lone [`CreateTileTask`] or a
/// graph rooted at one.
#[derive(Clone)]
pub enum TileTask {
    Single(Arc<CreateTileTask>),
    Graph(Arc<CreateTileTaskGraph>),
}

impl TileTask {
    /// Id of the task to schedule.
    pub fn id(&self) -> TaskId {
        match self {
            TileTask::Single(task) => task.id(),
            TileTask::Graph(graph) => graph.id(),
        }
    }

    /// Id of the task allowed to write the tile's slot.
    pub fn writer_id(&self) -> TaskId {
        self.root().id()
    }

    pub fn root(&self) -> &Arc<CreateTileTask> {
        match self {
            TileTask::Single(task) => task,
            TileTask::Graph(graph) => graph.root(),
        }
    }

    pub fn graph(&self) -> Option<&Arc<CreateTileTaskGraph>> {
        match self {
            TileTask::Single(_) => None,
            TileTask::Graph(graph) => Some(graph),
        }
    }

    /// The task to hand to a scheduler.
    pub fn as_task(&self) -> Arc<dyn Task> {
        match self {
            TileTask::Single(task) => Arc::clone(task) as Arc<dyn Task>,
            TileTask::Graph(graph) => Arc::clone(graph) as Arc<dyn Task>,
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            TileTask::Single(task) => task.is_done(),
            TileTask::Graph(graph) => graph.is_done(),
        }
    }

    pub(crate) fn start(&self) {
        self.root().start();
    }

    /// Tears a graph down to its root. Returns the dependencies let go.
    pub(crate) fn release(&self) -> Vec<Arc<dyn Task>> {
        match self {
            TileTask::Single(_) => Vec::new(),
            TileTask::Graph(graph) => graph.release(),
        }
    }

    pub(crate) fn restore(&self) -> usize {
        match self {
            TileTask::Single(_) => 0,
            TileTask::Graph(graph) => graph.restore(),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakTileTask {
        match self {
            TileTask::Single(task) => WeakTileTask::Single(Arc::downgrade(task)),
            TileTask::Graph(graph) => WeakTileTask::Graph(Arc::downgrade(graph)),
        }
    }
}

impl fmt::Debug for TileTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileTask::Single(task) => task.fmt(f),
            TileTask::Graph(graph) => graph.fmt(f),
        }
    }
}

/// Non-owning counterpart of [`TileTask`].
pub(crate) enum WeakTileTask {
    Single(Weak<CreateTileTask>),
    Graph(Weak<CreateTileTaskGraph>),
}

impl WeakTileTask {
    pub(crate) fn upgrade(&self) -> Option<TileTask> {
        match self {
            WeakTileTask::Single(task) => task.upgrade().map(TileTask::Single),
            WeakTileTask::Graph(graph) => graph.upgrade().map(TileTask::Graph),
        }
    }
}
