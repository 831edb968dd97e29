use std::fmt::Debug;

pub type WorkerId = u32;

/// Worker/process layout as seen from one worker.
pub trait Topology: Send + Sync + Debug {
    /// Every worker id currently known, in a stable order.
    fn workers(&self) -> Vec<WorkerId>;

    /// The id of the worker this scheduler runs on.
    fn current(&self) -> WorkerId;

    fn contains(&self, id: WorkerId) -> bool {
        self.workers().contains(&id)
    }
}

#[derive(Debug, Clone)]
pub struct StaticTopology {
    workers: Vec<WorkerId>,
    current: WorkerId,
}

impl StaticTopology {
    pub fn new(workers: Vec<WorkerId>, current: WorkerId) -> Self {
        Self { workers, current }
    }

    /// A one-worker topology; distribution always degrades to local delivery.
    pub fn single() -> Self {
        Self::new(vec![0], 0)
    }

    /// Workers `0..count`, seen from `current`.
    pub fn range(count: u32, current: WorkerId) -> Self {
        Self::new((0..count).collect(), current)
    }
}

impl Topology for StaticTopology {
    fn workers(&self) -> Vec<WorkerId> {
        self.workers.clone()
    }

    fn current(&self) -> WorkerId {
        self.current
    }
}
