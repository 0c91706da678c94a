//! In-memory fakes for the runtime and document capability traits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use crate::config::{DocumentEndpoint, RuntimeEndpoint};
use crate::document::{CellKind, DocumentConnector, DocumentHandle};
use crate::kernel::{RuntimeFactory, RuntimeHandle};
use crate::notebook_doc::{CellSnapshot, NotebookDoc};

/// State shared by every handle a [`FakeConnector`] hands out, standing in
/// for the remote room.
#[derive(Default)]
pub struct SharedRoom {
    pub doc: Mutex<Option<NotebookDoc>>,
    /// Operations left that fail with a dropped connection.
    pub faults: AtomicUsize,
    /// Cell count reads left that miss the newest cell, as if a peer's
    /// insert had not reached this replica yet.
    pub lagging_counts: AtomicUsize,
    /// Mutations left that are applied but answered with a dropped connection.
    pub lost_acks: AtomicUsize,
    pub mutations: AtomicUsize,
}

pub struct FakeDocument {
    room: Arc<SharedRoom>,
    broken: AtomicBool,
    pub stopped: AtomicBool,
}

impl FakeDocument {
    /// Make every further call on this handle fail.
    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.broken.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst) {
            bail!("Connection closed");
        }
        let injected = self
            .room
            .faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            bail!("WebSocketClosedError: connection is already closed");
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&NotebookDoc) -> T) -> anyhow::Result<T> {
        self.check()?;
        let guard = self.room.doc.lock().unwrap();
        Ok(f(guard.as_ref().unwrap()))
    }

    fn write<T>(&self, f: impl FnOnce(&mut NotebookDoc) -> T) -> anyhow::Result<T> {
        self.check()?;
        self.room.mutations.fetch_add(1, Ordering::SeqCst);
        let result = f(self.room.doc.lock().unwrap().as_mut().unwrap());
        let lost = self
            .room
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            bail!("Connection closed before the host acknowledged");
        }
        Ok(result)
    }
}

#[async_trait]
impl DocumentHandle for FakeDocument {
    async fn cell_count(&self) -> anyhow::Result<usize> {
        let count = self.read(|doc| doc.cell_count())?;
        let lagging = self
            .room
            .lagging_counts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(if lagging { count.saturating_sub(1) } else { count })
    }

    async fn cells(&self) -> anyhow::Result<Vec<CellSnapshot>> {
        self.read(|doc| doc.get_cells())
    }

    async fn cell(&self, index: usize) -> anyhow::Result<Option<CellSnapshot>> {
        self.read(|doc| doc.get_cell(index))
    }

    async fn outputs(&self, index: usize) -> anyhow::Result<Option<Vec<String>>> {
        self.read(|doc| doc.cell_outputs(index))
    }

    async fn insert_cell(&self, index: usize, kind: CellKind, source: &str) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.write(|doc| doc.insert_cell(index, &id, kind.as_str(), source))??;
        Ok(id)
    }

    async fn set_source(&self, index: usize, source: &str) -> anyhow::Result<()> {
        self.write(|doc| doc.update_source(index, source))??;
        Ok(())
    }

    async fn delete_cell(&self, index: usize) -> anyhow::Result<()> {
        self.write(|doc| doc.delete_cell(index))??;
        Ok(())
    }

    async fn clear_outputs(&self, index: usize) -> anyhow::Result<()> {
        self.write(|doc| doc.clear_outputs(index))??;
        Ok(())
    }

    async fn append_output(&self, index: usize, output: &str) -> anyhow::Result<()> {
        self.write(|doc| doc.append_output(index, output))??;
        Ok(())
    }

    async fn set_execution_count(&self, index: usize, count: Option<i64>) -> anyhow::Result<()> {
        let count = count.map_or_else(|| "null".to_string(), |n| n.to_string());
        self.write(|doc| doc.set_execution_count(index, &count))??;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub room: Arc<SharedRoom>,
    pub connects: AtomicUsize,
    /// Refuse connections outright.
    pub refuse: AtomicBool,
    /// Hand out handles that are already broken.
    pub connect_broken: AtomicBool,
    pub handles: Mutex<Vec<Arc<FakeDocument>>>,
    pub paths: Mutex<Vec<String>>,
}

impl FakeConnector {
    /// A connector whose room starts with `cells` code cells.
    pub fn with_cells(cells: usize) -> Arc<Self> {
        let mut doc = NotebookDoc::new("fake-room");
        for i in 0..cells {
            doc.insert_cell(i, &format!("cell-{i}"), "code", &format!("x = {i}"))
                .unwrap();
        }
        let connector = Self::default();
        *connector.room.doc.lock().unwrap() = Some(doc);
        Arc::new(connector)
    }

    pub fn last_handle(&self) -> Option<Arc<FakeDocument>> {
        self.handles.lock().unwrap().last().cloned()
    }

    pub fn fail_next(&self, operations: usize) {
        self.room.faults.store(operations, Ordering::SeqCst);
    }

    pub fn lose_acks(&self, mutations: usize) {
        self.room.lost_acks.store(mutations, Ordering::SeqCst);
    }

    pub fn lag_cell_counts(&self, reads: usize) {
        self.room.lagging_counts.store(reads, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentConnector for FakeConnector {
    async fn connect(&self, endpoint: &DocumentEndpoint) -> anyhow::Result<Arc<dyn DocumentHandle>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().unwrap().push(endpoint.path.clone());
        if self.refuse.load(Ordering::SeqCst) {
            bail!("Connection refused");
        }
        let handle = Arc::new(FakeDocument {
            room: self.room.clone(),
            broken: AtomicBool::new(self.connect_broken.load(Ordering::SeqCst)),
            stopped: AtomicBool::new(false),
        });
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

/// What a fake kernel does when asked to execute.
#[derive(Clone)]
pub enum ExecuteBehavior {
    /// Write these outputs and finish.
    Complete(Vec<String>),
    /// Write these outputs, then never finish.
    Hang(Vec<String>),
    /// Write these outputs, then finish after the delay.
    Slow(Duration, Vec<String>),
    Fail(String),
}

/// Counters shared by every runtime a factory creates.
#[derive(Default)]
pub struct RuntimeCounters {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub executes: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_interrupt: AtomicBool,
    pub idle: AtomicBool,
}

pub struct FakeRuntime {
    counters: Arc<RuntimeCounters>,
    behavior: ExecuteBehavior,
    alive: AtomicBool,
}

impl FakeRuntime {
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl RuntimeHandle for FakeRuntime {
    async fn start(&self) -> anyhow::Result<()> {
        if self.counters.fail_start.load(Ordering::SeqCst) {
            bail!("kernel failed to start");
        }
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self) -> anyhow::Result<bool> {
        Ok(self.alive.load(Ordering::SeqCst))
    }

    async fn is_idle(&self) -> anyhow::Result<bool> {
        Ok(self.counters.idle.load(Ordering::SeqCst))
    }

    async fn interrupt(&self) -> anyhow::Result<()> {
        self.counters.interrupts.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_interrupt.load(Ordering::SeqCst) {
            bail!("interrupt refused");
        }
        Ok(())
    }

    async fn execute(&self, cell_index: usize, document: Arc<dyn DocumentHandle>) -> anyhow::Result<()> {
        let count = self.counters.executes.fetch_add(1, Ordering::SeqCst) + 1;
        let (outputs, hang, delay) = match &self.behavior {
            ExecuteBehavior::Complete(outputs) => (outputs, false, None),
            ExecuteBehavior::Hang(outputs) => (outputs, true, None),
            ExecuteBehavior::Slow(delay, outputs) => (outputs, false, Some(*delay)),
            ExecuteBehavior::Fail(message) => bail!("{}", message),
        };
        document.clear_outputs(cell_index).await?;
        for output in outputs {
            document.append_output(cell_index, output).await?;
        }
        document
            .set_execution_count(cell_index, Some(count as i64))
            .await?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }
}

pub struct FakeRuntimeFactory {
    pub counters: Arc<RuntimeCounters>,
    pub behavior: Mutex<ExecuteBehavior>,
    pub created: Mutex<Vec<Arc<FakeRuntime>>>,
    pub endpoints: Mutex<Vec<RuntimeEndpoint>>,
}

impl FakeRuntimeFactory {
    pub fn new() -> Arc<Self> {
        Self::with_behavior(ExecuteBehavior::Complete(vec![
            r#"{"output_type":"stream","name":"stdout","text":"done\n"}"#.to_string(),
        ]))
    }

    pub fn with_behavior(behavior: ExecuteBehavior) -> Arc<Self> {
        let counters = RuntimeCounters::default();
        counters.idle.store(true, Ordering::SeqCst);
        Arc::new(Self {
            counters: Arc::new(counters),
            behavior: Mutex::new(behavior),
            created: Mutex::new(Vec::new()),
            endpoints: Mutex::new(Vec::new()),
        })
    }

    pub fn last_runtime(&self) -> Option<Arc<FakeRuntime>> {
        self.created.lock().unwrap().last().cloned()
    }
}

impl RuntimeFactory for FakeRuntimeFactory {
    fn create(&self, endpoint: &RuntimeEndpoint) -> Arc<dyn RuntimeHandle> {
        self.endpoints.lock().unwrap().push(endpoint.clone());
        let runtime = Arc::new(FakeRuntime {
            counters: self.counters.clone(),
            behavior: self.behavior.lock().unwrap().clone(),
            alive: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(runtime.clone());
        runtime
    }
}
