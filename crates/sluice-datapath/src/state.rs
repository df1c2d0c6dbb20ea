//! Datapath state: registered interfaces and their queue tables
//!
//! Each registered interface gets an [`InterfaceBinding`] that owns the
//! interface's work queue and the RX/TX queue tables. Queue tables are only
//! modified from that work queue.

use crate::config::DatapathConfig;
use crate::error::{DatapathError, Result};
use crate::interface::{HookDirection, HookId, HookSubLayer, InterfaceDriver, InterfaceMode};
use crate::rx::{QueueKey, RxQueue};
use crate::tx::TxQueue;
use crate::workqueue::WorkQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique id for queues, sockets and program bindings
pub(crate) fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Root of the datapath
pub struct State {
    config: DatapathConfig,
    interfaces: DashMap<u32, Arc<InterfaceBinding>>,
}

impl State {
    /// Validate `config` and create an empty datapath
    pub fn new(config: DatapathConfig) -> Result<Arc<Self>> {
        config.validate()?;
        tracing::debug!(?config, "datapath state created");
        Ok(Arc::new(Self {
            config,
            interfaces: DashMap::new(),
        }))
    }

    /// Datapath configuration
    pub fn config(&self) -> &DatapathConfig {
        &self.config
    }

    /// Make an interface available to programs and sockets
    pub fn register_interface(&self, driver: Arc<dyn InterfaceDriver>) -> Result<Arc<InterfaceBinding>> {
        let if_index = driver.if_index();
        if driver.queue_count() == 0 {
            return Err(DatapathError::InvalidParameter(format!(
                "interface {if_index} has no queues"
            )));
        }
        match self.interfaces.entry(if_index) {
            Entry::Occupied(_) => Err(DatapathError::DuplicateObject(format!(
                "interface {if_index} already registered"
            ))),
            Entry::Vacant(vacant) => {
                let binding = Arc::new(InterfaceBinding::new(driver, self.config.clone())?);
                vacant.insert(binding.clone());
                tracing::info!(
                    if_index,
                    mode = ?binding.mode,
                    queues = binding.queue_count,
                    "interface registered"
                );
                Ok(binding)
            }
        }
    }

    /// Remove an interface. Its RX queues are deleted and its TX queues torn
    /// down on the interface's work queue before this returns.
    pub fn deregister_interface(&self, if_index: u32) -> Result<()> {
        let (_, binding) = self
            .interfaces
            .remove(&if_index)
            .ok_or_else(|| DatapathError::NotFound(format!("interface {if_index}")))?;
        let job = binding.clone();
        binding.work_queue().run(move || job.remove())?;
        tracing::info!(if_index, "interface deregistered");
        Ok(())
    }

    /// Binding of a registered interface
    pub fn binding(&self, if_index: u32) -> Result<Arc<InterfaceBinding>> {
        self.interfaces
            .get(&if_index)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DatapathError::NotFound(format!("interface {if_index}")))
    }

    /// Indices of every registered interface, ascending
    pub fn interfaces(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.interfaces.iter().map(|entry| *entry.key()).collect();
        indices.sort_unstable();
        indices
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("config", &self.config)
            .field("interfaces", &self.interfaces.len())
            .finish()
    }
}

/// A registered interface and its queues
pub struct InterfaceBinding {
    if_index: u32,
    mode: InterfaceMode,
    queue_count: u32,
    driver: Arc<dyn InterfaceDriver>,
    work_queue: WorkQueue,
    config: DatapathConfig,
    rx_queues: Mutex<HashMap<QueueKey, Arc<RxQueue>>>,
    tx_queues: Mutex<HashMap<QueueKey, Arc<TxQueue>>>,
    removed: AtomicBool,
}

impl InterfaceBinding {
    fn new(driver: Arc<dyn InterfaceDriver>, config: DatapathConfig) -> Result<Self> {
        let if_index = driver.if_index();
        Ok(Self {
            if_index,
            mode: driver.mode(),
            queue_count: driver.queue_count(),
            work_queue: WorkQueue::new(format!("sluice-if{if_index}"))?,
            driver,
            config,
            rx_queues: Mutex::new(HashMap::new()),
            tx_queues: Mutex::new(HashMap::new()),
            removed: AtomicBool::new(false),
        })
    }

    /// Interface index
    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    /// Attachment mode of the interface
    pub fn mode(&self) -> InterfaceMode {
        self.mode
    }

    /// Number of queue pairs
    pub fn queue_count(&self) -> u32 {
        self.queue_count
    }

    /// Serialized control executor of this interface
    pub fn work_queue(&self) -> &WorkQueue {
        &self.work_queue
    }

    /// Whether the interface has been deregistered
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    fn check_queue(&self, hook: HookId, direction: HookDirection, sub_layer: HookSubLayer, queue_id: u32) -> Result<QueueKey> {
        if self.is_removed() {
            return Err(DatapathError::DeviceRemoved(format!("interface {}", self.if_index)));
        }
        if hook.direction != direction || hook.sub_layer != sub_layer {
            return Err(DatapathError::InvalidParameter(format!(
                "hook {hook} is not supported here"
            )));
        }
        if queue_id >= self.queue_count {
            return Err(DatapathError::InvalidParameter(format!(
                "queue {queue_id} out of range, interface {} has {}",
                self.if_index, self.queue_count
            )));
        }
        Ok(QueueKey { hook, queue_id })
    }

    pub(crate) fn find_or_create_rx_queue(&self, hook: HookId, queue_id: u32) -> Result<Arc<RxQueue>> {
        let key = self.check_queue(hook, HookDirection::Rx, HookSubLayer::Inspect, queue_id)?;
        let queue = self
            .rx_queues
            .lock()
            .entry(key)
            .or_insert_with(|| RxQueue::new(self.driver.clone(), key, self.config.rx_ring_size))
            .clone();
        Ok(queue)
    }

    pub(crate) fn find_or_create_tx_queue(&self, hook: HookId, queue_id: u32) -> Result<Arc<TxQueue>> {
        let key = self.check_queue(hook, HookDirection::Tx, HookSubLayer::Inject, queue_id)?;
        let mut queues = self.tx_queues.lock();
        if let Some(queue) = queues.get(&key) {
            return Ok(queue.clone());
        }
        let queue = TxQueue::create(&self.driver, key, &self.config)?;
        queues.insert(key, queue.clone());
        Ok(queue)
    }

    /// RX inspection queue `queue_id`, if one was created
    pub fn rx_queue(&self, queue_id: u32) -> Option<Arc<RxQueue>> {
        let key = QueueKey {
            hook: HookId::RX_INSPECT,
            queue_id,
        };
        self.rx_queues.lock().get(&key).cloned()
    }

    /// TX injection queue `queue_id`, if one is open
    pub fn tx_queue(&self, queue_id: u32) -> Option<Arc<TxQueue>> {
        let key = QueueKey {
            hook: HookId::TX_INJECT,
            queue_id,
        };
        self.tx_queues.lock().get(&key).cloned()
    }

    /// Delete a TX queue once no socket transmits through it
    pub(crate) fn release_tx_queue(&self, queue: &Arc<TxQueue>) {
        if queue.has_client() {
            return;
        }
        let removed = {
            let mut queues = self.tx_queues.lock();
            let key = QueueKey {
                hook: HookId::TX_INJECT,
                queue_id: queue.queue_id(),
            };
            match queues.get(&key) {
                Some(existing) if Arc::ptr_eq(existing, queue) => queues.remove(&key),
                _ => None,
            }
        };
        if let Some(queue) = removed {
            queue.delete();
        }
    }

    fn remove(&self) {
        self.removed.store(true, Ordering::Release);
        let rx: Vec<Arc<RxQueue>> = self.rx_queues.lock().values().cloned().collect();
        for queue in rx {
            queue.interface_removed();
        }
        let tx: Vec<Arc<TxQueue>> = self.tx_queues.lock().drain().map(|(_, q)| q).collect();
        for queue in tx {
            queue.delete();
        }
    }
}

impl std::fmt::Debug for InterfaceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceBinding")
            .field("if_index", &self.if_index)
            .field("mode", &self.mode)
            .field("queue_count", &self.queue_count)
            .finish()
    }
}
