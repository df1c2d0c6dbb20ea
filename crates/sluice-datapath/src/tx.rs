//! TX queue pipeline
//!
//! A TX queue lays out the frame ring of one interface queue's injection
//! hook and bridges it to a single socket client. The driver pulls frames by
//! calling [`TxQueueDispatch::flush_transmit`], which first reaps completions
//! and then refills the frame ring from the client's TX ring.
//!
//! Completion is either in order, where the driver advances the frame ring
//! consumer and the queue walks the gap between `reserved_index` and the
//! consumer, or out of order, where the driver reports each frame through a
//! separate completion ring.
//!
//! [`TxQueueDispatch::flush_transmit`]: crate::interface::TxQueueDispatch::flush_transmit

use crate::config::DatapathConfig;
use crate::error::{DatapathError, Result};
use crate::interface::{
    HookDirection, HookSubLayer, InterfaceDriver, InterfaceTxQueue, NotifyQueueFlags,
    TxCapabilities, TxQueueConfigActivate, TxQueueConfigCreate, TxQueueDispatch,
};
use crate::rx::QueueKey;
use crate::state::next_object_id;
use crate::stats::{TxQueueStats, TxQueueStatsSnapshot};
use crate::xsk::XskDatapath;
use parking_lot::Mutex;
use sluice_core::frame::{
    BUFFER_LOGICAL_ADDRESS, BUFFER_MDL, BUFFER_VIRTUAL_ADDRESS, FRAME_TX_COMPLETION_CONTEXT,
    TX_BUFFER_EXTENSIONS, TX_COMPLETION_CONTEXT, TX_COMPLETION_EXTENSIONS, TX_FRAME_EXTENSIONS,
    TxFrameCompletion,
};
use sluice_core::{Extension, ExtensionInfo, ExtensionSet, ExtensionType, RecordLayout, Ring};
use std::sync::{Arc, OnceLock};

/// Resolved buffer and completion extensions of a TX queue
#[derive(Debug, Clone, Copy)]
pub(crate) struct TxExtensions {
    pub(crate) virtual_address: Option<Extension>,
    pub(crate) logical_address: Option<Extension>,
    pub(crate) mdl: Option<Extension>,
    pub(crate) completion_context: Extension,
    pub(crate) completion_ring_context: Option<Extension>,
}

/// Rings of an activated TX queue
pub(crate) struct TxRings {
    pub(crate) frame_ring: Arc<Ring>,
    pub(crate) completion_ring: Option<Arc<Ring>>,
    pub(crate) extensions: TxExtensions,
    pub(crate) capabilities: TxCapabilities,
}

impl TxRings {
    /// Frame slots the queue may fill without overrunning frames awaiting
    /// completion
    fn free_frames(&self) -> u32 {
        let ring = &self.frame_ring;
        match self.completion_ring {
            Some(_) => ring.free_count(),
            None => ring.capacity() - ring.producer_index().wrapping_sub(ring.reserved_index()),
        }
    }
}

/// Injection queue of one interface queue
pub struct TxQueue {
    id: u64,
    key: QueueKey,
    if_index: u32,
    rings: OnceLock<TxRings>,
    interface_queue: Mutex<Option<Arc<dyn InterfaceTxQueue>>>,
    client: Mutex<Option<Arc<XskDatapath>>>,
    stats: TxQueueStats,
}

impl TxQueue {
    /// Create and activate the driver queue for `key`
    pub(crate) fn create(
        driver: &Arc<dyn InterfaceDriver>,
        key: QueueKey,
        config: &DatapathConfig,
    ) -> Result<Arc<TxQueue>> {
        if key.hook.direction != HookDirection::Tx || key.hook.sub_layer != HookSubLayer::Inject {
            return Err(DatapathError::InvalidParameter(format!(
                "TX queues attach to injection hooks, not {}",
                key.hook
            )));
        }

        let queue = Arc::new(TxQueue {
            id: next_object_id(),
            key,
            if_index: driver.if_index(),
            rings: OnceLock::new(),
            interface_queue: Mutex::new(None),
            client: Mutex::new(None),
            stats: TxQueueStats::new(),
        });

        let mut create = TxQueueConfigCreate::new(
            key.queue_id,
            ExtensionSet::new(ExtensionType::Frame, &TX_FRAME_EXTENSIONS)?,
            ExtensionSet::new(ExtensionType::Buffer, &TX_BUFFER_EXTENSIONS)?,
            ExtensionSet::new(ExtensionType::TxFrameCompletion, &TX_COMPLETION_EXTENSIONS)?,
            TxQueueDispatch::new(Arc::downgrade(&queue)),
        );
        let interface_queue: Arc<dyn InterfaceTxQueue> =
            Arc::from(driver.create_tx_queue(&mut create)?);

        let (rings, activate) = queue.layout(create, config)?;
        if queue.rings.set(rings).is_err() {
            return Err(DatapathError::InvalidState("TX queue already activated".into()));
        }
        interface_queue.activate(&activate)?;
        *queue.interface_queue.lock() = Some(interface_queue);

        tracing::info!(
            if_index = queue.if_index,
            queue_id = key.queue_id,
            frames = activate.frame_ring.capacity(),
            out_of_order = activate.is_out_of_order_completion_enabled(),
            "TX queue created"
        );
        Ok(queue)
    }

    fn layout(
        &self,
        mut create: TxQueueConfigCreate,
        config: &DatapathConfig,
    ) -> Result<(TxRings, TxQueueConfigActivate)> {
        let capabilities = create.capabilities.ok_or_else(|| {
            DatapathError::Interface("driver did not declare TX capabilities".into())
        })?;
        if !(capabilities.virtual_address_enabled
            || capabilities.mdl_enabled
            || capabilities.dma_enabled)
        {
            return Err(DatapathError::Interface(
                "driver supports no TX buffer addressing".into(),
            ));
        }

        let buffers = &mut create.buffer_extensions;
        if capabilities.virtual_address_enabled {
            buffers.enable(BUFFER_VIRTUAL_ADDRESS.name)?;
        }
        if capabilities.mdl_enabled {
            buffers.enable(BUFFER_MDL.name)?;
        }
        if capabilities.dma_enabled {
            buffers.enable(BUFFER_LOGICAL_ADDRESS.name)?;
        }
        create
            .frame_extensions
            .set_internal(FRAME_TX_COMPLETION_CONTEXT.name)?;
        create.frame_extensions.enable(FRAME_TX_COMPLETION_CONTEXT.name)?;
        if capabilities.out_of_order_completion_enabled {
            create
                .completion_extensions
                .set_internal(TX_COMPLETION_CONTEXT.name)?;
            create.completion_extensions.enable(TX_COMPLETION_CONTEXT.name)?;
        }
        if let Some(contexts) = create.descriptor_contexts {
            contexts.apply(&mut create.frame_extensions, &mut create.buffer_extensions)?;
        }

        let layout =
            RecordLayout::assign(&mut create.buffer_extensions, &mut create.frame_extensions)?;
        let frame_count = config
            .tx_ring_size
            .max(capabilities.transmit_frame_count_hint as u32)
            .checked_next_power_of_two()
            .ok_or_else(|| DatapathError::InvalidConfig("TX ring size overflows".into()))?;
        let (frame_ring, _) = layout.allocate_rings(frame_count, 0)?;

        let completion_ring = if capabilities.out_of_order_completion_enabled {
            let (size, alignment) = create.completion_extensions.assign_layout(
                size_of::<TxFrameCompletion>() as u32,
                align_of::<TxFrameCompletion>() as u8,
            )?;
            Some(Arc::new(Ring::allocate(size, frame_count, alignment)?))
        } else {
            None
        };

        let activate = TxQueueConfigActivate {
            frame_ring: Arc::new(frame_ring),
            completion_ring,
            frame_extensions: create.frame_extensions,
            buffer_extensions: create.buffer_extensions,
            completion_extensions: create.completion_extensions,
        };

        let optional = |enabled: bool, info: &ExtensionInfo| -> Result<Option<Extension>> {
            if enabled {
                Ok(Some(activate.get_extension(info)?))
            } else {
                Ok(None)
            }
        };
        let extensions = TxExtensions {
            virtual_address: optional(capabilities.virtual_address_enabled, &BUFFER_VIRTUAL_ADDRESS)?,
            logical_address: optional(capabilities.dma_enabled, &BUFFER_LOGICAL_ADDRESS)?,
            mdl: optional(capabilities.mdl_enabled, &BUFFER_MDL)?,
            completion_context: activate.get_extension(&FRAME_TX_COMPLETION_CONTEXT)?,
            completion_ring_context: optional(
                capabilities.out_of_order_completion_enabled,
                &TX_COMPLETION_CONTEXT,
            )?,
        };

        let rings = TxRings {
            frame_ring: activate.frame_ring.clone(),
            completion_ring: activate.completion_ring.clone(),
            extensions,
            capabilities,
        };
        Ok((rings, activate))
    }

    /// Unique queue id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Interface queue index
    pub fn queue_id(&self) -> u32 {
        self.key.queue_id
    }

    /// Interface index
    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    /// Transmit counters
    pub fn statistics(&self) -> TxQueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// Driver capabilities negotiated at creation
    pub fn capabilities(&self) -> Option<TxCapabilities> {
        self.rings.get().map(|rings| rings.capabilities)
    }

    /// Whether a socket is transmitting through this queue
    pub fn has_client(&self) -> bool {
        self.client.lock().is_some()
    }

    pub(crate) fn add_client(&self, client: Arc<XskDatapath>) -> Result<()> {
        let mut slot = self.client.lock();
        if let Some(existing) = slot.as_ref() {
            return Err(DatapathError::DuplicateObject(format!(
                "TX queue {} already serves socket {}",
                self.key.queue_id,
                existing.id()
            )));
        }
        tracing::debug!(if_index = self.if_index, queue_id = self.key.queue_id, xsk = client.id(), "TX client added");
        *slot = Some(client);
        Ok(())
    }

    pub(crate) fn remove_client(&self, id: u64) {
        let removed = {
            let mut slot = self.client.lock();
            match slot.as_ref() {
                Some(client) if client.id() == id => slot.take(),
                _ => None,
            }
        };
        if removed.is_some() {
            tracing::debug!(if_index = self.if_index, queue_id = self.key.queue_id, xsk = id, "TX client removed");
        }
    }

    /// Ask the driver to pull frames
    pub(crate) fn notify(&self) {
        let interface_queue = self.interface_queue.lock().clone();
        if let Some(interface_queue) = interface_queue {
            interface_queue.notify(NotifyQueueFlags::TX);
        }
    }

    /// Reap completions, then fill up to `available` frames
    pub(crate) fn flush_transmit(&self, available: u32) -> u32 {
        let Some(rings) = self.rings.get() else {
            return 0;
        };
        let Some(client) = self.client.lock().clone() else {
            return 0;
        };

        let completed = client.fill_tx_completion(rings);
        if completed > 0 {
            self.stats.record_completions(completed as u64);
        }

        let produced = client.fill_tx(rings, available.min(rings.free_frames()));
        self.stats.record_flush(produced as u64);
        produced
    }

    /// Tear down with the interface: the client loses its TX path and the
    /// driver queue is deleted
    pub(crate) fn delete(&self) {
        let client = self.client.lock().take();
        if let Some(client) = client {
            client.on_tx_delete();
        }
        let interface_queue = self.interface_queue.lock().take();
        drop(interface_queue);
        tracing::info!(if_index = self.if_index, queue_id = self.key.queue_id, "TX queue deleted");
    }
}

impl std::fmt::Debug for TxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxQueue")
            .field("id", &self.id)
            .field("if_index", &self.if_index)
            .field("queue_id", &self.key.queue_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::HookId;
    use crate::soft::{SoftInterface, SoftInterfaceConfig};
    use crate::state::State;
    use crate::xsk::Xsk;

    fn driver(config: SoftInterfaceConfig) -> Arc<dyn InterfaceDriver> {
        SoftInterface::new(config)
    }

    fn key(hook: HookId) -> QueueKey {
        QueueKey { hook, queue_id: 0 }
    }

    #[test]
    fn test_rejects_inspect_hook() {
        let driver = driver(SoftInterfaceConfig::default());
        let result = TxQueue::create(&driver, key(HookId::RX_INSPECT), &DatapathConfig::default());
        assert!(matches!(result, Err(DatapathError::InvalidParameter(_))));
    }

    #[test]
    fn test_frame_count_follows_hint() {
        let driver = driver(SoftInterfaceConfig {
            transmit_frame_count_hint: 100,
            ..Default::default()
        });
        let queue =
            TxQueue::create(&driver, key(HookId::TX_INJECT), &DatapathConfig::default()).unwrap();
        let rings = queue.rings.get().unwrap();
        assert_eq!(rings.frame_ring.capacity(), 128);
        assert!(rings.completion_ring.is_none());
        assert!(rings.extensions.virtual_address.is_some());
        assert!(rings.extensions.mdl.is_none());
    }

    #[test]
    fn test_out_of_order_completion_ring() {
        let driver = driver(SoftInterfaceConfig {
            out_of_order_completion: true,
            mdl_enabled: true,
            ..Default::default()
        });
        let queue =
            TxQueue::create(&driver, key(HookId::TX_INJECT), &DatapathConfig::default()).unwrap();
        let rings = queue.rings.get().unwrap();
        let completion = rings.completion_ring.as_ref().unwrap();
        assert_eq!(completion.capacity(), rings.frame_ring.capacity());
        assert!(completion.element_stride() >= 16);
        assert!(rings.extensions.completion_ring_context.is_some());
        assert!(rings.extensions.mdl.is_some());
    }

    #[test]
    fn test_single_client() {
        let state = State::new(DatapathConfig::default()).unwrap();
        let driver = driver(SoftInterfaceConfig::default());
        let queue =
            TxQueue::create(&driver, key(HookId::TX_INJECT), &DatapathConfig::default()).unwrap();
        assert_eq!(queue.flush_transmit(8), 0);

        let first = Xsk::create(&state);
        let second = Xsk::create(&state);
        queue.add_client(first.datapath().clone()).unwrap();
        assert!(matches!(
            queue.add_client(second.datapath().clone()),
            Err(DatapathError::DuplicateObject(_))
        ));

        queue.remove_client(second.id());
        assert!(queue.has_client());
        queue.remove_client(first.id());
        assert!(!queue.has_client());
    }
}
