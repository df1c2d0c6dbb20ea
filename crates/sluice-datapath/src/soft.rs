//! In-process software interface
//!
//! [`SoftInterface`] implements the interface driver contract over plain
//! memory so that programs and sockets can be exercised without hardware.
//! Frames are injected from the caller's thread, which then plays the role of
//! the driver's receive context: it produces frames into the queue's rings,
//! runs `receive` and `flush_receive`, and reads back the recorded actions.
//!
//! On TX, every notification runs a pull loop that transmits whatever the
//! datapath produced into an in-memory list and reports completions in order
//! or through the completion ring, as configured.

use crate::error::{DatapathError, Result};
use crate::interface::{
    DescriptorContexts, InterfaceDriver, InterfaceMode, InterfaceRxQueue, InterfaceTxQueue,
    NotifyQueueFlags, RxCapabilities, RxQueueConfigActivate, RxQueueConfigCreate,
    RxQueueDispatch, TxCapabilities, TxQueueConfigActivate, TxQueueConfigCreate,
    TxQueueDispatch,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice_core::frame::{
    BUFFER_LOGICAL_ADDRESS, BUFFER_MDL, BUFFER_VIRTUAL_ADDRESS, BufferLogicalAddress, BufferMdl,
    BufferVirtualAddress, FRAME_FRAGMENT, FRAME_RX_ACTION, FRAME_TX_COMPLETION_CONTEXT,
    FrameFragment, FrameRxAction, TX_COMPLETION_CONTEXT, TxCompletionContext, TxFrameCompletion,
};
use sluice_core::{Buffer, Extension, ExtensionInfo, Ring, RxAction};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Shape of a software interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftInterfaceConfig {
    /// Interface index
    pub if_index: u32,
    /// Number of RX/TX queue pairs
    pub queue_count: u32,
    /// Attachment mode
    pub mode: InterfaceMode,
    /// Fragment buffers per RX frame, zero for single-buffer frames
    pub max_fragments: u8,
    /// Report TX completions through a completion ring
    pub out_of_order_completion: bool,
    /// Honor the TX action on received frames
    pub tx_action_supported: bool,
    /// Largest TX buffer accepted
    pub max_buffer_size: u32,
    /// Largest TX frame accepted
    pub max_frame_size: u32,
    /// Preferred RX frame ring size, zero for none
    pub receive_frame_count_hint: u16,
    /// Preferred TX frame ring size, zero for none
    pub transmit_frame_count_hint: u16,
    /// TX buffers carry a logical address
    pub dma_enabled: bool,
    /// TX buffers carry a memory-region descriptor
    pub mdl_enabled: bool,
    /// TX buffers carry a virtual address
    pub virtual_address_enabled: bool,
    /// Bytes of private context per frame and buffer, zero for none
    pub descriptor_context_size: u8,
}

impl Default for SoftInterfaceConfig {
    fn default() -> Self {
        Self {
            if_index: 1,
            queue_count: 1,
            mode: InterfaceMode::Generic,
            max_fragments: 4,
            out_of_order_completion: false,
            tx_action_supported: true,
            max_buffer_size: 4096,
            max_frame_size: 4096,
            receive_frame_count_hint: 0,
            transmit_frame_count_hint: 0,
            dma_enabled: false,
            mdl_enabled: false,
            virtual_address_enabled: true,
            descriptor_context_size: 0,
        }
    }
}

/// Result of injecting one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxOutcome {
    /// Action recorded by inspection
    pub action: RxAction,
    /// Frame bytes after inspection, which may rewrite them
    pub data: Vec<u8>,
}

/// Software interface driver
pub struct SoftInterface {
    config: SoftInterfaceConfig,
    rx_queues: Mutex<HashMap<u32, Weak<SoftRxQueue>>>,
    tx_queues: Mutex<HashMap<u32, Weak<SoftTxQueue>>>,
}

impl SoftInterface {
    /// Create an interface with no open queues
    pub fn new(config: SoftInterfaceConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            rx_queues: Mutex::new(HashMap::new()),
            tx_queues: Mutex::new(HashMap::new()),
        })
    }

    /// Interface shape
    pub fn config(&self) -> &SoftInterfaceConfig {
        &self.config
    }

    fn check_queue(&self, queue_id: u32) -> Result<()> {
        if queue_id >= self.config.queue_count {
            return Err(DatapathError::InvalidParameter(format!(
                "queue {queue_id} out of range, interface {} has {}",
                self.config.if_index, self.config.queue_count
            )));
        }
        Ok(())
    }

    /// Receive single-buffer frames on `queue_id`
    pub fn inject(&self, queue_id: u32, frames: &[&[u8]]) -> Result<Vec<RxOutcome>> {
        let frames: Vec<Vec<&[u8]>> = frames.iter().map(|frame| vec![*frame]).collect();
        self.inject_fragmented(queue_id, &frames)
    }

    /// Receive frames on `queue_id`, each given as its list of buffers
    pub fn inject_fragmented(&self, queue_id: u32, frames: &[Vec<&[u8]>]) -> Result<Vec<RxOutcome>> {
        self.check_queue(queue_id)?;
        let queue = self
            .rx_queues
            .lock()
            .get(&queue_id)
            .and_then(Weak::upgrade);
        match queue {
            Some(queue) => queue.inject(frames),
            // No datapath attached: the stack sees every frame.
            None => Ok(frames.iter().map(|buffers| RxOutcome::pass(buffers)).collect()),
        }
    }

    /// Drain the frames transmitted on `queue_id`
    pub fn transmitted(&self, queue_id: u32) -> Vec<Vec<u8>> {
        let queue = self
            .tx_queues
            .lock()
            .get(&queue_id)
            .and_then(Weak::upgrade);
        queue.map_or_else(Vec::new, |queue| std::mem::take(&mut *queue.transmitted.lock()))
    }

    /// Whether the datapath currently holds a driver queue for `queue_id`
    pub fn has_rx_queue(&self, queue_id: u32) -> bool {
        self.rx_queues
            .lock()
            .get(&queue_id)
            .is_some_and(|queue| queue.strong_count() > 0)
    }

    fn descriptor_contexts(&self) -> Option<DescriptorContexts> {
        let size = self.config.descriptor_context_size;
        (size > 0).then(|| DescriptorContexts::new((size, 8), (size, 8)))
    }
}

impl InterfaceDriver for SoftInterface {
    fn if_index(&self) -> u32 {
        self.config.if_index
    }

    fn mode(&self) -> InterfaceMode {
        self.config.mode
    }

    fn queue_count(&self) -> u32 {
        self.config.queue_count
    }

    fn create_rx_queue(&self, config: &mut RxQueueConfigCreate) -> Result<Box<dyn InterfaceRxQueue>> {
        self.check_queue(config.queue_id())?;
        let capabilities = RxCapabilities {
            receive_frame_count_hint: self.config.receive_frame_count_hint,
            ..RxCapabilities::new(self.config.max_fragments, self.config.tx_action_supported)
        };
        config.set_capabilities(capabilities)?;
        config.register_extension_version(&BUFFER_VIRTUAL_ADDRESS)?;
        if self.config.max_fragments > 0 {
            config.register_extension_version(&FRAME_FRAGMENT)?;
        }
        if let Some(contexts) = self.descriptor_contexts() {
            config.set_descriptor_contexts(contexts)?;
        }

        let queue = Arc::new(SoftRxQueue {
            queue_id: config.queue_id(),
            max_fragments: self.config.max_fragments,
            dispatch: config.dispatch(),
            rings: Mutex::new(None),
        });
        self.rx_queues
            .lock()
            .insert(config.queue_id(), Arc::downgrade(&queue));
        tracing::debug!(if_index = self.config.if_index, queue_id = config.queue_id(), "soft RX queue created");
        Ok(Box::new(SoftRxHandle(queue)))
    }

    fn create_tx_queue(&self, config: &mut TxQueueConfigCreate) -> Result<Box<dyn InterfaceTxQueue>> {
        self.check_queue(config.queue_id())?;
        let capabilities = TxCapabilities {
            virtual_address_enabled: self.config.virtual_address_enabled,
            mdl_enabled: self.config.mdl_enabled,
            dma_enabled: self.config.dma_enabled,
            transmit_frame_count_hint: self.config.transmit_frame_count_hint,
            out_of_order_completion_enabled: self.config.out_of_order_completion,
            ..TxCapabilities::new(self.config.max_buffer_size, self.config.max_frame_size)
        };
        config.set_capabilities(capabilities)?;
        if capabilities.virtual_address_enabled {
            config.register_extension_version(&BUFFER_VIRTUAL_ADDRESS)?;
        }
        if capabilities.dma_enabled {
            config.register_extension_version(&BUFFER_LOGICAL_ADDRESS)?;
        }
        if capabilities.mdl_enabled {
            config.register_extension_version(&BUFFER_MDL)?;
        }
        if let Some(contexts) = self.descriptor_contexts() {
            config.set_descriptor_contexts(contexts)?;
        }

        let queue = Arc::new(SoftTxQueue {
            queue_id: config.queue_id(),
            dispatch: config.dispatch(),
            rings: Mutex::new(None),
            transmitted: Mutex::new(Vec::new()),
        });
        self.tx_queues
            .lock()
            .insert(config.queue_id(), Arc::downgrade(&queue));
        tracing::debug!(if_index = self.config.if_index, queue_id = config.queue_id(), "soft TX queue created");
        Ok(Box::new(SoftTxHandle(queue)))
    }
}

impl std::fmt::Debug for SoftInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftInterface")
            .field("config", &self.config)
            .finish()
    }
}

impl RxOutcome {
    fn pass(buffers: &[&[u8]]) -> Self {
        Self {
            action: RxAction::Pass,
            data: buffers.concat(),
        }
    }
}

struct SoftRxRings {
    frame_ring: Arc<Ring>,
    fragment_ring: Option<Arc<Ring>>,
    virtual_address: Extension,
    fragment: Option<Extension>,
    rx_action: Extension,
}

struct SoftRxQueue {
    queue_id: u32,
    max_fragments: u8,
    dispatch: RxQueueDispatch,
    rings: Mutex<Option<SoftRxRings>>,
}

impl SoftRxQueue {
    fn inject(&self, frames: &[Vec<&[u8]>]) -> Result<Vec<RxOutcome>> {
        for buffers in frames {
            if buffers.is_empty() {
                return Err(DatapathError::InvalidParameter("frame has no buffers".into()));
            }
            if buffers.len() - 1 > self.max_fragments as usize {
                return Err(DatapathError::InvalidParameter(format!(
                    "frame has {} buffers, queue {} allows {}",
                    buffers.len(),
                    self.queue_id,
                    self.max_fragments as usize + 1
                )));
            }
        }

        // Held across receive so RX_FLUSH notifications wait for the batch.
        let guard = self.rings.lock();
        let Some(rings) = guard.as_ref() else {
            return Ok(frames.iter().map(|buffers| RxOutcome::pass(buffers)).collect());
        };

        let frame_capacity = rings.frame_ring.capacity() as usize;
        let fragment_capacity = rings
            .fragment_ring
            .as_ref()
            .map_or(0, |ring| ring.capacity() as usize);

        let mut outcomes = Vec::with_capacity(frames.len());
        let mut start = 0;
        while start < frames.len() {
            let mut end = start;
            let mut fragments = 0;
            while end < frames.len() && end - start < frame_capacity {
                let needed = frames[end].len() - 1;
                if fragments + needed > fragment_capacity {
                    break;
                }
                fragments += needed;
                end += 1;
            }
            self.inject_batch(rings, &frames[start..end], &mut outcomes)?;
            start = end;
        }
        Ok(outcomes)
    }

    fn inject_batch(
        &self,
        rings: &SoftRxRings,
        frames: &[Vec<&[u8]>],
        outcomes: &mut Vec<RxOutcome>,
    ) -> Result<()> {
        let mut storage: Vec<Vec<Vec<u8>>> = frames
            .iter()
            .map(|buffers| buffers.iter().map(|data| data.to_vec()).collect())
            .collect();
        let fragment_total: u32 = frames.iter().map(|buffers| buffers.len() as u32 - 1).sum();

        let count = frames.len() as u32;
        if rings.frame_ring.reserve_producer(count) != count {
            return Err(DatapathError::Exhausted(format!(
                "RX frame ring of queue {} is full",
                self.queue_id
            )));
        }
        if fragment_total > 0 {
            let reserved = rings
                .fragment_ring
                .as_ref()
                .map_or(0, |ring| ring.reserve_producer(fragment_total));
            if reserved != fragment_total {
                return Err(DatapathError::Exhausted(format!(
                    "RX fragment ring of queue {} is full",
                    self.queue_id
                )));
            }
        }

        let frame_start = rings.frame_ring.producer_index();
        let mut fragment_slot = rings
            .fragment_ring
            .as_ref()
            .map_or(0, |ring| ring.producer_index());
        for (i, buffers) in storage.iter_mut().enumerate() {
            let record = rings.frame_ring.element(frame_start.wrapping_add(i as u32));
            let (first, rest) = buffers.split_at_mut(1);
            // SAFETY: the slots were reserved above and the records carry the
            // extensions resolved at activation. The storage outlives the
            // receive call below.
            unsafe {
                write_buffer(record, rings.virtual_address, &mut first[0])?;
                rings.rx_action.field::<FrameRxAction>(record).write(FrameRxAction {
                    rx_action: RxAction::Pass as u8,
                });
                if let Some(fragment) = rings.fragment {
                    fragment.field::<FrameFragment>(record).write(FrameFragment {
                        fragment_buffer_count: rest.len() as u8,
                    });
                }
                if let Some(fragment_ring) = &rings.fragment_ring {
                    for data in rest.iter_mut() {
                        write_buffer(fragment_ring.element(fragment_slot), rings.virtual_address, data)?;
                        fragment_slot = fragment_slot.wrapping_add(1);
                    }
                }
            }
        }
        if let Some(fragment_ring) = &rings.fragment_ring {
            fragment_ring.commit_producer(fragment_total);
        }
        rings.frame_ring.commit_producer(count);

        self.dispatch.receive();
        self.dispatch.flush_receive();

        for (i, buffers) in storage.into_iter().enumerate() {
            let record = rings.frame_ring.element(frame_start.wrapping_add(i as u32));
            // SAFETY: the datapath handed the frame back in flush_receive.
            let action = unsafe { rings.rx_action.field::<FrameRxAction>(record).read() };
            outcomes.push(RxOutcome {
                action: RxAction::from_u8(action.rx_action),
                data: buffers.concat(),
            });
        }
        Ok(())
    }
}

/// Fill the buffer record at `record` to describe `data`.
///
/// # Safety
///
/// `record` must be a buffer record carrying `virtual_address`, and `data`
/// must stay alive and unmoved while the datapath owns the record.
unsafe fn write_buffer(record: std::ptr::NonNull<u8>, virtual_address: Extension, data: &mut Vec<u8>) -> Result<()> {
    let length = u32::try_from(data.len())
        .map_err(|_| DatapathError::InvalidParameter("buffer exceeds 4 GiB".into()))?;
    // SAFETY: forwarded to the caller.
    unsafe {
        record.cast::<Buffer>().write(Buffer {
            data_offset: 0,
            data_length: length,
            buffer_length: length,
            reserved: 0,
        });
        virtual_address
            .field::<BufferVirtualAddress>(record)
            .write(BufferVirtualAddress {
                virtual_address: data.as_mut_ptr(),
            });
    }
    Ok(())
}

struct SoftRxHandle(Arc<SoftRxQueue>);

impl InterfaceRxQueue for SoftRxHandle {
    fn activate(&self, config: &RxQueueConfigActivate) -> Result<()> {
        let fragment = match config.fragment_ring() {
            Some(_) => Some(config.get_extension(&FRAME_FRAGMENT)?),
            None => None,
        };
        let rings = SoftRxRings {
            frame_ring: config.frame_ring().clone(),
            // Holds max(max_fragments, ring_size) buffers, not ring_size *
            // max_fragments: a batch posts no more fragments than it has room for.
            fragment_ring: config.fragment_ring().cloned(),
            virtual_address: config.get_extension(&BUFFER_VIRTUAL_ADDRESS)?,
            fragment,
            rx_action: config.get_extension(&FRAME_RX_ACTION)?,
        };
        *self.0.rings.lock() = Some(rings);
        tracing::debug!(queue_id = self.0.queue_id, "soft RX queue activated");
        Ok(())
    }

    fn notify(&self, flags: NotifyQueueFlags) {
        if flags.contains(NotifyQueueFlags::RX_FLUSH) {
            // Serialized with injection by the rings lock.
            let _rings = self.0.rings.lock();
            self.0.dispatch.flush_receive();
        }
    }
}

struct SoftTxRings {
    frame_ring: Arc<Ring>,
    completion_ring: Option<Arc<Ring>>,
    virtual_address: Option<Extension>,
    logical_address: Option<Extension>,
    mdl: Option<Extension>,
    frame_context: Extension,
    completion_context: Option<Extension>,
}

impl SoftTxRings {
    /// Start of the data of the frame at `record`, and its completion
    /// address
    ///
    /// # Safety
    ///
    /// `record` must be a produced frame record of this queue.
    unsafe fn locate(&self, record: std::ptr::NonNull<u8>, buffer: &Buffer) -> Option<(*const u8, u64)> {
        // SAFETY: forwarded to the caller; every address is the host address
        // of the payload region.
        unsafe {
            if let Some(va) = self.virtual_address {
                let base = va.field::<BufferVirtualAddress>(record).read().virtual_address;
                return Some((base.add(buffer.data_offset as usize), base as usize as u64));
            }
            if let Some(la) = self.logical_address {
                let base = la.field::<BufferLogicalAddress>(record).read().logical_address;
                let data = (base as usize as *const u8).add(buffer.data_offset as usize);
                return Some((data, base));
            }
            if let Some(mdl) = self.mdl {
                let region = mdl.field::<BufferMdl>(record).read();
                let data = ((region.mdl + region.mdl_offset) as usize as *const u8)
                    .add(buffer.data_offset as usize);
                return Some((data, region.mdl_offset));
            }
        }
        None
    }
}

struct SoftTxQueue {
    queue_id: u32,
    dispatch: TxQueueDispatch,
    rings: Mutex<Option<SoftTxRings>>,
    transmitted: Mutex<Vec<Vec<u8>>>,
}

impl SoftTxQueue {
    /// Pull and transmit until the datapath has nothing more to give
    fn pull(&self) {
        let guard = self.rings.lock();
        let Some(rings) = guard.as_ref() else {
            return;
        };
        loop {
            let produced = self.dispatch.flush_transmit(rings.frame_ring.capacity());
            let sent = self.transmit(rings);
            if produced == 0 && sent == 0 {
                break;
            }
        }
    }

    fn transmit(&self, rings: &SoftTxRings) -> u32 {
        let frame_ring = &rings.frame_ring;
        let mut sent = 0;
        while frame_ring.used_count() > 0 {
            let index = frame_ring.consumer_index();
            let record = frame_ring.element(index);
            // SAFETY: [consumer, producer) holds frames produced by the
            // datapath for this queue.
            let buffer = unsafe { record.cast::<Buffer>().read() };
            // SAFETY: as above.
            let Some((data, address)) = (unsafe { rings.locate(record, &buffer) }) else {
                break;
            };

            if let Some(completion_ring) = &rings.completion_ring {
                if completion_ring.reserve_producer(1) == 0 {
                    break;
                }
                let slot = completion_ring.element(completion_ring.producer_index());
                // SAFETY: the completion slot was reserved above and its layout
                // carries the completion context.
                unsafe {
                    let owner = rings.frame_context.field::<TxCompletionContext>(record).read();
                    slot.cast::<TxFrameCompletion>().write(TxFrameCompletion {
                        buffer_address: address,
                    });
                    if let Some(context) = rings.completion_context {
                        context.field::<TxCompletionContext>(slot).write(owner);
                    }
                }
            }

            // SAFETY: the datapath guarantees the data range lies inside the
            // payload region it mapped for this frame.
            let payload =
                unsafe { std::slice::from_raw_parts(data, buffer.data_length as usize) }.to_vec();
            self.transmitted.lock().push(payload);

            if let Some(completion_ring) = &rings.completion_ring {
                completion_ring.commit_producer(1);
            }
            frame_ring.release_consumer(1);
            sent += 1;
        }
        if sent > 0 {
            tracing::trace!(queue_id = self.queue_id, sent, "soft TX transmitted");
        }
        sent
    }
}

struct SoftTxHandle(Arc<SoftTxQueue>);

impl InterfaceTxQueue for SoftTxHandle {
    fn activate(&self, config: &TxQueueConfigActivate) -> Result<()> {
        let optional = |info: &ExtensionInfo| config.get_extension(info).ok();
        let completion_context = if config.is_out_of_order_completion_enabled() {
            Some(config.get_extension(&TX_COMPLETION_CONTEXT)?)
        } else {
            None
        };
        let rings = SoftTxRings {
            frame_ring: config.frame_ring().clone(),
            completion_ring: config.completion_ring().cloned(),
            virtual_address: optional(&BUFFER_VIRTUAL_ADDRESS),
            logical_address: optional(&BUFFER_LOGICAL_ADDRESS),
            mdl: optional(&BUFFER_MDL),
            frame_context: config.get_extension(&FRAME_TX_COMPLETION_CONTEXT)?,
            completion_context,
        };
        *self.0.rings.lock() = Some(rings);
        tracing::debug!(queue_id = self.0.queue_id, "soft TX queue activated");
        Ok(())
    }

    fn notify(&self, flags: NotifyQueueFlags) {
        if flags.contains(NotifyQueueFlags::TX) {
            self.0.pull();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatapathConfig;
    use crate::interface::HookId;
    use crate::program::{Privilege, Program, ProgramFlags, Rule, RuleAction, RuleMatch};
    use crate::state::State;

    fn attach(soft: &Arc<SoftInterface>, rules: Vec<Rule>) -> (Arc<State>, crate::program::ProgramHandle) {
        let state = State::new(DatapathConfig::default()).unwrap();
        state.register_interface(soft.clone()).unwrap();
        let handle = Program::create(
            &state,
            soft.config().if_index,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::empty(),
            rules,
            Privilege::User,
        )
        .unwrap();
        (state, handle)
    }

    #[test]
    fn test_config_defaults_from_partial_toml() {
        let config: SoftInterfaceConfig = toml::from_str("queue_count = 4\nmode = \"native\"").unwrap();
        assert_eq!(config.queue_count, 4);
        assert_eq!(config.mode, InterfaceMode::Native);
        assert_eq!(config.max_fragments, 4);
        assert!(config.tx_action_supported);
    }

    #[test]
    fn test_rejects_unknown_queue() {
        let soft = SoftInterface::new(SoftInterfaceConfig::default());
        assert!(matches!(
            soft.inject(1, &[b"x".as_slice()]),
            Err(DatapathError::InvalidParameter(_))
        ));
        assert!(soft.transmitted(0).is_empty());
    }

    #[test]
    fn test_batches_larger_than_ring() {
        let soft = SoftInterface::new(SoftInterfaceConfig::default());
        let (_state, _handle) = attach(&soft, vec![Rule::new(RuleMatch::All, RuleAction::Drop)]);
        assert!(soft.has_rx_queue(0));

        let frame = [0u8; 64];
        let frames: Vec<&[u8]> = (0..100).map(|_| frame.as_slice()).collect();
        let outcomes = soft.inject(0, &frames).unwrap();
        assert_eq!(outcomes.len(), 100);
        assert!(outcomes.iter().all(|o| o.action == RxAction::Drop));
    }

    #[test]
    fn test_fragment_limit() {
        let soft = SoftInterface::new(SoftInterfaceConfig {
            max_fragments: 1,
            ..Default::default()
        });
        let (_state, _handle) = attach(&soft, vec![Rule::new(RuleMatch::All, RuleAction::Pass)]);
        let a = [1u8; 10];
        let b = [2u8; 10];
        let c = [3u8; 10];
        let ok = soft.inject_fragmented(0, &[vec![&a[..], &b[..]]]).unwrap();
        assert_eq!(ok[0].data.len(), 20);
        assert!(matches!(
            soft.inject_fragmented(0, &[vec![&a[..], &b[..], &c[..]]]),
            Err(DatapathError::InvalidParameter(_))
        ));
        assert!(matches!(
            soft.inject_fragmented(0, &[vec![]]),
            Err(DatapathError::InvalidParameter(_))
        ));
    }
}
