//! Interface driver contract
//!
//! A driver owns the frames it produces into an RX queue's rings and the
//! frames it consumes from a TX queue's rings. The datapath hands it the ring
//! geometry at activation, and the driver calls back through
//! [`RxQueueDispatch`] and [`TxQueueDispatch`] to run inspection and
//! transmit.
//!
//! Creation is a negotiation: the driver fills in capabilities and registers
//! the extension versions it provides on the `*ConfigCreate` structure. The
//! queue then lays out records and allocates rings before calling
//! `activate`. Dropping the returned queue object deletes it.

use crate::error::{DatapathError, Result};
use crate::rx::RxQueue;
use crate::tx::TxQueue;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use sluice_core::extension::{Extension, ExtensionInfo, ExtensionSet, ExtensionType};
use sluice_core::frame::{BUFFER_INTERFACE_CONTEXT, FRAME_INTERFACE_CONTEXT};
use sluice_core::header::size_of_u16;
use sluice_core::{ObjectHeader, Ring, Versioned};
use std::sync::{Arc, Weak};

bitflags! {
    /// Reasons a queue pokes its driver
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NotifyQueueFlags: u32 {
        /// Run `flush_receive` soon
        const RX_FLUSH = 0x1;
        /// Frames are waiting to be transmitted
        const TX = 0x2;
    }
}

/// How an interface is attached to the datapath
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceMode {
    /// Frames are copied through a generic path
    Generic,
    /// The driver hosts the rings directly
    Native,
}

/// Protocol layer of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookLayer {
    /// Ethernet frames
    L2,
}

/// Traffic direction of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookDirection {
    /// Inbound
    Rx,
    /// Outbound
    Tx,
}

/// Position of a hook within its layer and direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookSubLayer {
    /// Classify frames
    Inspect,
    /// Insert frames
    Inject,
}

/// Attachment point of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId {
    /// Layer
    pub layer: HookLayer,
    /// Direction
    pub direction: HookDirection,
    /// Sub-layer
    pub sub_layer: HookSubLayer,
}

impl HookId {
    /// Inbound inspection, where programs attach
    pub const RX_INSPECT: HookId = HookId {
        layer: HookLayer::L2,
        direction: HookDirection::Rx,
        sub_layer: HookSubLayer::Inspect,
    };

    /// Outbound injection, where sockets transmit
    pub const TX_INJECT: HookId = HookId {
        layer: HookLayer::L2,
        direction: HookDirection::Tx,
        sub_layer: HookSubLayer::Inject,
    };
}

impl std::fmt::Display for HookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{:?}/{:?}", self.layer, self.direction, self.sub_layer)
    }
}

/// RX features of a driver queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxCapabilities {
    /// Structure header
    pub header: ObjectHeader,
    /// Buffers carry a process virtual address
    pub virtual_address_supported: bool,
    /// Preferred frame ring size, zero for no preference
    pub receive_frame_count_hint: u16,
    /// Most fragment buffers a frame may use, zero for single-buffer frames
    pub maximum_fragments: u8,
    /// The driver honors [`sluice_core::RxAction::Tx`]
    pub tx_action_supported: bool,
}

impl RxCapabilities {
    /// Virtual-address capabilities of the current revision
    pub fn new(maximum_fragments: u8, tx_action_supported: bool) -> Self {
        Self {
            header: Self::current_header(),
            virtual_address_supported: true,
            receive_frame_count_hint: 0,
            maximum_fragments,
            tx_action_supported,
        }
    }
}

impl Versioned for RxCapabilities {
    const REVISION: u8 = 1;
    const REVISION_SIZE: u16 = size_of_u16::<RxCapabilities>();

    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

/// Size and alignment of driver-private frame and buffer contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorContexts {
    /// Structure header
    pub header: ObjectHeader,
    /// Bytes of private context per frame
    pub frame_context_size: u8,
    /// Alignment of the frame context
    pub frame_context_alignment: u8,
    /// Bytes of private context per buffer
    pub buffer_context_size: u8,
    /// Alignment of the buffer context
    pub buffer_context_alignment: u8,
}

impl DescriptorContexts {
    /// Contexts of the current revision
    pub fn new(frame: (u8, u8), buffer: (u8, u8)) -> Self {
        Self {
            header: Self::current_header(),
            frame_context_size: frame.0,
            frame_context_alignment: frame.1,
            buffer_context_size: buffer.0,
            buffer_context_alignment: buffer.1,
        }
    }

    /// Size and enable the interface-context extensions of a queue's sets
    pub(crate) fn apply(&self, frames: &mut ExtensionSet, buffers: &mut ExtensionSet) -> Result<()> {
        let contexts = [
            (
                frames,
                FRAME_INTERFACE_CONTEXT.name,
                self.frame_context_size,
                self.frame_context_alignment,
            ),
            (
                buffers,
                BUFFER_INTERFACE_CONTEXT.name,
                self.buffer_context_size,
                self.buffer_context_alignment,
            ),
        ];
        for (set, name, size, alignment) in contexts {
            if (size == 0) != (alignment == 0) {
                return Err(DatapathError::InvalidParameter(format!(
                    "{name}: size {size} and alignment {alignment} must both be zero or non-zero"
                )));
            }
            if size > 0 {
                set.resize(name, size, alignment)?;
                set.set_internal(name)?;
                set.enable(name)?;
            }
        }
        Ok(())
    }
}

impl Versioned for DescriptorContexts {
    const REVISION: u8 = 1;
    const REVISION_SIZE: u16 = size_of_u16::<DescriptorContexts>();

    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

/// Private contexts of an RX queue
pub type RxDescriptorContexts = DescriptorContexts;
/// Private contexts of a TX queue
pub type TxDescriptorContexts = DescriptorContexts;

/// TX features of a driver queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCapabilities {
    /// Structure header
    pub header: ObjectHeader,
    /// Buffers carry a process virtual address
    pub virtual_address_enabled: bool,
    /// Buffers carry a memory-region descriptor
    pub mdl_enabled: bool,
    /// Buffers carry a device logical address
    pub dma_enabled: bool,
    /// Preferred frame ring size, zero for no preference
    pub transmit_frame_count_hint: u16,
    /// Largest buffer the driver accepts
    pub maximum_buffer_size: u32,
    /// Largest frame the driver accepts
    pub maximum_frame_size: u32,
    /// Fragments per frame; TX frames are single-buffer, so at most one
    pub maximum_fragments: u8,
    /// Completions are reported through a completion ring
    pub out_of_order_completion_enabled: bool,
}

impl TxCapabilities {
    /// Virtual-address capabilities of the current revision
    pub fn new(maximum_buffer_size: u32, maximum_frame_size: u32) -> Self {
        Self {
            header: Self::current_header(),
            virtual_address_enabled: true,
            mdl_enabled: false,
            dma_enabled: false,
            transmit_frame_count_hint: 0,
            maximum_buffer_size,
            maximum_frame_size,
            maximum_fragments: 0,
            out_of_order_completion_enabled: false,
        }
    }
}

impl Versioned for TxCapabilities {
    const REVISION: u8 = 1;
    const REVISION_SIZE: u16 = size_of_u16::<TxCapabilities>();

    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

/// Negotiation state handed to [`InterfaceDriver::create_rx_queue`]
pub struct RxQueueConfigCreate {
    queue_id: u32,
    pub(crate) frame_extensions: ExtensionSet,
    pub(crate) buffer_extensions: ExtensionSet,
    pub(crate) capabilities: Option<RxCapabilities>,
    pub(crate) descriptor_contexts: Option<RxDescriptorContexts>,
    dispatch: RxQueueDispatch,
}

impl RxQueueConfigCreate {
    pub(crate) fn new(
        queue_id: u32,
        frame_extensions: ExtensionSet,
        buffer_extensions: ExtensionSet,
        dispatch: RxQueueDispatch,
    ) -> Self {
        Self {
            queue_id,
            frame_extensions,
            buffer_extensions,
            capabilities: None,
            descriptor_contexts: None,
            dispatch,
        }
    }

    /// Queue being created
    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    /// Entry points the driver calls to run inspection
    pub fn dispatch(&self) -> RxQueueDispatch {
        self.dispatch.clone()
    }

    /// Declare the driver's RX capabilities
    pub fn set_capabilities(&mut self, capabilities: RxCapabilities) -> Result<()> {
        capabilities.validate_header()?;
        self.capabilities = Some(capabilities);
        Ok(())
    }

    /// Declare the driver's private descriptor contexts
    pub fn set_descriptor_contexts(&mut self, contexts: RxDescriptorContexts) -> Result<()> {
        contexts.validate_header()?;
        self.descriptor_contexts = Some(contexts);
        Ok(())
    }

    /// Declare that the driver provides `info`
    pub fn register_extension_version(&mut self, info: &ExtensionInfo) -> Result<()> {
        match info.extension_type {
            ExtensionType::Frame => self.frame_extensions.register_version(info)?,
            ExtensionType::Buffer => self.buffer_extensions.register_version(info)?,
            ExtensionType::TxFrameCompletion => {
                return Err(DatapathError::InvalidParameter(format!(
                    "RX queues have no completion extension {}",
                    info.name
                )));
            }
        }
        Ok(())
    }
}

/// Ring geometry handed to [`InterfaceRxQueue::activate`]
pub struct RxQueueConfigActivate {
    pub(crate) frame_ring: Arc<Ring>,
    pub(crate) fragment_ring: Option<Arc<Ring>>,
    pub(crate) frame_extensions: ExtensionSet,
    pub(crate) buffer_extensions: ExtensionSet,
}

impl RxQueueConfigActivate {
    /// Ring the driver produces frames into
    pub fn frame_ring(&self) -> &Arc<Ring> {
        &self.frame_ring
    }

    /// Ring the driver produces fragment buffers into
    pub fn fragment_ring(&self) -> Option<&Arc<Ring>> {
        self.fragment_ring.as_ref()
    }

    /// Offset of an enabled frame or buffer extension
    pub fn get_extension(&self, info: &ExtensionInfo) -> Result<Extension> {
        let extension = match info.extension_type {
            ExtensionType::Frame => self.frame_extensions.get_extension(info)?,
            ExtensionType::Buffer => self.buffer_extensions.get_extension(info)?,
            ExtensionType::TxFrameCompletion => {
                return Err(DatapathError::InvalidParameter(format!(
                    "RX queues have no completion extension {}",
                    info.name
                )));
            }
        };
        Ok(extension)
    }
}

/// Negotiation state handed to [`InterfaceDriver::create_tx_queue`]
pub struct TxQueueConfigCreate {
    queue_id: u32,
    pub(crate) frame_extensions: ExtensionSet,
    pub(crate) buffer_extensions: ExtensionSet,
    pub(crate) completion_extensions: ExtensionSet,
    pub(crate) capabilities: Option<TxCapabilities>,
    pub(crate) descriptor_contexts: Option<TxDescriptorContexts>,
    dispatch: TxQueueDispatch,
}

impl TxQueueConfigCreate {
    pub(crate) fn new(
        queue_id: u32,
        frame_extensions: ExtensionSet,
        buffer_extensions: ExtensionSet,
        completion_extensions: ExtensionSet,
        dispatch: TxQueueDispatch,
    ) -> Self {
        Self {
            queue_id,
            frame_extensions,
            buffer_extensions,
            completion_extensions,
            capabilities: None,
            descriptor_contexts: None,
            dispatch,
        }
    }

    /// Queue being created
    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    /// Entry point the driver calls to pull frames
    pub fn dispatch(&self) -> TxQueueDispatch {
        self.dispatch.clone()
    }

    /// Declare the driver's TX capabilities
    pub fn set_capabilities(&mut self, capabilities: TxCapabilities) -> Result<()> {
        capabilities.validate_header()?;
        if capabilities.maximum_fragments > 1 {
            return Err(DatapathError::InvalidParameter(
                "TX frames support at most one fragment".into(),
            ));
        }
        self.capabilities = Some(capabilities);
        Ok(())
    }

    /// Declare the driver's private descriptor contexts
    pub fn set_descriptor_contexts(&mut self, contexts: TxDescriptorContexts) -> Result<()> {
        contexts.validate_header()?;
        self.descriptor_contexts = Some(contexts);
        Ok(())
    }

    /// Declare that the driver provides `info`
    pub fn register_extension_version(&mut self, info: &ExtensionInfo) -> Result<()> {
        match info.extension_type {
            ExtensionType::Frame => self.frame_extensions.register_version(info)?,
            ExtensionType::Buffer => self.buffer_extensions.register_version(info)?,
            ExtensionType::TxFrameCompletion => self.completion_extensions.register_version(info)?,
        }
        Ok(())
    }
}

/// Ring geometry handed to [`InterfaceTxQueue::activate`]
pub struct TxQueueConfigActivate {
    pub(crate) frame_ring: Arc<Ring>,
    pub(crate) completion_ring: Option<Arc<Ring>>,
    pub(crate) frame_extensions: ExtensionSet,
    pub(crate) buffer_extensions: ExtensionSet,
    pub(crate) completion_extensions: ExtensionSet,
}

impl TxQueueConfigActivate {
    /// Ring the driver consumes frames from
    pub fn frame_ring(&self) -> &Arc<Ring> {
        &self.frame_ring
    }

    /// Ring the driver produces completions into, in out-of-order mode
    pub fn completion_ring(&self) -> Option<&Arc<Ring>> {
        self.completion_ring.as_ref()
    }

    /// Whether completions go through the completion ring
    pub fn is_out_of_order_completion_enabled(&self) -> bool {
        self.completion_ring.is_some()
    }

    /// Offset of an enabled frame, buffer or completion extension
    pub fn get_extension(&self, info: &ExtensionInfo) -> Result<Extension> {
        let extension = match info.extension_type {
            ExtensionType::Frame => self.frame_extensions.get_extension(info)?,
            ExtensionType::Buffer => self.buffer_extensions.get_extension(info)?,
            ExtensionType::TxFrameCompletion => self.completion_extensions.get_extension(info)?,
        };
        Ok(extension)
    }
}

/// A network interface the datapath can attach to
pub trait InterfaceDriver: Send + Sync {
    /// Interface index
    fn if_index(&self) -> u32;

    /// Attachment mode
    fn mode(&self) -> InterfaceMode;

    /// Number of RX/TX queue pairs
    fn queue_count(&self) -> u32;

    /// Create an RX queue, negotiating capabilities through `config`
    fn create_rx_queue(&self, config: &mut RxQueueConfigCreate)
    -> Result<Box<dyn InterfaceRxQueue>>;

    /// Create a TX queue, negotiating capabilities through `config`
    fn create_tx_queue(&self, config: &mut TxQueueConfigCreate)
    -> Result<Box<dyn InterfaceTxQueue>>;
}

/// Driver side of an RX queue. Dropping it deletes the queue.
pub trait InterfaceRxQueue: Send + Sync {
    /// Start producing frames into the rings
    fn activate(&self, config: &RxQueueConfigActivate) -> Result<()>;

    /// Poke the driver
    fn notify(&self, flags: NotifyQueueFlags);
}

/// Driver side of a TX queue. Dropping it deletes the queue.
pub trait InterfaceTxQueue: Send + Sync {
    /// Start consuming frames from the rings
    fn activate(&self, config: &TxQueueConfigActivate) -> Result<()>;

    /// Poke the driver
    fn notify(&self, flags: NotifyQueueFlags);
}

/// Driver-to-datapath entry points of an RX queue
#[derive(Clone)]
pub struct RxQueueDispatch {
    queue: Weak<RxQueue>,
}

impl RxQueueDispatch {
    pub(crate) fn new(queue: Weak<RxQueue>) -> Self {
        Self { queue }
    }

    /// Inspect every frame the driver has produced
    pub fn receive(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.receive();
        }
    }

    /// End of a receive cycle: release unconsumed frames and run control
    /// callbacks waiting on the queue
    pub fn flush_receive(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.flush_receive();
        }
    }
}

/// Driver-to-datapath entry point of a TX queue
#[derive(Clone)]
pub struct TxQueueDispatch {
    queue: Weak<TxQueue>,
}

impl TxQueueDispatch {
    pub(crate) fn new(queue: Weak<TxQueue>) -> Self {
        Self { queue }
    }

    /// Reap completions, then produce up to `available` frames. Returns the
    /// number produced.
    pub fn flush_transmit(&self, available: u32) -> u32 {
        match self.queue.upgrade() {
            Some(queue) => queue.flush_transmit(available),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::frame::{
        BUFFER_VIRTUAL_ADDRESS, FRAME_FRAGMENT, RX_BUFFER_EXTENSIONS, RX_FRAME_EXTENSIONS,
        TX_COMPLETION_CONTEXT, TX_COMPLETION_EXTENSIONS, TX_BUFFER_EXTENSIONS,
        TX_FRAME_EXTENSIONS,
    };

    fn rx_config() -> RxQueueConfigCreate {
        RxQueueConfigCreate::new(
            0,
            ExtensionSet::new(ExtensionType::Frame, &RX_FRAME_EXTENSIONS).unwrap(),
            ExtensionSet::new(ExtensionType::Buffer, &RX_BUFFER_EXTENSIONS).unwrap(),
            RxQueueDispatch::new(Weak::new()),
        )
    }

    #[test]
    fn test_rejects_stale_capabilities() {
        let mut config = rx_config();
        let mut caps = RxCapabilities::new(0, false);
        caps.header.size -= 1;
        assert!(config.set_capabilities(caps).is_err());

        let mut caps = RxCapabilities::new(0, false);
        caps.header.revision = 0;
        assert!(config.set_capabilities(caps).is_err());

        assert!(config.set_capabilities(RxCapabilities::new(4, true)).is_ok());
        assert_eq!(config.capabilities.unwrap().maximum_fragments, 4);
    }

    #[test]
    fn test_extension_registration_routes_by_type() {
        let mut config = rx_config();
        config.register_extension_version(&BUFFER_VIRTUAL_ADDRESS).unwrap();
        config.register_extension_version(&FRAME_FRAGMENT).unwrap();
        assert!(config.register_extension_version(&TX_COMPLETION_CONTEXT).is_err());
    }

    #[test]
    fn test_tx_capabilities_limit_fragments() {
        let mut config = TxQueueConfigCreate::new(
            1,
            ExtensionSet::new(ExtensionType::Frame, &TX_FRAME_EXTENSIONS).unwrap(),
            ExtensionSet::new(ExtensionType::Buffer, &TX_BUFFER_EXTENSIONS).unwrap(),
            ExtensionSet::new(ExtensionType::TxFrameCompletion, &TX_COMPLETION_EXTENSIONS)
                .unwrap(),
            TxQueueDispatch::new(Weak::new()),
        );
        let mut caps = TxCapabilities::new(2048, 2048);
        caps.maximum_fragments = 2;
        assert!(config.set_capabilities(caps).is_err());
        caps.maximum_fragments = 1;
        config.set_capabilities(caps).unwrap();
        assert_eq!(config.queue_id(), 1);
    }

    #[test]
    fn test_dead_dispatch_is_inert() {
        RxQueueDispatch::new(Weak::new()).receive();
        assert_eq!(TxQueueDispatch::new(Weak::new()).flush_transmit(8), 0);
    }

    #[test]
    fn test_descriptor_contexts_size_interface_context() {
        let mut config = rx_config();
        let contexts = DescriptorContexts::new((16, 8), (0, 0));
        contexts
            .apply(&mut config.frame_extensions, &mut config.buffer_extensions)
            .unwrap();
        assert!(config.frame_extensions.is_enabled(FRAME_INTERFACE_CONTEXT.name).unwrap());
        assert!(!config.buffer_extensions.is_enabled(BUFFER_INTERFACE_CONTEXT.name).unwrap());

        let bad = DescriptorContexts::new((16, 0), (0, 0));
        assert!(bad
            .apply(&mut config.frame_extensions, &mut config.buffer_extensions)
            .is_err());
    }

    #[test]
    fn test_hook_display() {
        assert_eq!(HookId::RX_INSPECT.to_string(), "L2/Rx/Inspect");
        assert_ne!(HookId::RX_INSPECT, HookId::TX_INJECT);
    }
}
