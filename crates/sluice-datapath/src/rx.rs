//! RX queue pipeline
//!
//! One queue per `(hook, queue_id)` of a bound interface. The driver produces
//! frames into the frame ring (and the fragment ring for multi-buffer
//! frames), then calls [`RxQueueDispatch::receive`] to classify them and
//! [`RxQueueDispatch::flush_receive`] to end the cycle.
//!
//! State is split in two:
//!
//! - **control** (bindings, driver queue, capabilities) is only touched from
//!   the interface work queue;
//! - **datapath** (rules, dispatch, rings, scratch space, redirect batch) is
//!   owned by the driver's receive context. Control code changes it through
//!   [`QueueSync`], which runs callbacks inside `flush_receive`.
//!
//! [`RxQueueDispatch::receive`]: crate::interface::RxQueueDispatch::receive
//! [`RxQueueDispatch::flush_receive`]: crate::interface::RxQueueDispatch::flush_receive

use crate::error::{DatapathError, Result};
use crate::interface::{
    HookId, InterfaceDriver, InterfaceRxQueue, NotifyQueueFlags, RxCapabilities,
    RxQueueConfigActivate, RxQueueConfigCreate, RxQueueDispatch,
};
use crate::program::inspect::{Inspector, Verdict, inspect_bytecode};
use crate::program::{BytecodeProgram, RedirectTarget, Rule, RuleAction, RuleMatch, compile};
use crate::redirect::RedirectContext;
use crate::state::next_object_id;
use crate::stats::{RxQueueStats, RxQueueStatsSnapshot};
use crate::sync::QueueSync;
use crate::xsk::Xsk;
use parking_lot::Mutex;
use sluice_core::frame::{
    BUFFER_VIRTUAL_ADDRESS, FRAME_FRAGMENT, FRAME_RX_ACTION, FrameRxAction, RX_BUFFER_EXTENSIONS,
    RX_FRAME_EXTENSIONS,
};
use sluice_core::{
    Extension, ExtensionSet, ExtensionType, FrameAccess, FrameBuffers, RecordLayout, Ring,
    RxAction,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identity of a queue within an interface binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueKey {
    /// Attachment point
    pub hook: HookId,
    /// Interface queue index
    pub queue_id: u32,
}

/// Lifecycle events delivered to queue observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxQueueNotification {
    /// The driver queue exists and frames may arrive
    Attach,
    /// The driver queue is about to be deleted
    Detach,
    /// The driver queue is gone
    DetachComplete,
    /// The interface was removed; the queue will never attach again
    Delete,
}

/// Observer of queue lifecycle events, invoked inline on the control path
pub type RxQueueObserver = Arc<dyn Fn(&RxQueue, RxQueueNotification) + Send + Sync>;

/// Rings and resolved extensions of an attached queue
pub(crate) struct RxRings {
    pub(crate) frame_ring: Arc<Ring>,
    pub(crate) fragment_ring: Option<Arc<Ring>>,
    access: FrameAccess,
    rx_action: Extension,
}

impl RxRings {
    /// View over the frame at `frame_index` whose fragments start at
    /// `fragment_index`.
    ///
    /// # Safety
    ///
    /// The frame must be owned by the datapath: produced by the driver and not
    /// yet handed back by `flush_receive`.
    pub(crate) unsafe fn frame(&self, frame_index: u32, fragment_index: u32) -> FrameBuffers<'_> {
        // SAFETY: forwarded to the caller.
        unsafe {
            FrameBuffers::new(
                self.frame_ring.element(frame_index),
                self.fragment_ring.as_deref(),
                fragment_index,
                self.access,
            )
        }
    }

    /// First fragment slot of the frame at the consumer cursor
    pub(crate) fn fragment_cursor(&self) -> u32 {
        self.fragment_ring
            .as_ref()
            .map_or(0, |ring| ring.consumer_index())
    }

    pub(crate) fn set_action(&self, frame_index: u32, action: RxAction) {
        let record = self.frame_ring.element(frame_index);
        // SAFETY: every RX frame layout includes the rx-action extension.
        unsafe {
            self.rx_action
                .field::<FrameRxAction>(record)
                .write(FrameRxAction {
                    rx_action: action as u8,
                })
        }
    }

    /// Move past the frame at the consumer cursor and its fragments
    pub(crate) fn advance(&self, fragments: u32) {
        self.frame_ring.release_consumer(1);
        if let Some(ring) = &self.fragment_ring {
            ring.release_consumer(fragments);
        }
    }
}

/// How `receive` processes a batch
#[derive(Clone)]
enum RxDispatch {
    /// Rule engine
    Common,
    /// Byte-code program over every frame
    Bytecode(Arc<dyn BytecodeProgram>),
    /// Whole batch to one socket
    Exclusive(Arc<Xsk>),
}

impl std::fmt::Debug for RxDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RxDispatch::Common => f.write_str("Common"),
            RxDispatch::Bytecode(_) => f.write_str("Bytecode"),
            RxDispatch::Exclusive(xsk) => f.debug_tuple("Exclusive").field(&xsk.id()).finish(),
        }
    }
}

pub(crate) struct RxDatapath {
    rules: Arc<[Rule]>,
    dispatch: RxDispatch,
    rings: Option<RxRings>,
    inspector: Inspector,
    redirect: RedirectContext,
}

impl RxDatapath {
    fn reset(&mut self) {
        self.rules = empty_program();
        self.dispatch = RxDispatch::Common;
        self.rings = None;
        self.redirect.reset();
    }
}

struct RxControl {
    interface_queue: Option<Box<dyn InterfaceRxQueue>>,
    bindings: Vec<(u64, Arc<[Rule]>)>,
    compiled: Arc<[Rule]>,
    capabilities: Option<RxCapabilities>,
    deleted: bool,
}

/// Inspection queue of one interface queue
pub struct RxQueue {
    id: u64,
    key: QueueKey,
    if_index: u32,
    driver: Arc<dyn InterfaceDriver>,
    ring_size: u32,
    control: Mutex<RxControl>,
    observers: Mutex<Vec<(u64, RxQueueObserver)>>,
    datapath: Mutex<RxDatapath>,
    sync: QueueSync<RxDatapath>,
    active: AtomicBool,
    stats: RxQueueStats,
}

fn empty_program() -> Arc<[Rule]> {
    Arc::from(Vec::new())
}

fn is_bytecode(rules: &[Rule]) -> bool {
    rules
        .iter()
        .any(|rule| matches!(rule.action, RuleAction::Bytecode(_)))
}

impl RxQueue {
    pub(crate) fn new(driver: Arc<dyn InterfaceDriver>, key: QueueKey, ring_size: u32) -> Arc<Self> {
        let id = next_object_id();
        let if_index = driver.if_index();
        tracing::debug!(if_index, queue_id = key.queue_id, hook = %key.hook, "RX queue created");
        Arc::new(Self {
            id,
            key,
            if_index,
            driver,
            ring_size,
            control: Mutex::new(RxControl {
                interface_queue: None,
                bindings: Vec::new(),
                compiled: empty_program(),
                capabilities: None,
                deleted: false,
            }),
            observers: Mutex::new(Vec::new()),
            datapath: Mutex::new(RxDatapath {
                rules: empty_program(),
                dispatch: RxDispatch::Common,
                rings: None,
                inspector: Inspector::new(),
                redirect: RedirectContext::new(id),
            }),
            sync: QueueSync::new(),
            active: AtomicBool::new(false),
            stats: RxQueueStats::new(),
        })
    }

    /// Unique queue id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Interface queue index
    pub fn queue_id(&self) -> u32 {
        self.key.queue_id
    }

    /// Attachment point
    pub fn hook(&self) -> HookId {
        self.key.hook
    }

    /// Interface index
    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    /// Whether the driver queue is attached and delivering frames
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Inspection counters
    pub fn statistics(&self) -> RxQueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// Rules currently applied, in evaluation order
    pub fn compiled_program(&self) -> Arc<[Rule]> {
        self.control.lock().compiled.clone()
    }

    /// Number of attached programs
    pub fn binding_count(&self) -> usize {
        self.control.lock().bindings.len()
    }

    // Datapath

    pub(crate) fn receive(&self) {
        let mut guard = self.datapath.lock();
        let RxDatapath {
            rules,
            dispatch,
            rings,
            inspector,
            redirect,
        } = &mut *guard;
        let Some(rings) = rings.as_ref() else {
            return;
        };

        self.stats.record_batch();

        match dispatch {
            RxDispatch::Exclusive(xsk) => {
                if xsk.datapath().receive_exclusive(rings) {
                    return;
                }
            }
            RxDispatch::Bytecode(program) => {
                if program.start_batch() {
                    self.receive_bytecode(program.as_ref(), rings);
                    program.end_batch();
                    return;
                }
            }
            RxDispatch::Common => {}
        }

        self.receive_common(rules, rings, inspector, redirect);
    }

    fn receive_common(
        &self,
        rules: &[Rule],
        rings: &RxRings,
        inspector: &mut Inspector,
        redirect: &mut RedirectContext,
    ) {
        let batch = rings.frame_ring.used_count();
        for _ in 0..batch {
            let frame_index = rings.frame_ring.consumer_index();
            let fragment_index = rings.fragment_cursor();
            // SAFETY: frames in [consumer, producer) belong to the datapath
            // until flush_receive.
            let mut frame = unsafe { rings.frame(frame_index, fragment_index) };

            let verdict = inspector.classify(rules, &mut frame);
            if let Verdict::Redirect(index) = verdict
                && let RuleAction::Redirect(target) = &rules[index].action
            {
                redirect.redirect(rings, &self.stats, frame_index, fragment_index, target);
            }
            verdict.record(&self.stats);
            rings.set_action(frame_index, verdict.rx_action());
            rings.advance(frame.fragment_count());
        }

        self.stats
            .record_header_copies(inspector.take_header_copies());
        redirect.flush(rings, &self.stats);
        tracing::trace!(if_index = self.if_index, queue_id = self.key.queue_id, batch, "inspected batch");
    }

    fn receive_bytecode(&self, program: &dyn BytecodeProgram, rings: &RxRings) {
        let batch = rings.frame_ring.used_count();
        for _ in 0..batch {
            let frame_index = rings.frame_ring.consumer_index();
            // SAFETY: as in receive_common.
            let mut frame = unsafe { rings.frame(frame_index, rings.fragment_cursor()) };
            let action = inspect_bytecode(
                program,
                &mut frame,
                self.if_index,
                self.key.queue_id,
                &self.stats,
            );
            rings.set_action(frame_index, action);
            rings.advance(frame.fragment_count());
        }
    }

    pub(crate) fn flush_receive(&self) {
        let mut guard = self.datapath.lock();
        let datapath = &mut *guard;
        if let Some(rings) = &datapath.rings
            && !matches!(datapath.dispatch, RxDispatch::Exclusive(_))
        {
            datapath.redirect.flush(rings, &self.stats);
            rings
                .frame_ring
                .set_consumer_index(rings.frame_ring.producer_index());
            if let Some(fragment_ring) = &rings.fragment_ring {
                fragment_ring.set_consumer_index(fragment_ring.producer_index());
            }
        }

        let ran = self.sync.run_pending(datapath);
        if ran > 0 {
            tracing::trace!(if_index = self.if_index, queue_id = self.key.queue_id, ran, "ran queue sync callbacks");
        }
    }

    // Control

    /// Apply `update` to the datapath state, waiting for the driver to flush
    /// when the queue is active
    fn sync_datapath<F>(&self, control: &RxControl, update: F)
    where
        F: FnOnce(&mut RxDatapath) + Send + 'static,
    {
        if !self.is_active() {
            update(&mut *self.datapath.lock());
            return;
        }

        let done = self.sync.enqueue(Box::new(update));
        if let Some(interface_queue) = &control.interface_queue {
            interface_queue.notify(NotifyQueueFlags::RX_FLUSH);
        }
        if done.recv().is_err() {
            tracing::warn!(if_index = self.if_index, queue_id = self.key.queue_id, "queue sync callback dropped");
        }
    }

    fn dispatch_for(&self, rules: &[Rule]) -> RxDispatch {
        match rules {
            [
                Rule {
                    matcher: RuleMatch::All,
                    action: RuleAction::Bytecode(program),
                },
            ] => RxDispatch::Bytecode(program.clone()),
            [
                Rule {
                    matcher: RuleMatch::All,
                    action: RuleAction::Redirect(RedirectTarget::Xsk(xsk)),
                },
            ] if xsk.can_bypass(self) => RxDispatch::Exclusive(xsk.clone()),
            _ => RxDispatch::Common,
        }
    }

    /// Swap in `compiled`, returning the previous program so the caller can
    /// drop it after releasing the control lock
    fn set_program(&self, control: &mut RxControl, compiled: Arc<[Rule]>) -> Arc<[Rule]> {
        let dispatch = self.dispatch_for(&compiled);
        tracing::debug!(
            if_index = self.if_index,
            queue_id = self.key.queue_id,
            rules = compiled.len(),
            ?dispatch,
            "setting RX program"
        );

        let rules = compiled.clone();
        self.sync_datapath(control, move |datapath| {
            datapath.rules = rules;
            datapath.dispatch = dispatch;
            datapath.redirect.reset();
        });
        std::mem::replace(&mut control.compiled, compiled)
    }

    /// Attach a program binding, attaching the driver queue first if this is
    /// the first one
    pub(crate) fn attach_program(self: &Arc<Self>, binding_id: u64, rules: Arc<[Rule]>) -> Result<()> {
        let mut control = self.control.lock();
        if control.deleted {
            return Err(DatapathError::DeviceRemoved(format!(
                "interface {} was removed",
                self.if_index
            )));
        }
        if control.bindings.iter().any(|(id, _)| *id == binding_id) {
            return Err(DatapathError::DuplicateObject(format!(
                "program {binding_id} already attached to queue {}",
                self.key.queue_id
            )));
        }
        if !control.bindings.is_empty()
            && (is_bytecode(&rules) || control.bindings.iter().any(|(_, r)| is_bytecode(r)))
        {
            return Err(DatapathError::InvalidState(
                "byte-code programs cannot share a queue".into(),
            ));
        }

        if control.interface_queue.is_none() {
            let validate = |queue: &RxQueue| validate_targets(queue, &rules);
            self.attach_interface(&mut control, &validate)?;
        } else {
            validate_targets(self, &rules)?;
        }

        let tx_action_supported = control
            .capabilities
            .is_some_and(|caps| caps.tx_action_supported);
        if !tx_action_supported
            && rules
                .iter()
                .any(|rule| matches!(rule.action, RuleAction::L2Fwd))
        {
            if control.bindings.is_empty() {
                self.detach_interface(&mut control);
            }
            return Err(DatapathError::InvalidParameter(
                "L2 forwarding needs an interface that supports TX actions".into(),
            ));
        }

        control.bindings.push((binding_id, rules));
        let compiled = compile(&control.bindings);
        let previous = self.set_program(&mut control, compiled);
        drop(control);
        drop(previous);
        tracing::info!(if_index = self.if_index, queue_id = self.key.queue_id, binding_id, "program attached");
        Ok(())
    }

    /// Detach a program binding, detaching the driver queue with the last one
    pub(crate) fn detach_program(&self, binding_id: u64) -> Result<()> {
        let mut control = self.control.lock();
        let position = control
            .bindings
            .iter()
            .position(|(id, _)| *id == binding_id)
            .ok_or_else(|| {
                DatapathError::NotFound(format!(
                    "program {binding_id} on queue {}",
                    self.key.queue_id
                ))
            })?;
        let (_, removed) = control.bindings.remove(position);

        let previous = if control.bindings.is_empty() {
            self.detach_interface(&mut control);
            std::mem::replace(&mut control.compiled, empty_program())
        } else {
            let compiled = compile(&control.bindings);
            self.set_program(&mut control, compiled)
        };
        drop(control);
        drop(previous);
        drop(removed);
        tracing::info!(if_index = self.if_index, queue_id = self.key.queue_id, binding_id, "program detached");
        Ok(())
    }

    fn attach_interface(
        self: &Arc<Self>,
        control: &mut RxControl,
        validate: &dyn Fn(&RxQueue) -> Result<()>,
    ) -> Result<()> {
        let frames = ExtensionSet::new(ExtensionType::Frame, &RX_FRAME_EXTENSIONS)?;
        let buffers = ExtensionSet::new(ExtensionType::Buffer, &RX_BUFFER_EXTENSIONS)?;
        let mut create = RxQueueConfigCreate::new(
            self.key.queue_id,
            frames,
            buffers,
            RxQueueDispatch::new(Arc::downgrade(self)),
        );

        let interface_queue = self.driver.create_rx_queue(&mut create)?;
        control.interface_queue = Some(interface_queue);

        match self.activate_interface(control, create, validate) {
            Ok(()) => {
                tracing::info!(if_index = self.if_index, queue_id = self.key.queue_id, "RX queue attached");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    if_index = self.if_index,
                    queue_id = self.key.queue_id,
                    error = %e,
                    "RX queue attach failed"
                );
                self.detach_interface(control);
                Err(e)
            }
        }
    }

    fn activate_interface(
        &self,
        control: &mut RxControl,
        mut create: RxQueueConfigCreate,
        validate: &dyn Fn(&RxQueue) -> Result<()>,
    ) -> Result<()> {
        let capabilities = create.capabilities.ok_or_else(|| {
            DatapathError::Interface("driver did not declare RX capabilities".into())
        })?;
        if !capabilities.virtual_address_supported {
            return Err(DatapathError::Interface(
                "RX queues need buffer virtual addresses".into(),
            ));
        }

        create.buffer_extensions.enable(BUFFER_VIRTUAL_ADDRESS.name)?;
        create.frame_extensions.set_internal(FRAME_RX_ACTION.name)?;
        create.frame_extensions.enable(FRAME_RX_ACTION.name)?;
        if capabilities.maximum_fragments > 0 {
            create.frame_extensions.enable(FRAME_FRAGMENT.name)?;
        }
        if let Some(contexts) = create.descriptor_contexts {
            contexts.apply(&mut create.frame_extensions, &mut create.buffer_extensions)?;
        }

        let layout =
            RecordLayout::assign(&mut create.buffer_extensions, &mut create.frame_extensions)?;
        let (frame_ring, fragment_ring) =
            layout.allocate_rings(self.ring_size, capabilities.maximum_fragments as u32)?;
        let activate = RxQueueConfigActivate {
            frame_ring: Arc::new(frame_ring),
            fragment_ring: fragment_ring.map(Arc::new),
            frame_extensions: create.frame_extensions,
            buffer_extensions: create.buffer_extensions,
        };

        let fragment = match activate.fragment_ring {
            Some(_) => Some(activate.get_extension(&FRAME_FRAGMENT)?),
            None => None,
        };
        let rings = RxRings {
            frame_ring: activate.frame_ring.clone(),
            fragment_ring: activate.fragment_ring.clone(),
            access: FrameAccess {
                virtual_address: activate.get_extension(&BUFFER_VIRTUAL_ADDRESS)?,
                fragment,
            },
            rx_action: activate.get_extension(&FRAME_RX_ACTION)?,
        };

        validate(self)?;

        control.capabilities = Some(capabilities);
        {
            let mut datapath = self.datapath.lock();
            datapath.dispatch = self.dispatch_for(&control.compiled);
            datapath.rules = control.compiled.clone();
            datapath.rings = Some(rings);
            datapath.redirect.reset();
        }

        self.notify_observers(RxQueueNotification::Attach);

        control
            .interface_queue
            .as_ref()
            .ok_or_else(|| DatapathError::InvalidState("driver queue vanished".into()))?
            .activate(&activate)?;
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    fn detach_interface(&self, control: &mut RxControl) {
        self.notify_observers(RxQueueNotification::Detach);

        control.interface_queue = None;
        control.capabilities = None;
        self.active.store(false, Ordering::Release);
        {
            let mut datapath = self.datapath.lock();
            datapath.reset();
            // Nothing will flush an inactive queue; release any waiter.
            self.sync.run_pending(&mut *datapath);
        }

        self.notify_observers(RxQueueNotification::DetachComplete);
        tracing::info!(if_index = self.if_index, queue_id = self.key.queue_id, "RX queue detached");
    }

    /// The interface went away: detach and refuse further programs
    pub(crate) fn interface_removed(&self) {
        let mut control = self.control.lock();
        if control.deleted {
            return;
        }
        control.deleted = true;
        if control.interface_queue.is_some() {
            self.detach_interface(&mut control);
        }
        let bindings = std::mem::take(&mut control.bindings);
        let previous = std::mem::replace(&mut control.compiled, empty_program());
        drop(control);

        self.notify_observers(RxQueueNotification::Delete);
        drop(previous);
        drop(bindings);
    }

    /// Register for lifecycle events. An attached queue delivers `Attach`
    /// right away.
    pub fn register_notifications(&self, observer: RxQueueObserver) -> u64 {
        let id = next_object_id();
        self.observers.lock().push((id, observer.clone()));
        if self.is_active() {
            observer(self, RxQueueNotification::Attach);
        }
        id
    }

    /// Stop delivering events to observer `id`
    pub fn deregister_notifications(&self, id: u64) {
        self.observers.lock().retain(|(entry, _)| *entry != id);
    }

    fn notify_observers(&self, notification: RxQueueNotification) {
        let observers: Vec<RxQueueObserver> = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(self, notification);
        }
    }
}

impl std::fmt::Debug for RxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxQueue")
            .field("id", &self.id)
            .field("if_index", &self.if_index)
            .field("queue_id", &self.key.queue_id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Check every redirect target of `rules` against `queue`
fn validate_targets(queue: &RxQueue, rules: &[Rule]) -> Result<()> {
    for rule in rules {
        if let RuleAction::Redirect(RedirectTarget::Xsk(xsk)) = &rule.action {
            xsk.validate_redirect(queue)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatapathConfig;
    use crate::packet::PacketBuilder;
    use crate::program::{BytecodeContext, BytecodeFault, Privilege, Program, ProgramFlags};
    use crate::soft::{SoftInterface, SoftInterfaceConfig};
    use crate::state::State;
    use parking_lot::Mutex as PlMutex;
    use std::net::SocketAddrV4;

    fn setup(config: SoftInterfaceConfig) -> (Arc<State>, Arc<SoftInterface>) {
        let state = State::new(DatapathConfig::default()).unwrap();
        let soft = SoftInterface::new(config);
        state.register_interface(soft.clone()).unwrap();
        (state, soft)
    }

    fn udp(port: u16) -> Vec<u8> {
        PacketBuilder::udp_v4(
            SocketAddrV4::new([10, 0, 0, 1].into(), 4000),
            SocketAddrV4::new([10, 0, 0, 2].into(), port),
        )
        .payload(b"ping")
        .build()
    }

    #[test]
    fn test_inactive_queue_passes_frames() {
        let (_state, soft) = setup(SoftInterfaceConfig::default());
        let frame = udp(53);
        let outcome = soft.inject(0, &[&frame]).unwrap();
        assert_eq!(outcome[0].action, RxAction::Pass);
    }

    #[test]
    fn test_observer_sees_lifecycle() {
        let (state, soft) = setup(SoftInterfaceConfig::default());
        let binding = state.binding(soft.config().if_index).unwrap();
        let queue = binding.find_or_create_rx_queue(HookId::RX_INSPECT, 0).unwrap();

        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = seen.clone();
        queue.register_notifications(Arc::new(move |_: &RxQueue, n: RxQueueNotification| {
            sink.lock().push(n)
        }));

        let handle = Program::create(
            &state,
            soft.config().if_index,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::empty(),
            vec![Rule::new(RuleMatch::All, RuleAction::Drop)],
            Privilege::User,
        )
        .unwrap();
        assert!(queue.is_active());
        drop(handle);
        assert!(!queue.is_active());

        assert_eq!(
            *seen.lock(),
            vec![
                RxQueueNotification::Attach,
                RxQueueNotification::Detach,
                RxQueueNotification::DetachComplete,
            ]
        );
    }

    #[test]
    fn test_program_swap_while_active() {
        let (state, soft) = setup(SoftInterfaceConfig::default());
        let if_index = soft.config().if_index;
        let drop_all = Program::create(
            &state,
            if_index,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::empty(),
            vec![Rule::new(RuleMatch::UdpDst(53), RuleAction::Drop)],
            Privilege::User,
        )
        .unwrap();
        let frame = udp(53);
        assert_eq!(soft.inject(0, &[&frame]).unwrap()[0].action, RxAction::Drop);

        let pass = Program::create(
            &state,
            if_index,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::empty(),
            vec![Rule::new(RuleMatch::All, RuleAction::Pass)],
            Privilege::User,
        )
        .unwrap();
        drop(drop_all);
        assert_eq!(soft.inject(0, &[&frame]).unwrap()[0].action, RxAction::Pass);

        let queue = state.binding(if_index).unwrap().rx_queue(0).unwrap();
        assert_eq!(queue.compiled_program().len(), 1);
        assert_eq!(queue.statistics().inspect_batches, 2);
        drop(pass);
    }

    #[test]
    fn test_l2_forward_needs_tx_action() {
        let (state, soft) = setup(SoftInterfaceConfig {
            tx_action_supported: false,
            ..Default::default()
        });
        let result = Program::create(
            &state,
            soft.config().if_index,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::empty(),
            vec![Rule::new(RuleMatch::All, RuleAction::L2Fwd)],
            Privilege::User,
        );
        assert!(matches!(result, Err(DatapathError::InvalidParameter(_))));
        let queue = state.binding(soft.config().if_index).unwrap().rx_queue(0).unwrap();
        assert!(!queue.is_active());
    }

    #[test]
    fn test_bytecode_program_owns_queue() {
        let (state, soft) = setup(SoftInterfaceConfig::default());
        let if_index = soft.config().if_index;
        let program: Arc<dyn BytecodeProgram> = Arc::new(
            |_: &mut BytecodeContext<'_>| -> std::result::Result<u32, BytecodeFault> { Ok(2) },
        );
        let handle = Program::create(
            &state,
            if_index,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::empty(),
            vec![Rule::new(RuleMatch::All, RuleAction::Bytecode(program))],
            Privilege::Admin,
        )
        .unwrap();

        let second = Program::create(
            &state,
            if_index,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::empty(),
            vec![Rule::new(RuleMatch::All, RuleAction::Pass)],
            Privilege::User,
        );
        assert!(matches!(second, Err(DatapathError::InvalidState(_))));

        let frame = udp(80);
        assert_eq!(soft.inject(0, &[&frame]).unwrap()[0].action, RxAction::Drop);
        drop(handle);
    }

    #[test]
    fn test_interface_removal_deletes_queue() {
        let (state, soft) = setup(SoftInterfaceConfig::default());
        let if_index = soft.config().if_index;
        let handle = Program::create(
            &state,
            if_index,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::empty(),
            vec![Rule::new(RuleMatch::All, RuleAction::Drop)],
            Privilege::User,
        )
        .unwrap();
        let queue = state.binding(if_index).unwrap().rx_queue(0).unwrap();

        state.deregister_interface(if_index).unwrap();
        assert!(!queue.is_active());
        assert_eq!(queue.binding_count(), 0);
        assert!(matches!(
            queue.attach_program(u64::MAX, Arc::from(vec![Rule::new(RuleMatch::All, RuleAction::Pass)])),
            Err(DatapathError::DeviceRemoved(_))
        ));
        drop(handle);
    }
}
