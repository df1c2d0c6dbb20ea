//! Rule programs
//!
//! A program is an ordered list of [`Rule`]s attached to the RX inspection
//! hook of one or more interface queues. Every queue compiles the rules of
//! all programs attached to it, in attach order, into a single rule array
//! that the datapath evaluates first-match-wins.
//!
//! Creating a program returns a [`ProgramHandle`]; dropping the handle
//! detaches the program from every queue it was attached to.

pub mod bytecode;
pub mod headers;
pub(crate) mod inspect;
mod parse;
pub mod rule;

pub use bytecode::{
    BytecodeContext, BytecodeFault, BytecodeProgram, VERDICT_DROP, VERDICT_PASS, VERDICT_TX,
    verdict_action,
};
pub use rule::{
    Ipv4Tuple, Ipv6Tuple, PORT_SET_BUFFER_SIZE, PortSet, Privilege, QuicFlow, RedirectTarget,
    Rule, RuleAction, RuleMatch, capture,
};

use crate::error::{DatapathError, Result};
use crate::interface::{HookDirection, HookId, HookSubLayer};
use crate::rx::RxQueue;
use crate::state::{InterfaceBinding, State, next_object_id};
use crate::xsk::check_mode;
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// Attachment mode requested by a program
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProgramFlags: u32 {
        /// Require a generic-mode interface
        const GENERIC = 0x1;
        /// Require a native-mode interface
        const NATIVE = 0x2;
    }
}

/// Immutable rules of one program
#[derive(Debug)]
pub struct Program {
    id: u64,
    rules: Arc<[Rule]>,
}

impl Program {
    /// Unique program id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Captured rules
    pub fn rules(&self) -> &Arc<[Rule]> {
        &self.rules
    }

    /// Validate `rules` and attach them to queue `queue_id` of `if_index`
    pub fn create(
        state: &Arc<State>,
        if_index: u32,
        hook: HookId,
        queue_id: u32,
        flags: ProgramFlags,
        rules: Vec<Rule>,
        privilege: Privilege,
    ) -> Result<ProgramHandle> {
        let mut handle = Self::prepare(state, if_index, hook, flags, rules, privilege)?;
        handle.attach_queue(queue_id)?;
        Ok(handle)
    }

    /// Attach `rules` to every queue of `if_index`. Queues attached before a
    /// failure are detached again.
    pub fn create_all_queues(
        state: &Arc<State>,
        if_index: u32,
        hook: HookId,
        flags: ProgramFlags,
        rules: Vec<Rule>,
        privilege: Privilege,
    ) -> Result<ProgramHandle> {
        let mut handle = Self::prepare(state, if_index, hook, flags, rules, privilege)?;
        for queue_id in 0..handle.binding.queue_count() {
            handle.attach_queue(queue_id)?;
        }
        Ok(handle)
    }

    fn prepare(
        state: &Arc<State>,
        if_index: u32,
        hook: HookId,
        flags: ProgramFlags,
        rules: Vec<Rule>,
        privilege: Privilege,
    ) -> Result<ProgramHandle> {
        if hook.direction != HookDirection::Rx || hook.sub_layer != HookSubLayer::Inspect {
            return Err(DatapathError::InvalidParameter(format!(
                "programs attach to RX inspection hooks, not {hook}"
            )));
        }
        let binding = state.binding(if_index)?;
        check_mode(
            flags.contains(ProgramFlags::GENERIC),
            flags.contains(ProgramFlags::NATIVE),
            binding.mode(),
        )?;
        let rules = capture(rules, privilege)?;
        let program = Arc::new(Program {
            id: next_object_id(),
            rules,
        });
        tracing::debug!(program = program.id, if_index, rules = program.rules.len(), "program created");
        Ok(ProgramHandle {
            binding,
            program,
            hook,
            queues: Vec::new(),
        })
    }
}

/// Attachment of a program. Dropping it detaches the program.
pub struct ProgramHandle {
    binding: Arc<InterfaceBinding>,
    program: Arc<Program>,
    hook: HookId,
    queues: Vec<Arc<RxQueue>>,
}

impl ProgramHandle {
    /// The attached program
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    /// Queues the program is attached to, in attach order
    pub fn queue_ids(&self) -> Vec<u32> {
        self.queues.iter().map(|queue| queue.queue_id()).collect()
    }

    /// Also attach the program to queue `queue_id`
    pub fn attach_queue(&mut self, queue_id: u32) -> Result<()> {
        if self.queues.iter().any(|queue| queue.queue_id() == queue_id) {
            return Err(DatapathError::DuplicateObject(format!(
                "program {} already attached to queue {queue_id}",
                self.program.id
            )));
        }

        let binding = self.binding.clone();
        let program = self.program.clone();
        let hook = self.hook;
        let queue = self
            .binding
            .work_queue()
            .run(move || -> Result<Arc<RxQueue>> {
                let queue = binding.find_or_create_rx_queue(hook, queue_id)?;
                queue.attach_program(program.id, program.rules.clone())?;
                Ok(queue)
            })??;
        self.queues.push(queue);
        Ok(())
    }
}

impl Drop for ProgramHandle {
    fn drop(&mut self) {
        let queues = std::mem::take(&mut self.queues);
        if queues.is_empty() {
            return;
        }
        let id = self.program.id;
        let result = self.binding.work_queue().run(move || {
            for queue in queues {
                match queue.detach_program(id) {
                    Ok(()) => {}
                    Err(DatapathError::NotFound(_)) => {
                        tracing::debug!(program = id, queue_id = queue.queue_id(), "program already detached");
                    }
                    Err(e) => {
                        tracing::warn!(program = id, queue_id = queue.queue_id(), error = %e, "detach failed");
                    }
                }
            }
        });
        if let Err(e) = result {
            tracing::warn!(program = id, error = %e, "could not schedule program detach");
        }
    }
}

impl std::fmt::Debug for ProgramHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramHandle")
            .field("program", &self.program.id)
            .field("if_index", &self.binding.if_index())
            .field("queues", &self.queue_ids())
            .finish()
    }
}

/// Concatenate the rules of every binding in attach order
pub(crate) fn compile(bindings: &[(u64, Arc<[Rule]>)]) -> Arc<[Rule]> {
    bindings
        .iter()
        .flat_map(|(_, rules)| rules.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatapathConfig;
    use crate::interface::InterfaceMode;
    use crate::soft::{SoftInterface, SoftInterfaceConfig};

    fn setup(queue_count: u32) -> (Arc<State>, u32) {
        let state = State::new(DatapathConfig::default()).unwrap();
        let soft = SoftInterface::new(SoftInterfaceConfig {
            queue_count,
            ..Default::default()
        });
        let if_index = soft.config().if_index;
        state.register_interface(soft).unwrap();
        (state, if_index)
    }

    fn drop_all() -> Vec<Rule> {
        vec![Rule::new(RuleMatch::All, RuleAction::Drop)]
    }

    #[test]
    fn test_compile_keeps_attach_order() {
        let first: Arc<[Rule]> = Arc::from(vec![Rule::new(RuleMatch::UdpDst(1), RuleAction::Drop)]);
        let second: Arc<[Rule]> = Arc::from(vec![
            Rule::new(RuleMatch::UdpDst(2), RuleAction::Pass),
            Rule::new(RuleMatch::All, RuleAction::Drop),
        ]);
        let compiled = compile(&[(1, first), (2, second)]);
        assert_eq!(compiled.len(), 3);
        assert_eq!(compiled[0].matcher, RuleMatch::UdpDst(1));
        assert_eq!(compiled[2].matcher, RuleMatch::All);
        assert!(compile(&[]).is_empty());
    }

    #[test]
    fn test_rejects_wrong_hook_and_mode() {
        let (state, if_index) = setup(1);
        let wrong_hook = Program::create(
            &state,
            if_index,
            HookId::TX_INJECT,
            0,
            ProgramFlags::empty(),
            drop_all(),
            Privilege::User,
        );
        assert!(matches!(wrong_hook, Err(DatapathError::InvalidParameter(_))));

        let binding = state.binding(if_index).unwrap();
        assert_eq!(binding.mode(), InterfaceMode::Generic);
        let native = Program::create(
            &state,
            if_index,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::NATIVE,
            drop_all(),
            Privilege::User,
        );
        assert!(matches!(native, Err(DatapathError::InvalidParameter(_))));

        let missing = Program::create(
            &state,
            if_index + 1,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::empty(),
            drop_all(),
            Privilege::User,
        );
        assert!(matches!(missing, Err(DatapathError::NotFound(_))));
    }

    #[test]
    fn test_all_queues_and_detach_on_drop() {
        let (state, if_index) = setup(3);
        let handle = Program::create_all_queues(
            &state,
            if_index,
            HookId::RX_INSPECT,
            ProgramFlags::GENERIC,
            drop_all(),
            Privilege::User,
        )
        .unwrap();
        assert_eq!(handle.queue_ids(), vec![0, 1, 2]);

        let binding = state.binding(if_index).unwrap();
        for queue_id in 0..3 {
            assert!(binding.rx_queue(queue_id).unwrap().is_active());
        }
        drop(handle);
        for queue_id in 0..3 {
            let queue = binding.rx_queue(queue_id).unwrap();
            assert!(!queue.is_active());
            assert_eq!(queue.binding_count(), 0);
        }
    }

    #[test]
    fn test_attach_queue_twice() {
        let (state, if_index) = setup(2);
        let mut handle = Program::create(
            &state,
            if_index,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::empty(),
            drop_all(),
            Privilege::User,
        )
        .unwrap();
        assert!(matches!(handle.attach_queue(0), Err(DatapathError::DuplicateObject(_))));
        handle.attach_queue(1).unwrap();
        assert_eq!(handle.queue_ids(), vec![0, 1]);
        assert!(matches!(handle.attach_queue(2), Err(DatapathError::InvalidParameter(_))));
    }
}
