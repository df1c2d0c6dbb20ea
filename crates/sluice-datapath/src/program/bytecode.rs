//! Byte-code program hook
//!
//! A byte-code action hands the inline buffer of each frame to an opaque
//! program (an eBPF interpreter or JIT in practice). The program answers with
//! an XDP-style verdict; anything unrecognised drops the frame.

use sluice_core::RxAction;
use thiserror::Error;

/// Verdict: deliver to the regular stack
pub const VERDICT_PASS: u32 = 1;
/// Verdict: discard
pub const VERDICT_DROP: u32 = 2;
/// Verdict: transmit back out
pub const VERDICT_TX: u32 = 3;

/// Program aborted while running
#[derive(Debug, Error)]
#[error("bytecode fault: {0}")]
pub struct BytecodeFault(pub String);

/// Per-frame input of a byte-code program
#[derive(Debug)]
pub struct BytecodeContext<'a> {
    /// Inline buffer data; the program may rewrite it in place
    pub data: &'a mut [u8],
    /// Interface the frame arrived on
    pub ingress_ifindex: u32,
    /// Queue the frame arrived on
    pub rx_queue_index: u32,
}

/// Opaque classification program
pub trait BytecodeProgram: Send + Sync {
    /// Classify one frame, returning a verdict code
    fn run(&self, context: &mut BytecodeContext<'_>) -> Result<u32, BytecodeFault>;

    /// Called before each receive batch. Returning false routes the batch
    /// through the rule engine instead.
    fn start_batch(&self) -> bool {
        true
    }

    /// Called after each receive batch that `start_batch` accepted
    fn end_batch(&self) {}
}

impl<F> BytecodeProgram for F
where
    F: Fn(&mut BytecodeContext<'_>) -> Result<u32, BytecodeFault> + Send + Sync,
{
    fn run(&self, context: &mut BytecodeContext<'_>) -> Result<u32, BytecodeFault> {
        self(context)
    }
}

/// Map a program result onto an RX action
pub fn verdict_action(result: Result<u32, BytecodeFault>) -> RxAction {
    match result {
        Ok(VERDICT_PASS) => RxAction::Pass,
        Ok(VERDICT_TX) => RxAction::Tx,
        Ok(_) => RxAction::Drop,
        Err(fault) => {
            tracing::trace!(%fault, "bytecode program faulted");
            RxAction::Drop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_mapping() {
        assert_eq!(verdict_action(Ok(VERDICT_PASS)), RxAction::Pass);
        assert_eq!(verdict_action(Ok(VERDICT_DROP)), RxAction::Drop);
        assert_eq!(verdict_action(Ok(VERDICT_TX)), RxAction::Tx);
        assert_eq!(verdict_action(Ok(0)), RxAction::Drop);
        assert_eq!(verdict_action(Ok(99)), RxAction::Drop);
        assert_eq!(
            verdict_action(Err(BytecodeFault("out of bounds".into()))),
            RxAction::Drop
        );
    }

    #[test]
    fn test_closure_program() {
        let program = |ctx: &mut BytecodeContext<'_>| -> Result<u32, BytecodeFault> {
            ctx.data[0] = 0xee;
            Ok(if ctx.rx_queue_index == 0 { VERDICT_PASS } else { VERDICT_DROP })
        };
        let mut data = [0u8; 4];
        let mut ctx = BytecodeContext {
            data: &mut data,
            ingress_ifindex: 7,
            rx_queue_index: 0,
        };
        assert_eq!(program.run(&mut ctx).unwrap(), VERDICT_PASS);
        assert!(program.start_batch());
        assert_eq!(data[0], 0xee);
    }
}
