//! The Artie CAN protocol stack: four overlaid protocols sharing one CAN
//! bus, addressed by a 6-bit node address and dispatched off the top three
//! identifier bits.
//!
//! - [`rtacp`] — real-time unicast/broadcast messages with an optional ACK.
//! - [`rpcacp`] — synchronous/asynchronous remote procedure calls.
//! - [`psacp`] — topic-addressed publish/subscribe at two priority tiers.
//! - [`bwacp`] — large block transfer via READY/DATA/REPEAT.
//!
//! Every layer is reached through a [`Context`], which owns a node address
//! and one [`backend::Backend`] for the life of a task. Construct one with
//! [`Context::init`] (for the backends that need no caller-supplied
//! dependency) or [`Context::init_custom`] (for the SPI controller, or any
//! backend assembled by the caller).

pub mod backend;
pub mod bwacp;
mod context;
mod crc;
mod error;
mod frame;
mod nonce;
mod payload;
pub mod psacp;
mod reassembly;
pub mod rpcacp;
pub mod rtacp;
mod stuffing;

pub use backend::BackendKind;
pub use bwacp::{Bwacp, BwacpEvent, BwacpMessage, ClassMask};
pub use context::{AnyBackend, Context};
pub use error::{Error, TransportFault};
pub use frame::{Frame, NodeAddress, Priority, ProtocolClass, MAX_DATA_LEN};
pub use payload::Payload;
pub use psacp::{Psacp, PsacpMessage, PsacpStrictness};
pub use rpcacp::Rpcacp;
pub use rtacp::{Rtacp, RtacpMessage};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::queue::LocalQueueBackend;

    #[test]
    fn public_surface_constructs_a_context_and_every_layer() {
        let mut ctx = Context::init_custom(0x01, LocalQueueBackend::new()).unwrap();
        let _ = ctx.rtacp();
        let _ = ctx.rpcacp();
        let _ = ctx.psacp();
        let _ = ctx.bwacp();
        ctx.close().unwrap();
    }
}
