//! The core context: owns a node address and a backend, and is the handle
//! every protocol layer borrows to pack/send/receive frames.

use crate::backend::queue::LocalQueueBackend;
#[cfg(feature = "socketcan-backend")]
use crate::backend::can_socket::NativeCanBackend;
#[cfg(feature = "tcp-backend")]
use crate::backend::tcp::TcpTunnelBackend;
use crate::backend::{Backend, BackendKind};
use crate::bwacp::{self, Bwacp};
use crate::error::Error;
use crate::frame::{Frame, NodeAddress, ProtocolClass};
use crate::nonce::NonceGenerator;
use crate::psacp::{self, Psacp};
use crate::reassembly::ReassemblyTable;
use crate::rpcacp::Rpcacp;
use crate::rtacp::Rtacp;

/// One of the backends constructible from a [`BackendKind`] without any
/// caller-supplied dependency (the SPI backend is not among them — its
/// `SpiHandle` parameter makes it a dependency-injected backend, reachable
/// only through [`Context::init_custom`]).
pub enum AnyBackend {
    /// The in-process bounded-ring mock.
    LocalQueue(LocalQueueBackend),
    /// The length-prefixed TCP tunnel mock.
    #[cfg(feature = "tcp-backend")]
    TcpTunnel(TcpTunnelBackend),
    /// The kernel SocketCAN interface.
    #[cfg(feature = "socketcan-backend")]
    NativeCan(NativeCanBackend),
}

impl Backend for AnyBackend {
    fn init(&mut self) -> Result<(), Error> {
        match self {
            AnyBackend::LocalQueue(b) => b.init(),
            #[cfg(feature = "tcp-backend")]
            AnyBackend::TcpTunnel(b) => b.init(),
            #[cfg(feature = "socketcan-backend")]
            AnyBackend::NativeCan(b) => b.init(),
        }
    }

    fn send(&mut self, frame: &Frame) -> nb::Result<(), Error> {
        match self {
            AnyBackend::LocalQueue(b) => b.send(frame),
            #[cfg(feature = "tcp-backend")]
            AnyBackend::TcpTunnel(b) => b.send(frame),
            #[cfg(feature = "socketcan-backend")]
            AnyBackend::NativeCan(b) => b.send(frame),
        }
    }

    fn receive(&mut self, timeout_ms: u32) -> nb::Result<Frame, Error> {
        match self {
            AnyBackend::LocalQueue(b) => b.receive(timeout_ms),
            #[cfg(feature = "tcp-backend")]
            AnyBackend::TcpTunnel(b) => b.receive(timeout_ms),
            #[cfg(feature = "socketcan-backend")]
            AnyBackend::NativeCan(b) => b.receive(timeout_ms),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        match self {
            AnyBackend::LocalQueue(b) => b.close(),
            #[cfg(feature = "tcp-backend")]
            AnyBackend::TcpTunnel(b) => b.close(),
            #[cfg(feature = "socketcan-backend")]
            AnyBackend::NativeCan(b) => b.close(),
        }
    }
}

/// Owns `{ node_address, backend }` for the life of one logical task.
///
/// A `Context` never shares its backend with another `Context`; per §5, a
/// process that wants multiple contexts gets multiple backend instances
/// unless the caller explicitly wires them together (e.g. two
/// `LocalQueueBackend`s feeding each other, as the queue backend's tests do).
pub struct Context<B: Backend> {
    node_address: NodeAddress,
    backend: B,
    nonce: NonceGenerator,
    psacp_table: ReassemblyTable<psacp::StreamKey, psacp::ReassemblyState>,
    bwacp_table: ReassemblyTable<bwacp::StreamKey, bwacp::ReassemblyState>,
}

impl<B: Backend> Context<B> {
    /// Construct a context around a caller-supplied, already-configured
    /// backend (dependency injection per §6's `init_custom`). Validates the
    /// node address and calls `backend.init`.
    pub fn init_custom(node_address: u8, mut backend: B) -> Result<Self, Error> {
        let node_address = NodeAddress::new(node_address)?;
        backend.init().inspect_err(|e| {
            log::error!("backend init failed for node {node_address:?}: {e}");
        })?;
        log::debug!("context opened for node address {:#04x}", node_address.value());
        // Seeded off the node address alone (no OS RNG, no wall clock): good
        // enough for the generator's one job, discriminating concurrent
        // exchanges from the same sender, per the collision-resistance-only
        // contract documented on `NonceGenerator`.
        let nonce = NonceGenerator::new(u32::from(node_address.value()) ^ 0xA5A5_A5A5);
        Ok(Self {
            node_address,
            backend,
            nonce,
            psacp_table: ReassemblyTable::new(),
            bwacp_table: ReassemblyTable::new(),
        })
    }

    /// This context's node address.
    #[must_use]
    pub fn node_address(&self) -> NodeAddress {
        self.node_address
    }

    pub(crate) fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub(crate) fn next_nonce(&mut self) -> u8 {
        self.nonce.next()
    }

    pub(crate) fn psacp_table_mut(
        &mut self,
    ) -> &mut ReassemblyTable<psacp::StreamKey, psacp::ReassemblyState> {
        &mut self.psacp_table
    }

    pub(crate) fn bwacp_table_mut(
        &mut self,
    ) -> &mut ReassemblyTable<bwacp::StreamKey, bwacp::ReassemblyState> {
        &mut self.bwacp_table
    }

    /// Decode the protocol class of a frame without committing to any
    /// particular layer's full parse.
    #[must_use]
    pub fn get_protocol(&self, frame: &Frame) -> Option<ProtocolClass> {
        crate::frame::get_protocol(frame)
    }

    /// Borrow the RTACP layer.
    pub fn rtacp(&mut self) -> Rtacp<'_, B> {
        Rtacp::new(self)
    }

    /// Borrow the RPCACP layer.
    pub fn rpcacp(&mut self) -> Rpcacp<'_, B> {
        Rpcacp::new(self)
    }

    /// Borrow the PSACP layer.
    pub fn psacp(&mut self) -> Psacp<'_, B> {
        Psacp::new(self)
    }

    /// Borrow the BWACP layer.
    pub fn bwacp(&mut self) -> Bwacp<'_, B> {
        Bwacp::new(self)
    }

    /// Release backend resources. Idempotent; every operation after `close`
    /// fails with [`Error::NotOpen`].
    pub fn close(&mut self) -> Result<(), Error> {
        log::debug!("context closing for node address {:#04x}", self.node_address.value());
        self.backend.close()
    }
}

impl Context<AnyBackend> {
    /// Construct a context selecting one of the backend kinds that needs no
    /// caller-supplied dependency, per §6's semantic `init(context,
    /// node_address, backend_kind)`.
    ///
    /// `BackendKind::SpiController` is accepted by the kind enum for
    /// completeness but always fails here: the SPI backend's `SpiHandle`
    /// parameter makes it inherently dependency-injected, so it is only
    /// constructible through [`Context::init_custom`].
    pub fn init(node_address: u8, kind: BackendKind) -> Result<Self, Error> {
        let backend = match kind {
            BackendKind::LocalQueue => AnyBackend::LocalQueue(LocalQueueBackend::new()),
            #[cfg(feature = "tcp-backend")]
            BackendKind::TcpTunnel(config) => AnyBackend::TcpTunnel(TcpTunnelBackend::new(config)),
            #[cfg(feature = "socketcan-backend")]
            BackendKind::NativeCan { interface } => {
                AnyBackend::NativeCan(NativeCanBackend::new(interface))
            }
            BackendKind::SpiController => {
                return Err(Error::InvalidArgument(
                    "spi_controller requires init_custom with a caller-supplied SpiHandle",
                ))
            }
        };
        Self::init_custom(node_address, backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_node_address() {
        let err = Context::init_custom(0x40, LocalQueueBackend::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn init_with_local_queue_kind_succeeds() {
        let ctx = Context::init(0x01, BackendKind::LocalQueue).unwrap();
        assert_eq!(ctx.node_address().value(), 0x01);
    }

    #[test]
    fn spi_controller_kind_is_rejected_without_init_custom() {
        let err = Context::init(0x01, BackendKind::SpiController).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
