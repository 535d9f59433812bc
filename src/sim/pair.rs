//! Two link endpoints wired back to back over lossy links.

use super::link::{LinkFaults, LossyLink};
use super::scheduler::SimScheduler;
use crate::transport::{ConfigError, MessageHandler, Rx, TransportConfig, Tx};
use std::sync::Arc;

/// One side of a [`SimPair`].
pub struct SimEndpoint {
    pub tx: Tx,
    pub rx: Rx,
    /// Link carrying this endpoint's packets to the peer.
    pub outbound: Arc<LossyLink>,
}

/// Endpoints `a` and `b` connected through one [`LossyLink`] per direction,
/// sharing a virtual clock.
pub struct SimPair {
    pub scheduler: Arc<SimScheduler>,
    pub a: SimEndpoint,
    pub b: SimEndpoint,
}

impl SimPair {
    /// Build both endpoints from the same configuration.
    ///
    /// Each direction gets its own random stream derived from `seed`.
    pub fn new<HA, HB>(
        config: &TransportConfig,
        faults: LinkFaults,
        seed: u32,
        handler_a: HA,
        handler_b: HB,
    ) -> Result<Self, ConfigError>
    where
        HA: MessageHandler + 'static,
        HB: MessageHandler + 'static,
    {
        let scheduler = Arc::new(SimScheduler::new());
        let a = endpoint(config, &scheduler, faults.clone(), seed, handler_a)?;
        let b = endpoint(config, &scheduler, faults, seed.wrapping_add(0x9e37), handler_b)?;

        let rx_b = b.rx.clone();
        a.outbound.connect(move |packet| rx_b.on_ble_phys_rx(packet));
        let rx_a = a.rx.clone();
        b.outbound.connect(move |packet| rx_a.on_ble_phys_rx(packet));

        Ok(Self { scheduler, a, b })
    }
}

impl Drop for SimPair {
    fn drop(&mut self) {
        // Each link holds the peer's Rx, which holds a Tx holding the link
        self.a.outbound.disconnect();
        self.b.outbound.disconnect();
    }
}

fn endpoint<H>(
    config: &TransportConfig,
    scheduler: &Arc<SimScheduler>,
    faults: LinkFaults,
    seed: u32,
    handler: H,
) -> Result<SimEndpoint, ConfigError>
where
    H: MessageHandler + 'static,
{
    let outbound = Arc::new(LossyLink::new(scheduler.clone(), faults, seed));
    let tx = Tx::new(config, outbound.clone(), scheduler.clone())?;
    let rx = Rx::new(config, scheduler.clone(), Some(tx.clone()), handler)?;
    Ok(SimEndpoint { tx, rx, outbound })
}
