//! The runtime task: one `select!` over transport events, commands and the
//! retry timer.

use std::time::Duration;

use mutt_transport::{Transport, TransportEvent};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::executor::execute_effects;
use super::state::CoreState;
use super::{MuttEvent, RuntimeCommand};

const MIN_RETRY_TICK: Duration = Duration::from_millis(10);

pub(super) async fn runtime_loop<T: Transport>(
    mut state: CoreState,
    transport: T,
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    event_tx: mpsc::Sender<MuttEvent>,
    cancel: CancellationToken,
) {
    // interval() panics on a zero period
    let mut retry = time::interval(state.config.retry_interval.max(MIN_RETRY_TICK));
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    retry.tick().await;

    let mut transport_open = true;
    info!(endpoint = %transport.local_endpoint().id(), "runtime started");

    loop {
        let effects = tokio::select! {
            _ = cancel.cancelled() => break,

            event = transport_rx.recv(), if transport_open => match event {
                Some(event) => state.handle_transport_event(event),
                None => {
                    debug!("transport event stream closed");
                    transport_open = false;
                    continue;
                }
            },

            cmd = cmd_rx.recv() => match cmd {
                Some(RuntimeCommand::Shutdown) | None => break,
                Some(cmd) => state.handle_command(cmd),
            },

            _ = retry.tick() => state.tick_retry(Instant::now()),
        };

        execute_effects(effects, &transport, state.storage(), &event_tx).await;
    }

    cancel.cancel();
    info!("runtime stopped");
}
