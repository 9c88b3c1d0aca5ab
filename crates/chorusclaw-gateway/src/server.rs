//! Gateway assembly: bus, shared registries and supervised bots around one transport

use crate::error::GatewayResult;
use crate::manager::{BotManager, RunningGateway};
use crate::transport::ChannelTransport;
use chorusclaw_agent::{LoopDeps, MessageBus};
use chorusclaw_core::GatewayConfig;
use chorusclaw_llm::ProviderFactory;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Validate the configured bots and start them on `transport`'s sink.
///
/// The bus and the shared tool registry exist before the first bot
/// subscribes. Inbound traffic only flows once the transport runs.
pub async fn start_gateway(
    config: &GatewayConfig,
    transport: &dyn ChannelTransport,
    providers: Arc<dyn ProviderFactory>,
) -> GatewayResult<RunningGateway> {
    let identities = config.identities()?;

    let bus = Arc::new(
        MessageBus::new(transport.sink(), config.bus.mailbox_capacity)
            .with_loopback(!transport.echoes_bot_messages()),
    );
    let deps = LoopDeps::wire(
        bus,
        providers,
        config.agent.clone(),
        config.multi_bot.clone(),
    )
    .await;
    info!(transport = transport.name(), tools = ?deps.tools.list(), "registered tools");

    BotManager::new(deps, config.supervisor.clone()).start(identities)
}

/// Run the gateway until `shutdown` resolves or the transport's input ends,
/// then stop every bot.
pub async fn serve<F>(
    config: &GatewayConfig,
    transport: Arc<dyn ChannelTransport>,
    providers: Arc<dyn ProviderFactory>,
    shutdown: F,
) -> GatewayResult<()>
where
    F: Future<Output = ()> + Send,
{
    let gateway = start_gateway(config, transport.as_ref(), providers).await?;
    let cancel = CancellationToken::new();

    let result = tokio::select! {
        r = transport.run(gateway.bus(), cancel.clone()) => {
            info!(transport = transport.name(), "transport finished");
            r
        }
        _ = shutdown => {
            info!("shutdown requested");
            Ok(())
        }
    };

    cancel.cancel();
    gateway.stop().await;
    Ok(result?)
}
