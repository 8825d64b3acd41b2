//! Broker-side bootstrap
//!
//! Create and start the engine broker, acknowledge with INIT, wait for the
//! orchestrator's LINK instruction, connect to the neighbours, acknowledge
//! with LINKED, then float until killed.

use tracing::{debug, error, info};

use super::MasterLink;
use super::engine::PubSubEngine;
use crate::descriptor::{NodeDescriptor, NodeRole};
use crate::error::NodeExit;
use crate::wire;

pub async fn run_broker(
    link: &mut MasterLink,
    engine: &mut dyn PubSubEngine,
    descriptor: &NodeDescriptor,
) -> Result<(), NodeExit> {
    if descriptor.role != NodeRole::Broker {
        error!(role = %descriptor.role, "Broker agent given a non-broker descriptor");
        link.report_error().await;
        return Err(NodeExit::BrokerSetup);
    }

    if let Err(source) = engine.create_broker(descriptor).await {
        error!(%source, "Couldn't create broker");
        link.report_error().await;
        return Err(NodeExit::BrokerCreate);
    }
    debug!("Broker created");

    if let Err(source) = engine.start_broker().await {
        error!(%source, "Couldn't start broker");
        link.report_error().await;
        return Err(NodeExit::BrokerStart);
    }
    info!(uri = %descriptor.uri(), "Broker started");

    if let Err(source) = link.send_token(wire::TOKEN_INIT).await {
        error!(%source, "Couldn't acknowledge init");
        return Err(NodeExit::BrokerSocket);
    }

    // Linking waits for the orchestrator: every broker must be up first
    if let Err(source) = link.expect_token(wire::TOKEN_LINK).await {
        error!(%source, "Didn't receive link instruction");
        return Err(NodeExit::BrokerLink);
    }

    if let Err(source) = engine.link_neighbours(&descriptor.neighbour_uris).await {
        error!(%source, "Couldn't connect to neighbours");
        link.report_error().await;
        return Err(NodeExit::BrokerConnect);
    }
    info!(neighbours = descriptor.neighbour_uris.len(), "Broker linked");

    if let Err(source) = link.send_token(wire::TOKEN_LINKED).await {
        error!(%source, "Couldn't acknowledge link");
        return Err(NodeExit::BrokerSocket);
    }

    // Float until killed; serve only returns on an engine failure
    if let Err(source) = engine.serve().await {
        error!(%source, "Broker failed while serving");
        return Err(NodeExit::BrokerRun);
    }

    Ok(())
}
