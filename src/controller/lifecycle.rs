//! Node startup and shutdown around the controller loop

use tracing::{info, warn};

use crate::config::FabricConfig;
use crate::controller::session::{resync_sessions, Context, Stage};
use crate::retry::RetryConfig;
use crate::tunnel::{TunnelHandle, TunnelManager};
use crate::Error;

/// Create and configure the shared VXLAN overlay device.
///
/// Safe to repeat: an existing device with the same VNI and port is reused
/// and address/forwarding entries that already exist are accepted.
pub async fn bootstrap_overlay(
    tunnels: &TunnelManager,
    config: &FabricConfig,
) -> Result<TunnelHandle, Error> {
    let handle = tunnels.ensure_tunnel(&config.overlay_attrs()).await?;

    tunnels
        .configure_address(
            &handle,
            config.overlay_address.addr(),
            config.overlay_address.prefix_len(),
        )
        .await?;

    for peer in &config.vtep_peers {
        if Some(*peer) == config.underlay_address {
            continue;
        }
        tunnels.add_flood_peer(&handle, *peer).await?;
    }

    tunnels.set_up(&handle).await?;

    info!(
        device = %handle.name,
        index = handle.index,
        address = %config.overlay_address,
        peers = config.vtep_peers.len(),
        "overlay ready"
    );
    Ok(handle)
}

/// Bring up the overlay and rebuild state for already processed sessions.
///
/// On failure whatever was installed so far is removed again before the
/// error is returned.
pub async fn start_node(
    ctx: &Context,
    config: &FabricConfig,
    retry: &RetryConfig,
) -> Result<usize, Error> {
    let started = async {
        bootstrap_overlay(&ctx.tunnels, config).await?;
        resync_sessions(ctx, retry).await
    }
    .await;

    if let Err(e) = &started {
        warn!(error = %e, "startup failed, removing partial host state");
        if let Err(cleanup) = shutdown_cleanup(ctx, &config.overlay_interface).await {
            warn!(error = %cleanup, "cleanup incomplete, leftovers remain on the host");
        }
    }
    started
}

/// Remove everything this process installed.
///
/// Every step runs even when an earlier one fails; the first failure is
/// returned after all steps have been attempted.
pub async fn shutdown_cleanup(ctx: &Context, overlay_interface: &str) -> Result<(), Error> {
    let mut first_error = None;
    let mut state = ctx.state.lock().await;

    if let Err(e) = ctx.rules.teardown_all(&mut state.filter).await {
        warn!(stage = %Stage::Teardown, error = %e, "packet-filter cleanup incomplete");
        first_error.get_or_insert(e);
    }
    if let Err(e) = ctx.routes.delete_all_routes(&mut state.routes).await {
        warn!(stage = %Stage::Teardown, error = %e, "route cleanup incomplete");
        first_error.get_or_insert(e);
    }
    if let Err(e) = ctx.tunnels.teardown_by_name(overlay_interface).await {
        warn!(stage = %Stage::Teardown, device = overlay_interface, error = %e, "overlay removal failed");
        first_error.get_or_insert(e);
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            info!("host networking cleaned up");
            Ok(())
        }
    }
}
