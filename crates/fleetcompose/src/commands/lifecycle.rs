//! start / stop / restart / kill / pause / unpause

use super::Context;
use fleetcompose_engine::StopOptions;
use std::time::Duration;

pub async fn handle_start(ctx: &Context, services: &[String]) -> anyhow::Result<()> {
    ctx.engine
        .start(&ctx.project, services, &ctx.interrupt.graceful)
        .await?;
    Ok(())
}

pub async fn handle_stop(
    ctx: &Context,
    services: &[String],
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let options = StopOptions {
        services: services.to_vec(),
        timeout,
    };
    ctx.engine
        .stop(&ctx.project, &options, &ctx.interrupt)
        .await?;
    Ok(())
}

pub async fn handle_restart(
    ctx: &Context,
    services: &[String],
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let options = StopOptions {
        services: services.to_vec(),
        timeout,
    };
    ctx.engine
        .restart(&ctx.project, &options, &ctx.interrupt.graceful)
        .await?;
    Ok(())
}

pub async fn handle_kill(ctx: &Context, services: &[String], signal: &str) -> anyhow::Result<()> {
    ctx.engine.kill(&ctx.project, services, signal).await?;
    Ok(())
}

pub async fn handle_pause(ctx: &Context, services: &[String]) -> anyhow::Result<()> {
    ctx.engine.pause(&ctx.project, services).await?;
    Ok(())
}

pub async fn handle_unpause(ctx: &Context, services: &[String]) -> anyhow::Result<()> {
    ctx.engine.unpause(&ctx.project, services).await?;
    Ok(())
}
