use super::Context;
use clap::Args;
use fleetcompose_engine::EventsOptions;

#[derive(Args, Debug)]
pub struct EventsArgs {
    /// 1 行 1 件の JSON で出力
    #[arg(long)]
    pub json: bool,
    /// 対象サービス（省略時は全サービス）
    pub services: Vec<String>,
}

pub async fn handle(ctx: &Context, args: &EventsArgs) -> anyhow::Result<()> {
    let options = EventsOptions {
        services: args.services.clone(),
        json: args.json,
    };
    ctx.engine
        .events(&ctx.project, &options, &ctx.interrupt.graceful)
        .await?;
    Ok(())
}
