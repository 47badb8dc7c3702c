use super::Context;
use clap::Args;
use fleetcompose_engine::CopyOptions;

#[derive(Args, Debug)]
pub struct CpArgs {
    /// コピー元（PATH または SERVICE:PATH）
    pub source: String,
    /// コピー先（PATH または SERVICE:PATH）
    pub destination: String,
    /// コンテナ側のレプリカ番号
    #[arg(long, default_value_t = 1)]
    pub index: u32,
}

pub async fn handle(ctx: &Context, args: &CpArgs) -> anyhow::Result<()> {
    let options = CopyOptions {
        source: args.source.clone(),
        destination: args.destination.clone(),
        index: args.index,
    };
    ctx.engine
        .copy(&ctx.project, &options, &ctx.interrupt.graceful)
        .await?;
    Ok(())
}
