//! build / pull / push

use super::Context;
use clap::Args;
use fleetcompose_engine::{BuildOptions, PullOptions};

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// キャッシュを使わない
    #[arg(long)]
    pub no_cache: bool,
    /// ベースイメージを常に取得する
    #[arg(long)]
    pub pull: bool,
    /// 対象サービス（省略時は全サービス）
    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PullArgs {
    /// 進捗を表示しない
    #[arg(short, long)]
    pub quiet: bool,
    /// 取得に失敗したサービスを無視する
    #[arg(long)]
    pub ignore_pull_failures: bool,
    /// 対象サービス（省略時は全サービス）
    pub services: Vec<String>,
}

pub async fn handle_build(ctx: &Context, args: &BuildArgs) -> anyhow::Result<()> {
    let options = BuildOptions {
        services: args.services.clone(),
        no_cache: args.no_cache,
        pull: args.pull,
    };
    ctx.engine
        .build(&ctx.project, &options, &ctx.interrupt.graceful)
        .await?;
    Ok(())
}

pub async fn handle_pull(ctx: &Context, args: &PullArgs) -> anyhow::Result<()> {
    let options = PullOptions {
        services: args.services.clone(),
        quiet: args.quiet,
        ignore_pull_failures: args.ignore_pull_failures,
    };
    ctx.engine
        .pull(&ctx.project, &options, &ctx.interrupt.graceful)
        .await?;
    Ok(())
}

pub async fn handle_push(ctx: &Context, services: &[String]) -> anyhow::Result<()> {
    ctx.engine
        .push(&ctx.project, services, &ctx.interrupt.graceful)
        .await?;
    Ok(())
}
