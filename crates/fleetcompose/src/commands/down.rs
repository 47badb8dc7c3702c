use super::Context;
use crate::utils::parse_timeout;
use clap::Args;
use fleetcompose_engine::{DownOptions, RemoveImages, RmOptions};
use std::time::Duration;

fn parse_rmi(s: &str) -> Result<RemoveImages, String> {
    RemoveImages::parse(s).ok_or_else(|| format!("'{}' は local または all を指定してください", s))
}

#[derive(Args, Debug)]
pub struct DownArgs {
    /// 名前付きボリュームも削除
    #[arg(short, long)]
    pub volumes: bool,
    /// 定義に無いサービスのコンテナも削除
    #[arg(long)]
    pub remove_orphans: bool,
    /// イメージも削除（local|all）
    #[arg(long, value_parser = parse_rmi)]
    pub rmi: Option<RemoveImages>,
    /// 停止の猶予時間（秒）
    #[arg(short, long, value_parser = parse_timeout)]
    pub timeout: Option<Duration>,
}

#[derive(Args, Debug)]
pub struct RmArgs {
    /// 実行中のコンテナも削除
    #[arg(short, long)]
    pub force: bool,
    /// 削除の前に停止する
    #[arg(short, long)]
    pub stop: bool,
    /// 匿名ボリュームも削除
    #[arg(short, long)]
    pub volumes: bool,
    /// 対象サービス（省略時は全サービス）
    pub services: Vec<String>,
}

pub async fn handle(ctx: &Context, args: &DownArgs) -> anyhow::Result<()> {
    let options = DownOptions {
        remove_orphans: args.remove_orphans,
        volumes: args.volumes,
        rmi: args.rmi,
        timeout: args.timeout,
    };
    ctx.engine
        .down(&ctx.project, &options, &ctx.interrupt)
        .await?;
    Ok(())
}

pub async fn handle_rm(ctx: &Context, args: &RmArgs) -> anyhow::Result<()> {
    let options = RmOptions {
        services: args.services.clone(),
        force: args.force,
        stop: args.stop,
        volumes: args.volumes,
    };
    let removed = ctx.engine.rm(&ctx.project, &options, &ctx.interrupt).await?;
    if removed.is_empty() {
        eprintln!("No stopped containers");
    }
    Ok(())
}
