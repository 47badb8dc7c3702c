use super::Context;
use crate::utils::{parse_scale, parse_timeout};
use clap::Args;
use fleetcompose_engine::{CreateOptions, UpOptions, recreate_policy};
use std::time::Duration;

#[derive(Args, Debug)]
pub struct UpArgs {
    /// バックグラウンドで起動（ログを表示しない）
    #[arg(short, long)]
    pub detach: bool,
    /// イメージがあってもビルドする
    #[arg(long)]
    pub build: bool,
    /// 依存サービスを起動しない
    #[arg(long)]
    pub no_deps: bool,
    /// 定義に無いサービスのコンテナを削除
    #[arg(long)]
    pub remove_orphans: bool,
    /// 変更が無くてもコンテナを作り直す
    #[arg(long)]
    pub force_recreate: bool,
    /// 既存のコンテナを作り直さない
    #[arg(long)]
    pub no_recreate: bool,
    /// いずれかのコンテナが終了したら全体を停止
    #[arg(long)]
    pub abort_on_container_exit: bool,
    /// いずれかのサービスが失敗または終了したら、起動中の他のサービスも止める
    #[arg(long)]
    pub cascade_stop: bool,
    /// 停止の猶予時間（秒）
    #[arg(short, long, value_parser = parse_timeout)]
    pub timeout: Option<Duration>,
    /// レプリカ数の上書き（SERVICE=N）
    #[arg(long, value_parser = parse_scale)]
    pub scale: Vec<(String, u32)>,
    /// 対象サービス（省略時は全サービス）
    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// イメージがあってもビルドする
    #[arg(long)]
    pub build: bool,
    /// 変更が無くてもコンテナを作り直す
    #[arg(long)]
    pub force_recreate: bool,
    /// 既存のコンテナを作り直さない
    #[arg(long)]
    pub no_recreate: bool,
    /// 対象サービス（省略時は全サービス）
    pub services: Vec<String>,
}

pub async fn handle(ctx: &Context, args: &UpArgs) -> anyhow::Result<i64> {
    let options = UpOptions {
        create: CreateOptions {
            services: args.services.clone(),
            build: args.build,
            no_deps: args.no_deps,
            remove_orphans: args.remove_orphans,
            recreate: recreate_policy(args.force_recreate, args.no_recreate)?,
            scale: args.scale.iter().cloned().collect(),
            timeout: args.timeout,
        },
        detach: args.detach,
        abort_on_container_exit: args.abort_on_container_exit,
        cascade_stop: args.cascade_stop,
    };
    Ok(ctx.engine.up(&ctx.project, &options, &ctx.interrupt).await?)
}

pub async fn handle_create(ctx: &Context, args: &CreateArgs) -> anyhow::Result<()> {
    let options = CreateOptions {
        services: args.services.clone(),
        build: args.build,
        recreate: recreate_policy(args.force_recreate, args.no_recreate)?,
        ..Default::default()
    };
    ctx.engine
        .create(&ctx.project, &options, &ctx.interrupt.graceful)
        .await?;
    Ok(())
}
