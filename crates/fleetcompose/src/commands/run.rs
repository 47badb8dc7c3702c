use super::Context;
use crate::utils::parse_env;
use clap::Args;
use colored::Colorize;
use fleetcompose_engine::{InputSource, RunOptions, RunOutcome};
use std::io::IsTerminal;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// 終了後にコンテナを削除
    #[arg(long)]
    pub rm: bool,
    /// バックグラウンドで実行してコンテナ名を表示
    #[arg(short, long)]
    pub detach: bool,
    /// 疑似 TTY を割り当てない
    #[arg(short = 'T', long = "no-TTY")]
    pub no_tty: bool,
    /// 環境変数（KEY=VALUE）
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,
    /// 追加のマウント（SRC:DST[:MODE]）
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<String>,
    /// 追加のポート公開（HOST:CONTAINER）
    #[arg(short = 'p', long = "publish")]
    pub publish: Vec<String>,
    /// コンテナ名
    #[arg(long)]
    pub name: Option<String>,
    /// エントリーポイントの上書き
    #[arg(long)]
    pub entrypoint: Option<String>,
    /// 実行ユーザー
    #[arg(short, long)]
    pub user: Option<String>,
    /// 作業ディレクトリ
    #[arg(short, long)]
    pub workdir: Option<String>,
    /// 依存サービスを起動しない
    #[arg(long)]
    pub no_deps: bool,
    /// サービス定義のポートを公開する
    #[arg(long)]
    pub service_ports: bool,
    /// サービス名
    pub service: String,
    /// 実行するコマンド
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub async fn handle(ctx: &Context, args: &RunArgs) -> anyhow::Result<i64> {
    let interactive = !args.detach;
    let options = RunOptions {
        service: args.service.clone(),
        command: args.command.clone(),
        entrypoint: args
            .entrypoint
            .as_ref()
            .map(|e| e.split_whitespace().map(str::to_string).collect()),
        env: parse_env(&args.env, |key| std::env::var(key).ok())?,
        volumes: args.volumes.clone(),
        publish: args.publish.clone(),
        name: args.name.clone(),
        user: args.user.clone(),
        workdir: args.workdir.clone(),
        tty: !args.no_tty && interactive && std::io::stdin().is_terminal(),
        interactive,
        detach: args.detach,
        rm: args.rm,
        no_deps: args.no_deps,
        service_ports: args.service_ports,
    };

    let stdin: Option<InputSource> =
        interactive.then(|| Box::new(tokio::io::stdin()) as InputSource);
    match ctx
        .engine
        .run(&ctx.project, &options, stdin, &ctx.interrupt)
        .await?
    {
        RunOutcome::Detached { name, .. } if args.detach => {
            println!("{}", name);
            Ok(0)
        }
        // 切り離しキーで抜けた
        RunOutcome::Detached { name, .. } => {
            eprintln!(
                "{}",
                format!("ℹ コンテナ '{}' から切り離しました", name).dimmed()
            );
            Ok(0)
        }
        RunOutcome::Exited { code } => Ok(code),
    }
}
