use super::Context;
use crate::utils::parse_env;
use clap::Args;
use fleetcompose_engine::{ExecOptions, InputSource};
use std::io::IsTerminal;

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// 疑似 TTY を割り当てない
    #[arg(short = 'T', long = "no-TTY")]
    pub no_tty: bool,
    /// -T と併用して標準入力を接続する
    #[arg(short, long)]
    pub interactive: bool,
    /// 疑似 TTY を割り当てる（端末なら既定で有効）
    #[arg(short, long)]
    pub tty: bool,
    /// 実行ユーザー
    #[arg(short, long)]
    pub user: Option<String>,
    /// 作業ディレクトリ
    #[arg(short, long)]
    pub workdir: Option<String>,
    /// 環境変数（KEY=VALUE）
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,
    /// 特権モードで実行
    #[arg(long)]
    pub privileged: bool,
    /// レプリカ番号
    #[arg(long, default_value_t = 1)]
    pub index: u32,
    /// サービス名
    pub service: String,
    /// 実行するコマンド
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

pub async fn handle(ctx: &Context, args: &ExecArgs) -> anyhow::Result<i64> {
    let terminal = std::io::stdin().is_terminal();
    let interactive = args.interactive || !args.no_tty;
    let options = ExecOptions {
        service: args.service.clone(),
        index: args.index,
        command: args.command.clone(),
        env: parse_env(&args.env, |key| std::env::var(key).ok())?,
        user: args.user.clone(),
        workdir: args.workdir.clone(),
        tty: !args.no_tty && (args.tty || terminal),
        interactive,
        privileged: args.privileged,
    };
    let stdin: Option<InputSource> =
        interactive.then(|| Box::new(tokio::io::stdin()) as InputSource);
    Ok(ctx
        .engine
        .exec(&ctx.project, &options, stdin, &ctx.interrupt.graceful)
        .await?)
}
