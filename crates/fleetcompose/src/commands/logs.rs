use super::Context;
use crate::utils::{parse_tail, parse_timestamp};
use chrono::Utc;
use clap::Args;
use fleetcompose_container::Tail;
use fleetcompose_engine::LogsOptions;

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// リアルタイム追従
    #[arg(short, long)]
    pub follow: bool,
    /// 末尾から表示する行数（all|N）
    #[arg(short = 'n', long, value_parser = parse_tail, default_value = "all")]
    pub tail: Tail,
    /// この時刻以降のログ（RFC 3339、UNIX 秒、または 10m などの相対時間）
    #[arg(long)]
    pub since: Option<String>,
    /// この時刻より前のログ
    #[arg(long)]
    pub until: Option<String>,
    /// タイムスタンプを表示
    #[arg(short, long)]
    pub timestamps: bool,
    /// 色付けしない
    #[arg(long)]
    pub no_color: bool,
    /// サービス名のプレフィックスを付けない
    #[arg(long)]
    pub no_log_prefix: bool,
    /// 対象サービス（省略時は全サービス）
    pub services: Vec<String>,
}

pub async fn handle(ctx: &Context, args: &LogsArgs) -> anyhow::Result<()> {
    let now = Utc::now();
    let options = LogsOptions {
        services: args.services.clone(),
        follow: args.follow,
        tail: args.tail,
        since: args
            .since
            .as_deref()
            .map(|s| parse_timestamp(s, now))
            .transpose()?,
        until: args
            .until
            .as_deref()
            .map(|s| parse_timestamp(s, now))
            .transpose()?,
        timestamps: args.timestamps,
        no_color: args.no_color,
        no_prefix: args.no_log_prefix,
    };
    ctx.engine
        .logs(&ctx.project, &options, &ctx.interrupt.graceful)
        .await?;
    Ok(())
}
