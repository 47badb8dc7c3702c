use super::Context;
use clap::{Args, ValueEnum};
use colored::Colorize;
use fleetcompose_engine::{ContainerView, PsOptions};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum PsFormat {
    #[default]
    Table,
    Json,
}

#[derive(Args, Debug)]
pub struct PsArgs {
    /// 停止中・一時コンテナも表示
    #[arg(short, long)]
    pub all: bool,
    /// サービス名のみ表示
    #[arg(long)]
    pub services: bool,
    /// コンテナ ID のみ表示
    #[arg(short, long)]
    pub quiet: bool,
    /// 出力形式
    #[arg(long, value_enum, default_value_t = PsFormat::Table)]
    pub format: PsFormat,
    /// 対象サービス（省略時は全サービス）
    #[arg(value_name = "SERVICE")]
    pub filter: Vec<String>,
}

pub async fn handle(ctx: &Context, args: &PsArgs) -> anyhow::Result<()> {
    let options = PsOptions {
        services: args.filter.clone(),
        all: args.all,
    };
    let views = ctx.engine.ps(&ctx.project, &options).await?;

    if args.quiet {
        for view in &views {
            println!("{}", view.id);
        }
        return Ok(());
    }
    if args.services {
        let services: BTreeSet<&str> = views.iter().map(|v| v.service.as_str()).collect();
        for service in services {
            println!("{}", service);
        }
        return Ok(());
    }
    match args.format {
        PsFormat::Json => println!("{}", serde_json::to_string(&views)?),
        PsFormat::Table => print_table(&views),
    }
    Ok(())
}

fn print_table(views: &[ContainerView]) {
    println!(
        "{}",
        format!(
            "{:<30} {:<25} {:<12} {:<30} {}",
            "NAME", "IMAGE", "SERVICE", "STATUS", "PORTS"
        )
        .bold()
    );
    for view in views {
        let status = if view.health.is_empty() {
            view.status.clone()
        } else {
            format!("{} ({})", view.status, view.health)
        };
        let status = format!("{:<30}", status);
        let status_colored = match view.state.as_str() {
            "running" => status.green(),
            "paused" | "restarting" => status.yellow(),
            _ => status.red(),
        };
        println!(
            "{:<30} {:<25} {:<12} {} {}",
            view.name.cyan(),
            view.image,
            view.service,
            status_colored,
            view.ports.join(", ")
        );
    }
}
