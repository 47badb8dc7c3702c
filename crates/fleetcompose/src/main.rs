mod commands;
mod docker;
mod signals;
mod utils;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use commands::Context;
use commands::cp::CpArgs;
use commands::down::{DownArgs, RmArgs};
use commands::events::EventsArgs;
use commands::exec::ExecArgs;
use commands::images::{BuildArgs, PullArgs};
use commands::logs::LogsArgs;
use commands::ps::PsArgs;
use commands::run::RunArgs;
use commands::up::{CreateArgs, UpArgs};
use fleetcompose_config::{EngineSettings, ProjectOptions};
use fleetcompose_core::ComposeError;
use fleetcompose_engine::{
    ComposeEngine, DetachKeys, EngineOptions, Interrupt, LineFormat, LineProgress, NoopProgress,
    ProgressSink, TtyProgress,
};
use std::io::IsTerminal;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use utils::parse_timeout;

#[derive(Parser)]
#[command(name = "fleet-compose")]
#[command(about = "複数コンテナのプロジェクトを、定義どおりの状態へ。", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Compose ファイル（複数指定可、省略時は COMPOSE_FILE または自動検出）
    #[arg(short = 'f', long = "file")]
    files: Vec<PathBuf>,
    /// プロジェクト名
    #[arg(short = 'p', long, env = "COMPOSE_PROJECT_NAME")]
    project_name: Option<String>,
    /// プロジェクトの作業ディレクトリ
    #[arg(long)]
    project_directory: Option<PathBuf>,
    /// 同時に処理するサービス数の上限（COMPOSE_PARALLEL_LIMIT）
    #[arg(long)]
    parallel: Option<NonZeroUsize>,
    /// 進捗の表示形式
    #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
    progress: ProgressMode,
    /// 色付けしない
    #[arg(long)]
    no_color: bool,
    /// run / exec で接続を切り離すキー（例: ctrl-p,ctrl-q）
    #[arg(long)]
    detach_keys: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProgressMode {
    /// 端末なら tty、それ以外は plain
    Auto,
    Tty,
    Plain,
    Json,
    Quiet,
}

#[derive(Subcommand)]
enum Commands {
    /// サービスを作成して起動
    Up(UpArgs),
    /// コンテナを作成（起動しない）
    Create(CreateArgs),
    /// コンテナとネットワークを停止して削除
    Down(DownArgs),
    /// 作成済みのサービスを起動
    Start {
        /// 対象サービス（省略時は全サービス）
        services: Vec<String>,
    },
    /// サービスを停止
    Stop {
        /// 停止の猶予時間（秒）
        #[arg(short, long, value_parser = parse_timeout)]
        timeout: Option<Duration>,
        /// 対象サービス（省略時は全サービス）
        services: Vec<String>,
    },
    /// サービスを再起動
    Restart {
        /// 停止の猶予時間（秒）
        #[arg(short, long, value_parser = parse_timeout)]
        timeout: Option<Duration>,
        /// 対象サービス（省略時は全サービス）
        services: Vec<String>,
    },
    /// コンテナにシグナルを送る
    Kill {
        /// 送るシグナル
        #[arg(short, long, default_value = "SIGKILL")]
        signal: String,
        /// 対象サービス（省略時は全サービス）
        services: Vec<String>,
    },
    /// サービスを一時停止
    Pause {
        /// 対象サービス（省略時は全サービス）
        services: Vec<String>,
    },
    /// 一時停止を解除
    Unpause {
        /// 対象サービス（省略時は全サービス）
        services: Vec<String>,
    },
    /// 停止中のコンテナを削除
    Rm(RmArgs),
    /// 一時コンテナでコマンドを実行
    Run(RunArgs),
    /// 実行中のコンテナでコマンドを実行
    Exec(ExecArgs),
    /// コンテナのログを表示
    Logs(LogsArgs),
    /// コンテナ一覧
    Ps(PsArgs),
    /// コンテナのイベントを表示
    Events(EventsArgs),
    /// サービスのイメージをビルド
    Build(BuildArgs),
    /// サービスのイメージを取得
    Pull(PullArgs),
    /// サービスのイメージを送信
    Push {
        /// 対象サービス（省略時は全サービス）
        services: Vec<String>,
    },
    /// コンテナとローカルの間でファイルをコピー
    Cp(CpArgs),
    /// 正規化後の設定を表示
    Config {
        /// サービス名のみ表示
        #[arg(long)]
        services: bool,
        /// サービスごとの設定ハッシュを表示
        #[arg(long)]
        hash: bool,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // ログは stderr に出す（stdout はコンテナ出力と JSON 用）
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => report(&e),
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    // Versionコマンドは設定ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("fleet-compose {}", env!("CARGO_PKG_VERSION"));
        return Ok(0);
    }

    let settings = EngineSettings::from_env()?;
    let project_options = ProjectOptions {
        files: cli.files.clone(),
        project_name: cli.project_name.clone(),
        project_directory: cli.project_directory.clone(),
    };
    let project = project_options.load(&settings)?;
    debug!(project = %project.name, services = project.services.len(), "Project loaded");

    // config はハッシュを求められない限り Docker 不要
    if let Commands::Config {
        services,
        hash: false,
    } = cli.command
    {
        commands::config::handle(&project, services)?;
        return Ok(0);
    }

    let runtime = docker::connect(settings.http_timeout).await?;
    let detach_keys = match &cli.detach_keys {
        Some(spec) => DetachKeys::parse(spec)?,
        None => DetachKeys::default(),
    };
    let options = EngineOptions {
        parallel_limit: cli
            .parallel
            .map(NonZeroUsize::get)
            .or(settings.parallel_limit),
        ignore_orphans: settings.ignore_orphans,
        detach_keys,
        no_color: cli.no_color,
        registry_auth: docker::registry_auth(),
    };
    let engine = ComposeEngine::new(runtime)
        .with_progress(progress_sink(cli.progress))
        .with_options(options);

    let interrupt = Interrupt::new();
    signals::install(&interrupt);

    let ctx = Context {
        engine,
        project,
        interrupt,
    };
    dispatch(&ctx, cli.command).await
}

fn progress_sink(mode: ProgressMode) -> Arc<dyn ProgressSink> {
    match mode {
        ProgressMode::Auto if std::io::stderr().is_terminal() => Arc::new(TtyProgress::new()),
        ProgressMode::Auto | ProgressMode::Plain => {
            Arc::new(LineProgress::stderr(LineFormat::Plain))
        }
        ProgressMode::Tty => Arc::new(TtyProgress::new()),
        ProgressMode::Json => Arc::new(LineProgress::stderr(LineFormat::Json)),
        ProgressMode::Quiet => Arc::new(NoopProgress),
    }
}

async fn dispatch(ctx: &Context, command: Commands) -> anyhow::Result<i32> {
    let code = match command {
        Commands::Up(args) => utils::process_exit_code(commands::up::handle(ctx, &args).await?),
        Commands::Create(args) => {
            commands::up::handle_create(ctx, &args).await?;
            0
        }
        Commands::Down(args) => {
            commands::down::handle(ctx, &args).await?;
            0
        }
        Commands::Start { services } => {
            commands::lifecycle::handle_start(ctx, &services).await?;
            0
        }
        Commands::Stop { timeout, services } => {
            commands::lifecycle::handle_stop(ctx, &services, timeout).await?;
            0
        }
        Commands::Restart { timeout, services } => {
            commands::lifecycle::handle_restart(ctx, &services, timeout).await?;
            0
        }
        Commands::Kill { signal, services } => {
            commands::lifecycle::handle_kill(ctx, &services, &signal).await?;
            0
        }
        Commands::Pause { services } => {
            commands::lifecycle::handle_pause(ctx, &services).await?;
            0
        }
        Commands::Unpause { services } => {
            commands::lifecycle::handle_unpause(ctx, &services).await?;
            0
        }
        Commands::Rm(args) => {
            commands::down::handle_rm(ctx, &args).await?;
            0
        }
        Commands::Run(args) => utils::process_exit_code(commands::run::handle(ctx, &args).await?),
        Commands::Exec(args) => {
            utils::process_exit_code(commands::exec::handle(ctx, &args).await?)
        }
        Commands::Logs(args) => {
            commands::logs::handle(ctx, &args).await?;
            0
        }
        Commands::Ps(args) => {
            commands::ps::handle(ctx, &args).await?;
            0
        }
        Commands::Events(args) => {
            commands::events::handle(ctx, &args).await?;
            0
        }
        Commands::Build(args) => {
            commands::images::handle_build(ctx, &args).await?;
            0
        }
        Commands::Pull(args) => {
            commands::images::handle_pull(ctx, &args).await?;
            0
        }
        Commands::Push { services } => {
            commands::images::handle_push(ctx, &services).await?;
            0
        }
        Commands::Cp(args) => {
            commands::cp::handle(ctx, &args).await?;
            0
        }
        Commands::Config { .. } => {
            commands::config::handle_hash(&ctx.engine, &ctx.project).await?;
            0
        }
        Commands::Version => 0,
    };
    Ok(code)
}

/// エラーを表示して終了コードを返す
fn report(err: &anyhow::Error) -> i32 {
    let compose = err.chain().find_map(|e| e.downcast_ref::<ComposeError>());
    match compose {
        Some(e) if e.is_canceled() => {
            eprintln!("{}", "✗ 中断しました".yellow());
            e.exit_code()
        }
        Some(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), err);
            e.exit_code()
        }
        None => {
            eprintln!("{} {:#}", "✗".red().bold(), err);
            1
        }
    }
}
