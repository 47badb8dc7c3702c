//! 割り込みシグナルの受け付け

use colored::Colorize;
use fleetcompose_engine::Interrupt;
use tokio::signal;
use tracing::{debug, warn};

/// SIGINT または SIGTERM を待つ
async fn interrupt_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// シグナルを `interrupt` に結びつける
///
/// 1 回目で `graceful`、2 回目で `force` を取り消す。
pub fn install(interrupt: &Interrupt) {
    let interrupt = interrupt.clone();
    tokio::spawn(async move {
        interrupt_signal().await;
        debug!("Interrupt received");
        eprintln!(
            "{}",
            "停止しています... (もう一度 Ctrl+C で強制終了)".yellow()
        );
        interrupt.graceful.cancel();

        interrupt_signal().await;
        debug!("Second interrupt received, forcing");
        interrupt.force.cancel();
    });
}
