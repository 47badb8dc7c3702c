use fleetcompose_core::Project;
use fleetcompose_engine::{ComposeEngine, render_config};

/// 正規化後のプロジェクトを表示
pub fn handle(project: &Project, services: bool) -> anyhow::Result<()> {
    if services {
        for name in project.service_names() {
            println!("{}", name);
        }
        return Ok(());
    }
    print!("{}", render_config(project)?);
    Ok(())
}

/// サービスごとの設定ハッシュを表示
pub async fn handle_hash(engine: &ComposeEngine, project: &Project) -> anyhow::Result<()> {
    for (service, hash) in engine.config_hashes(project).await? {
        println!("{} {}", service, hash);
    }
    Ok(())
}
