//! サービス設定のハッシュ
//!
//! 正規化済みのサービス定義を固定のフィールド順で正準エンコードし、
//! SHA-256 の 16 進表記を返す。エンジン管理ラベル、レプリカ数、
//! depends_on、pull_policy、ネットワーク接続はハッシュに含めない。

use crate::labels::is_engine_managed;
use crate::model::{HealthCheck, ResourceSpec, Service};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// 長さプレフィックス付きの正準エンコーダ
///
/// 各フィールドは `タグ長(u32) タグ 値長(u64) 値` で書き込む。
/// リストとマップは要素数を先に書くため、境界の曖昧さが生じない。
struct CanonicalEncoder {
    hasher: Sha256,
}

impl CanonicalEncoder {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.hasher.update((bytes.len() as u64).to_be_bytes());
        self.hasher.update(bytes);
    }

    fn tag(&mut self, tag: &str) {
        self.hasher.update((tag.len() as u32).to_be_bytes());
        self.hasher.update(tag.as_bytes());
    }

    fn str(&mut self, tag: &str, value: &str) {
        self.tag(tag);
        self.raw(value.as_bytes());
    }

    fn opt_str(&mut self, tag: &str, value: Option<&str>) {
        match value {
            Some(v) => self.str(tag, v),
            None => self.tag(tag),
        }
    }

    fn bool(&mut self, tag: &str, value: bool) {
        self.tag(tag);
        self.raw(&[value as u8]);
    }

    fn list<'a>(&mut self, tag: &str, items: impl ExactSizeIterator<Item = &'a str>) {
        self.tag(tag);
        self.hasher.update((items.len() as u64).to_be_bytes());
        for item in items {
            self.raw(item.as_bytes());
        }
    }

    fn pairs<'a>(&mut self, tag: &str, items: impl ExactSizeIterator<Item = (&'a str, &'a str)>) {
        self.tag(tag);
        self.hasher.update((items.len() as u64).to_be_bytes());
        for (k, v) in items {
            self.raw(k.as_bytes());
            self.raw(v.as_bytes());
        }
    }

    fn duration(&mut self, tag: &str, value: Option<Duration>) {
        self.opt_str(tag, value.map(|d| d.as_nanos().to_string()).as_deref());
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// サービスの設定ハッシュを計算する
///
/// `resolved_image` は pull 解決後のイメージ参照（ダイジェストが分かればそれを含む）。
pub fn config_hash(service: &Service, resolved_image: &str) -> String {
    let mut enc = CanonicalEncoder::new();

    enc.str("image", resolved_image);
    enc.list("command", service.command.iter().map(String::as_str));
    enc.list("entrypoint", service.entrypoint.iter().map(String::as_str));
    // BTreeMap なので定義順に関わらずキー順
    enc.pairs(
        "environment",
        service
            .environment
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str())),
    );

    let mounts: Vec<String> = service
        .volumes
        .iter()
        .map(|m| {
            format!(
                "{}|{}|{}|{}",
                m.kind.as_str(),
                m.source.as_deref().unwrap_or(""),
                m.target,
                m.read_only
            )
        })
        .collect();
    enc.list("volumes", mounts.iter().map(String::as_str));

    let labels: Vec<(&str, &str)> = service
        .labels
        .iter()
        .filter(|(k, _)| !is_engine_managed(k))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    enc.pairs("labels", labels.into_iter());

    let resources = service.deploy.as_ref().and_then(|d| d.resources.as_ref());
    encode_resources(&mut enc, "limits", resources.and_then(|r| r.limits.as_ref()));
    encode_resources(
        &mut enc,
        "reservations",
        resources.and_then(|r| r.reservations.as_ref()),
    );
    encode_healthcheck(&mut enc, service.healthcheck.as_ref());

    let restart = service.restart.map(|r| r.to_string());
    enc.opt_str("restart", restart.as_deref());

    let ports: Vec<String> = service.ports.iter().map(|p| p.to_string()).collect();
    enc.list("ports", ports.iter().map(String::as_str));

    enc.opt_str("container_name", service.container_name.as_deref());
    enc.opt_str("hostname", service.hostname.as_deref());
    enc.opt_str("working_dir", service.working_dir.as_deref());
    enc.opt_str("user", service.user.as_deref());
    enc.opt_str("stop_signal", service.stop_signal.as_deref());
    enc.opt_str("network_mode", service.network_mode.as_deref());
    enc.bool("tty", service.tty);
    enc.bool("stdin_open", service.stdin_open);
    enc.bool("privileged", service.privileged);
    enc.bool("read_only", service.read_only);
    let init = service.init.map(|b| b.to_string());
    enc.opt_str("init", init.as_deref());
    enc.list("extra_hosts", service.extra_hosts.iter().map(String::as_str));
    enc.list("dns", service.dns.iter().map(String::as_str));
    enc.list("cap_add", service.cap_add.iter().map(String::as_str));
    enc.list("cap_drop", service.cap_drop.iter().map(String::as_str));
    enc.list("volumes_from", service.volumes_from.iter().map(String::as_str));

    let secrets: Vec<String> = service
        .secrets
        .iter()
        .map(|s| format!("{}|{}", s.source, s.secret_target()))
        .collect();
    enc.list("secrets", secrets.iter().map(String::as_str));
    let configs: Vec<String> = service
        .configs
        .iter()
        .map(|c| format!("{}|{}", c.source, c.config_target()))
        .collect();
    enc.list("configs", configs.iter().map(String::as_str));

    enc.finish()
}

fn encode_resources(enc: &mut CanonicalEncoder, tag: &str, spec: Option<&ResourceSpec>) {
    enc.tag(tag);
    let cpus = spec.and_then(|s| s.cpus).map(|c| format!("{:.6}", c));
    enc.opt_str("cpus", cpus.as_deref());
    enc.opt_str("memory", spec.and_then(|s| s.memory.as_deref()));
    let pids = spec.and_then(|s| s.pids).map(|p| p.to_string());
    enc.opt_str("pids", pids.as_deref());
}

fn encode_healthcheck(enc: &mut CanonicalEncoder, hc: Option<&HealthCheck>) {
    enc.tag("healthcheck");
    let Some(hc) = hc else {
        enc.bool("present", false);
        return;
    };
    enc.bool("present", true);
    enc.bool("disable", hc.is_disabled());
    enc.list("test", hc.test.iter().map(String::as_str));
    enc.duration("interval", hc.interval);
    enc.duration("timeout", hc.timeout);
    enc.duration("start_period", hc.start_period);
    let retries = hc.retries.map(|r| r.to_string());
    enc.opt_str("retries", retries.as_deref());
}
