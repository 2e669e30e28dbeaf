use std::path::PathBuf;

use anyhow::Context;
use cryptvault::backups::{BackupConfig, BackupRotator};
use cryptvault::recovery::RecoveryManager;
use cryptvault::registry::LockRegistry;
use cryptvault::saves::SaveWriter;
use cryptvault::{now_unix, VaultConfig};
use vaultproto::{CharacterIdentity, SessionId};

fn usage_and_exit() -> ! {
    eprintln!(
        "vaultctl (save-exclusivity admin)\n\n\
USAGE:\n\
  vaultctl [--dir PATH] <command> [args...]\n\n\
ENV:\n\
  CRYPTVAULT_DIR                    default . (vault root)\n\
  CRYPTVAULT_LOCK_TTL_S             default 86400\n\
  CRYPTVAULT_BACKUP_KEEP            default 3\n\
  CRYPTVAULT_BACKUP_RETENTION_DAYS  default 30\n\n\
COMMANDS:\n\
  locks                       print the character lock table\n\
  unlock <identity>           administrative unlock of one character\n\
  release-session <session>   release every lock a session holds\n\
  sweep                       expire locks older than the TTL\n\
  verify <path>               integrity-check one save/backup file\n\
  backups <session>           list a session's backup ring\n\
  restore <session|latest>    re-lock and print a session's newest record\n\
    [--payload-out FILE]      also write the restored payload blob\n\
  cleanup                     delete backups past the retention window\n"
    );
    std::process::exit(2);
}

fn parse_config() -> (VaultConfig, Vec<String>) {
    let mut cfg = VaultConfig::default();
    cfg.root = std::env::var("CRYPTVAULT_DIR")
        .map(PathBuf::from)
        .unwrap_or(cfg.root);
    cfg.lock_ttl_s = std::env::var("CRYPTVAULT_LOCK_TTL_S")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(cfg.lock_ttl_s);
    cfg.backup_keep = std::env::var("CRYPTVAULT_BACKUP_KEEP")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(cfg.backup_keep);
    cfg.backup_retention_days = std::env::var("CRYPTVAULT_BACKUP_RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(cfg.backup_retention_days);

    let mut rest: Vec<String> = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        if a == "--dir" {
            let v = args.next().unwrap_or_else(|| usage_and_exit());
            cfg.root = PathBuf::from(v);
            continue;
        }
        if a == "-h" || a == "--help" {
            usage_and_exit();
        }
        rest.push(a);
        rest.extend(args);
        break;
    }
    (cfg, rest)
}

fn take_flag_value(rest: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < rest.len() {
        if rest[i] == flag {
            return rest.get(i + 1).cloned();
        }
        i += 1;
    }
    None
}

fn rotator(cfg: &VaultConfig) -> BackupRotator {
    BackupRotator::new(BackupConfig {
        dir: cfg.backups_dir(),
        keep: cfg.backup_keep,
        retention_days: cfg.backup_retention_days,
        ..BackupConfig::default()
    })
}

fn parse_session(s: &str) -> anyhow::Result<SessionId> {
    SessionId::parse_hex(s).ok_or_else(|| anyhow::anyhow!("bad session id {s:?}"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (cfg, rest) = parse_config();
    let Some(cmd) = rest.first().cloned() else {
        usage_and_exit()
    };
    let rest = &rest[1..];

    match cmd.as_str() {
        "locks" => {
            if !rest.is_empty() {
                usage_and_exit();
            }
            let reg = LockRegistry::open(cfg.lock_table_path())?;
            println!("{}", serde_json::to_string_pretty(&reg.snapshot_file())?);
        }
        "unlock" => {
            if rest.len() != 1 {
                usage_and_exit();
            }
            let identity = CharacterIdentity::parse(&rest[0])
                .ok_or_else(|| anyhow::anyhow!("bad character identity {:?}", rest[0]))?;
            let mut reg = LockRegistry::open(cfg.lock_table_path())?;
            let was_held = reg.release(&identity)?;
            println!(
                "{}",
                serde_json::json!({ "identity": identity.to_string(), "was_held": was_held })
            );
        }
        "release-session" => {
            if rest.len() != 1 {
                usage_and_exit();
            }
            let session = parse_session(&rest[0])?;
            let mut reg = LockRegistry::open(cfg.lock_table_path())?;
            let released = reg.release_all(session)?;
            println!(
                "{}",
                serde_json::json!({
                    "session": session.to_string(),
                    "released": released.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
                })
            );
        }
        "sweep" => {
            if !rest.is_empty() {
                usage_and_exit();
            }
            let mut reg = LockRegistry::open(cfg.lock_table_path())?;
            let swept = reg.sweep_expired(now_unix(), cfg.lock_ttl_s)?;
            println!(
                "{}",
                serde_json::json!({
                    "ttl_s": cfg.lock_ttl_s,
                    "swept": swept.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
                })
            );
        }
        "verify" => {
            if rest.len() != 1 {
                usage_and_exit();
            }
            let path = PathBuf::from(&rest[0]);
            match cryptvault::verify::verify_file(&path) {
                Ok(env) => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "ok": true,
                            "session": env.session_id.to_string(),
                            "created_at_unix": env.created_at_unix,
                            "ordinal": env.ordinal,
                            "characters": env.locked_identities.len(),
                        })
                    );
                }
                Err(e) => {
                    println!("{}", serde_json::json!({ "ok": false, "error": e.to_string() }));
                    std::process::exit(1);
                }
            }
        }
        "backups" => {
            if rest.len() != 1 {
                usage_and_exit();
            }
            let session = parse_session(&rest[0])?;
            let rot = rotator(&cfg);
            let mut entries = Vec::new();
            for (ordinal, path) in rot.list(session)? {
                let ok = cryptvault::verify::verify_file(&path).is_ok();
                entries.push(serde_json::json!({
                    "ordinal": ordinal,
                    "path": path.display().to_string(),
                    "verified": ok,
                }));
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "session": session.to_string(),
                    "backups": entries,
                }))?
            );
        }
        "restore" => {
            if rest.is_empty() {
                usage_and_exit();
            }
            let payload_out = take_flag_value(&rest[1..], "--payload-out");
            let mut reg = LockRegistry::open(cfg.lock_table_path())?;
            let mgr = RecoveryManager::new(SaveWriter::new(cfg.saves_dir()), rotator(&cfg));

            let restored = if rest[0] == "latest" {
                mgr.restore_latest(&mut reg, now_unix())?
            } else {
                let session = parse_session(&rest[0])?;
                mgr.restore(&mut reg, session, now_unix())?
            };

            if let Some(out) = payload_out {
                std::fs::write(&out, &restored.payload)
                    .with_context(|| format!("write payload to {out:?}"))?;
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "session": restored.session.to_string(),
                    "source": restored.source.display().to_string(),
                    "created_at_unix": restored.created_at_unix,
                    "roster": restored.roster.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
                    "payload_bytes": restored.payload.len(),
                }))?
            );
        }
        "cleanup" => {
            if !rest.is_empty() {
                usage_and_exit();
            }
            let removed = rotator(&cfg)
                .cleanup_older_than(now_unix(), cfg.backup_retention_days * 24 * 60 * 60)?;
            println!("{}", serde_json::json!({ "removed": removed }));
        }
        _ => usage_and_exit(),
    }

    Ok(())
}
