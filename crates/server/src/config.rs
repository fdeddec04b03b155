use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use taskd_common::SecretRing;

use crate::{reclaim::ReclaimConfig, store::StoreConfig, ConfirmAuth};

/// Shipped placeholder; running with it logs a warning.
pub const DEFAULT_SECRET: &str = "change-me";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_DB_FILE: &str = "taskd.db";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub store: StoreConfig,
    pub secrets: SecretRing,
    pub admin_tokens: Vec<String>,
    pub panel_token: Option<String>,
    pub confirm_auth: ConfirmAuth,
    pub reclaim: ReclaimConfig,
    pub journal: Option<JournalConfig>,
}

impl ServerConfig {
    pub fn uses_default_secret(&self) -> bool {
        self.secrets.current() == DEFAULT_SECRET
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub cors: Option<CorsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Clone)]
pub struct JournalConfig {
    pub path: PathBuf,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for JournalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalConfig")
            .field("path", &self.path)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
pub struct CliOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub memory: bool,
    pub secret: Option<String>,
    pub admin_tokens: Vec<String>,
    pub confirm_auth: Option<ConfirmAuth>,
    pub cors_origins: Vec<String>,
    pub disable_reclaim: bool,
    pub journal_path: Option<PathBuf>,
}

/// `TASKD_*` environment values, read once at startup.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub secret: Option<String>,
    pub previous_secrets: Vec<String>,
    pub admin_token: Option<String>,
    pub panel_token: Option<String>,
    pub journal_key: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let non_empty = |name: &str| env::var(name).ok().filter(|value| !value.trim().is_empty());
        Self {
            secret: non_empty("TASKD_SECRET"),
            previous_secrets: non_empty("TASKD_PREVIOUS_SECRETS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
            admin_token: non_empty("TASKD_ADMIN_TOKEN"),
            panel_token: non_empty("TASKD_PANEL_TOKEN"),
            journal_key: non_empty("TASKD_JOURNAL_KEY"),
        }
    }
}

/// Parsed `taskd.toml` with relative paths already resolved against the
/// file's directory.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub store_engine: Option<String>,
    pub store_path: Option<PathBuf>,
    pub secret: Option<String>,
    pub previous_secrets: Vec<String>,
    pub admin_tokens: Vec<String>,
    pub admin_tokens_file: Option<PathBuf>,
    pub panel_token: Option<String>,
    pub confirm_auth: Option<ConfirmAuth>,
    pub reclaim_enabled: Option<bool>,
    pub reclaim_interval_secs: Option<u64>,
    pub reclaim_lease_secs: Option<u64>,
    pub journal_path: Option<PathBuf>,
    pub journal_key: Option<String>,
    pub cors_origins: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawFileConfig {
    #[serde(default)]
    server: RawServerSection,
    #[serde(default)]
    store: RawStoreSection,
    #[serde(default)]
    auth: RawAuthSection,
    #[serde(default)]
    reclaim: RawReclaimSection,
    #[serde(default)]
    journal: Option<RawJournalSection>,
    #[serde(default)]
    cors: RawCorsSection,
}

#[derive(Deserialize, Default)]
struct RawServerSection {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Deserialize, Default)]
struct RawStoreSection {
    engine: Option<String>,
    path: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawAuthSection {
    secret: Option<String>,
    previous_secrets: Option<Vec<String>>,
    admin_tokens: Option<Vec<String>>,
    admin_tokens_file: Option<String>,
    panel_token: Option<String>,
    confirm_auth: Option<ConfirmAuth>,
}

#[derive(Deserialize, Default)]
struct RawReclaimSection {
    enabled: Option<bool>,
    interval_secs: Option<u64>,
    lease_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct RawJournalSection {
    path: Option<String>,
    key: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawCorsSection {
    allowed_origins: Option<Vec<String>>,
}

pub fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };

    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read taskd config from {}", path.display()))?;
    let parsed: RawFileConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;

    Ok(Some(parsed.into_runtime_config(
        path.parent().unwrap_or(Path::new(".")),
    )))
}

/// Merges CLI flags, environment and file values (in that order of
/// precedence) over the defaults.
pub fn resolve_config(
    cli: &CliOptions,
    env: &EnvOverrides,
    file_cfg: Option<&FileConfig>,
    working_dir: &Path,
) -> Result<ServerConfig> {
    let host = cli
        .host
        .clone()
        .or_else(|| file_cfg.and_then(|cfg| cfg.host.clone()))
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let port = cli
        .port
        .or_else(|| file_cfg.and_then(|cfg| cfg.port))
        .unwrap_or(DEFAULT_PORT);

    let store = build_store_config(cli, file_cfg, working_dir)?;

    let secret = cli
        .secret
        .clone()
        .or_else(|| env.secret.clone())
        .or_else(|| file_cfg.and_then(|cfg| cfg.secret.clone()))
        .unwrap_or_else(|| DEFAULT_SECRET.to_string());

    let mut previous = env.previous_secrets.clone();
    if let Some(cfg) = file_cfg {
        previous.extend(cfg.previous_secrets.iter().cloned());
    }
    let secrets = SecretRing::new(secret).with_previous(previous);

    let admin_tokens = build_admin_tokens(cli, env, file_cfg)?;

    let confirm_auth = cli
        .confirm_auth
        .or_else(|| file_cfg.and_then(|cfg| cfg.confirm_auth))
        .unwrap_or_default();

    let reclaim = build_reclaim_config(cli, file_cfg)?;

    let panel_token = env
        .panel_token
        .clone()
        .or_else(|| file_cfg.and_then(|cfg| cfg.panel_token.clone()));

    let journal = build_journal_config(cli, env, file_cfg, working_dir)?;

    Ok(ServerConfig {
        http: HttpConfig {
            host,
            port,
            cors: build_cors_config(cli, file_cfg),
        },
        store,
        secrets,
        admin_tokens,
        panel_token,
        confirm_auth,
        reclaim,
        journal,
    })
}

/// The journal key is independent of the shared secret: a chain signed
/// under one key stays verifiable after the secret rotates.
fn build_journal_config(
    cli: &CliOptions,
    env: &EnvOverrides,
    file_cfg: Option<&FileConfig>,
    working_dir: &Path,
) -> Result<Option<JournalConfig>> {
    let path = cli
        .journal_path
        .as_ref()
        .map(|path| resolve_relative(working_dir, path))
        .or_else(|| file_cfg.and_then(|cfg| cfg.journal_path.clone()));
    let Some(path) = path else {
        return Ok(None);
    };

    let key = env
        .journal_key
        .clone()
        .or_else(|| file_cfg.and_then(|cfg| cfg.journal_key.clone()))
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| {
            anyhow!(
                "journal {} needs a key; set [journal].key or TASKD_JOURNAL_KEY",
                path.display()
            )
        })?;

    Ok(Some(JournalConfig {
        path,
        key: key.into_bytes(),
    }))
}

fn build_store_config(
    cli: &CliOptions,
    file_cfg: Option<&FileConfig>,
    working_dir: &Path,
) -> Result<StoreConfig> {
    if cli.memory {
        return Ok(StoreConfig::Memory);
    }
    if let Some(path) = cli.db_path.as_ref() {
        return Ok(StoreConfig::Sqlite {
            path: resolve_relative(working_dir, path),
        });
    }

    let engine = file_cfg
        .and_then(|cfg| cfg.store_engine.as_deref())
        .unwrap_or("sqlite");

    match engine {
        "memory" => Ok(StoreConfig::Memory),
        "sqlite" => {
            let path = file_cfg
                .and_then(|cfg| cfg.store_path.clone())
                .unwrap_or_else(|| working_dir.join(DEFAULT_DB_FILE));
            Ok(StoreConfig::Sqlite { path })
        }
        other => Err(anyhow!(
            "Unsupported store engine '{}'. Use 'sqlite' or 'memory'.",
            other
        )),
    }
}

fn build_admin_tokens(
    cli: &CliOptions,
    env: &EnvOverrides,
    file_cfg: Option<&FileConfig>,
) -> Result<Vec<String>> {
    let mut tokens: Vec<String> = Vec::new();

    if let Some(cfg) = file_cfg {
        tokens.extend(cfg.admin_tokens.iter().cloned());
        if let Some(path) = cfg.admin_tokens_file.as_ref() {
            tokens.extend(load_tokens_from_file(path)?);
        }
    }
    tokens.extend(env.admin_token.iter().cloned());
    tokens.extend(cli.admin_tokens.iter().cloned());

    tokens.retain(|token| !token.trim().is_empty());
    tokens.sort();
    tokens.dedup();
    Ok(tokens)
}

fn build_reclaim_config(cli: &CliOptions, file_cfg: Option<&FileConfig>) -> Result<ReclaimConfig> {
    let defaults = ReclaimConfig::default();

    let interval_secs = file_cfg.and_then(|cfg| cfg.reclaim_interval_secs);
    if interval_secs == Some(0) {
        return Err(anyhow!("reclaim.interval_secs must be greater than zero"));
    }

    Ok(ReclaimConfig {
        enabled: !cli.disable_reclaim
            && file_cfg
                .and_then(|cfg| cfg.reclaim_enabled)
                .unwrap_or(defaults.enabled),
        interval: interval_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.interval),
        lease: file_cfg
            .and_then(|cfg| cfg.reclaim_lease_secs)
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease),
    })
}

fn build_cors_config(cli: &CliOptions, file_cfg: Option<&FileConfig>) -> Option<CorsConfig> {
    let mut origins: Vec<String> = Vec::new();

    if let Some(cfg) = file_cfg {
        origins.extend(cfg.cors_origins.iter().cloned());
    }

    origins.extend(cli.cors_origins.iter().cloned());

    if origins.is_empty() {
        return None;
    }

    origins.sort();
    origins.dedup();

    Some(CorsConfig {
        allowed_origins: origins,
    })
}

fn load_tokens_from_file(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tokens file {}", path.display()))?;
    let parsed: TokenFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse tokens file {}", path.display()))?;
    Ok(parsed.tokens.into_iter().map(|entry| entry.token).collect())
}

fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

impl RawFileConfig {
    fn into_runtime_config(self, base: &Path) -> FileConfig {
        let resolve = |value: String| resolve_relative(base, Path::new(&value));
        let (journal_path, journal_key) = match self.journal {
            Some(journal) => (journal.path.map(resolve), journal.key),
            None => (None, None),
        };

        FileConfig {
            host: self.server.host,
            port: self.server.port,
            store_engine: self.store.engine,
            store_path: self.store.path.map(resolve),
            secret: self.auth.secret,
            previous_secrets: self.auth.previous_secrets.unwrap_or_default(),
            admin_tokens: self.auth.admin_tokens.unwrap_or_default(),
            admin_tokens_file: self.auth.admin_tokens_file.map(resolve),
            panel_token: self.auth.panel_token,
            confirm_auth: self.auth.confirm_auth,
            reclaim_enabled: self.reclaim.enabled,
            reclaim_interval_secs: self.reclaim.interval_secs,
            reclaim_lease_secs: self.reclaim.lease_secs,
            journal_path,
            journal_key,
            cors_origins: self.cors.allowed_origins.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct TokenFile {
    tokens: Vec<TokenEntry>,
}

#[derive(Deserialize)]
struct TokenEntry {
    token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_use_sqlite_and_placeholder_secret() {
        let config = resolve_config(
            &CliOptions::default(),
            &EnvOverrides::default(),
            None,
            Path::new("/srv/taskd"),
        )
        .expect("resolve config");

        assert_eq!(config.http.host, "127.0.0.1");
        assert_eq!(config.http.port, DEFAULT_PORT);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: PathBuf::from("/srv/taskd/taskd.db")
            }
        );
        assert!(config.uses_default_secret());
        assert!(config.admin_tokens.is_empty());
        assert_eq!(config.confirm_auth, ConfirmAuth::Required);
        assert_eq!(config.reclaim, ReclaimConfig::default());
        assert!(config.journal.is_none());
        assert!(config.http.cors.is_none());
    }

    #[test]
    fn file_config_is_parsed_and_paths_resolved() {
        let dir = tempdir().expect("tempdir");
        let config_path = dir.path().join("taskd.toml");
        std::fs::write(
            dir.path().join("admins.json"),
            r#"{"tokens":[{"token":"from-file"}]}"#,
        )
        .expect("write tokens file");
        std::fs::write(
            &config_path,
            r#"
[server]
host = "0.0.0.0"
port = 8080

[store]
engine = "sqlite"
path = "data/tasks.db"

[auth]
secret = "file-secret"
previous_secrets = ["old-secret"]
admin_tokens = ["inline"]
admin_tokens_file = "admins.json"
confirm_auth = "off"

[reclaim]
enabled = true
interval_secs = 30
lease_secs = 120

[journal]
path = "audit.jsonl"
key = "journal-key"

[cors]
allowed_origins = ["https://panel.example.com"]
"#,
        )
        .expect("write config");

        let file_cfg = load_file_config(Some(&config_path))
            .expect("load config")
            .expect("config present");
        let config = resolve_config(
            &CliOptions::default(),
            &EnvOverrides::default(),
            Some(&file_cfg),
            Path::new("/elsewhere"),
        )
        .expect("resolve config");

        assert_eq!(config.http.host, "0.0.0.0");
        assert_eq!(config.http.port, 8080);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: dir.path().join("data/tasks.db")
            }
        );
        assert_eq!(config.secrets.current(), "file-secret");
        assert_eq!(config.secrets.previous_count(), 1);
        assert_eq!(config.admin_tokens, vec!["from-file", "inline"]);
        assert_eq!(config.confirm_auth, ConfirmAuth::Off);
        assert_eq!(config.reclaim.interval, Duration::from_secs(30));
        assert_eq!(config.reclaim.lease, Duration::from_secs(120));
        let journal = config.journal.expect("journal config");
        assert_eq!(journal.path, dir.path().join("audit.jsonl"));
        assert_eq!(journal.key, b"journal-key".to_vec());
        assert_eq!(
            config.http.cors.expect("cors").allowed_origins,
            vec!["https://panel.example.com".to_string()]
        );
    }

    #[test]
    fn cli_and_env_override_file() {
        let file_cfg = FileConfig {
            port: Some(8080),
            secret: Some("file-secret".into()),
            store_engine: Some("sqlite".into()),
            reclaim_enabled: Some(true),
            ..FileConfig::default()
        };
        let env = EnvOverrides {
            secret: Some("env-secret".into()),
            previous_secrets: vec!["older".into()],
            admin_token: Some("env-admin".into()),
            panel_token: Some("env-panel".into()),
            journal_key: Some("env-journal-key".into()),
        };
        let cli = CliOptions {
            port: Some(9000),
            memory: true,
            admin_tokens: vec!["cli-admin".into()],
            disable_reclaim: true,
            journal_path: Some(PathBuf::from("logs/audit.jsonl")),
            ..CliOptions::default()
        };

        let config = resolve_config(&cli, &env, Some(&file_cfg), Path::new("/work"))
            .expect("resolve config");
        assert_eq!(config.http.port, 9000);
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.secrets.current(), "env-secret");
        assert_eq!(config.secrets.previous_count(), 1);
        assert_eq!(config.admin_tokens, vec!["cli-admin", "env-admin"]);
        assert!(!config.reclaim.enabled);
        let journal = config.journal.expect("journal config");
        assert_eq!(journal.path, PathBuf::from("/work/logs/audit.jsonl"));
        assert_eq!(journal.key, b"env-journal-key".to_vec());
        assert_eq!(config.panel_token.as_deref(), Some("env-panel"));

        let cli = CliOptions {
            secret: Some("cli-secret".into()),
            ..CliOptions::default()
        };
        let config = resolve_config(&cli, &env, Some(&file_cfg), Path::new("/work"))
            .expect("resolve config");
        assert_eq!(config.secrets.current(), "cli-secret");
        assert!(!config.uses_default_secret());
    }

    #[test]
    fn unknown_engine_and_zero_interval_are_rejected() {
        let file_cfg = FileConfig {
            store_engine: Some("postgres".into()),
            ..FileConfig::default()
        };
        assert!(resolve_config(
            &CliOptions::default(),
            &EnvOverrides::default(),
            Some(&file_cfg),
            Path::new(".")
        )
        .is_err());

        let file_cfg = FileConfig {
            reclaim_interval_secs: Some(0),
            ..FileConfig::default()
        };
        assert!(resolve_config(
            &CliOptions::default(),
            &EnvOverrides::default(),
            Some(&file_cfg),
            Path::new(".")
        )
        .is_err());
    }

    #[test]
    fn journal_needs_its_own_key() {
        let cli = CliOptions {
            journal_path: Some(PathBuf::from("audit.jsonl")),
            secret: Some("shared-secret".into()),
            ..CliOptions::default()
        };
        let err = resolve_config(&cli, &EnvOverrides::default(), None, Path::new("/work"))
            .expect_err("journal without key");
        assert!(err.to_string().contains("TASKD_JOURNAL_KEY"), "{err}");

        let file_cfg = FileConfig {
            journal_key: Some("file-journal-key".into()),
            ..FileConfig::default()
        };
        let config = resolve_config(&cli, &EnvOverrides::default(), Some(&file_cfg), Path::new("/work"))
            .expect("resolve config");
        let journal = config.journal.expect("journal config");
        assert_eq!(journal.key, b"file-journal-key".to_vec());

        // Rotating the shared secret leaves the journal key alone.
        let rotated = CliOptions {
            secret: Some("rotated-secret".into()),
            ..cli
        };
        let config = resolve_config(&rotated, &EnvOverrides::default(), Some(&file_cfg), Path::new("/work"))
            .expect("resolve config");
        assert_eq!(config.journal.expect("journal config").key, journal.key);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let loaded = load_file_config(Some(&dir.path().join("absent.toml"))).expect("load");
        assert!(loaded.is_none());
        assert!(load_file_config(None).expect("load").is_none());
    }

    #[test]
    fn previous_secrets_list_is_split() {
        assert_eq!(split_list(" a, ,b ,c"), vec!["a", "b", "c"]);
    }
}
