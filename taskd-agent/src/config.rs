use std::{
    env, fs,
    path::Path,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use taskd_common::SecretRing;

use crate::executor::MessageSurface;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";
pub const DEFAULT_SECRET: &str = "change-me";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub host_id: String,
    pub secrets: SecretRing,
    pub interval: Duration,
    pub request_timeout: Duration,
    pub command_timeout: Duration,
    pub message_surface: MessageSurface,
}

impl AgentConfig {
    pub fn uses_default_secret(&self) -> bool {
        self.secrets.current() == DEFAULT_SECRET
    }
}

#[derive(Debug, Default, Clone)]
pub struct CliOptions {
    pub server_url: Option<String>,
    pub host_id: Option<String>,
    pub secret: Option<String>,
    pub interval_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub notifier: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub server_url: Option<String>,
    pub host_id: Option<String>,
    pub secret: Option<String>,
    /// `HOSTNAME` / `COMPUTERNAME`, used when no host id is configured.
    pub system_hostname: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let non_empty = |name: &str| env::var(name).ok().filter(|value| !value.trim().is_empty());
        Self {
            server_url: non_empty("TASKD_SERVER"),
            host_id: non_empty("TASKD_HOST_ID"),
            secret: non_empty("TASKD_SECRET"),
            system_hostname: non_empty("HOSTNAME").or_else(|| non_empty("COMPUTERNAME")),
        }
    }
}

#[derive(Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub server: Option<String>,
    pub host_id: Option<String>,
    pub secret: Option<String>,
    pub interval_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    #[serde(default)]
    pub message: RawMessageSection,
}

#[derive(Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RawMessageSection {
    pub surface: Option<String>,
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
}

pub fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };

    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read agent config from {}", path.display()))?;
    let parsed = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;
    Ok(Some(parsed))
}

pub fn resolve_config(
    cli: &CliOptions,
    env: &EnvOverrides,
    file_cfg: Option<&FileConfig>,
) -> Result<AgentConfig> {
    let server_url = cli
        .server_url
        .clone()
        .or_else(|| env.server_url.clone())
        .or_else(|| file_cfg.and_then(|cfg| cfg.server.clone()))
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());

    let host_id = cli
        .host_id
        .clone()
        .or_else(|| env.host_id.clone())
        .or_else(|| file_cfg.and_then(|cfg| cfg.host_id.clone()))
        .or_else(|| env.system_hostname.clone())
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
        .ok_or_else(|| anyhow!("No host id configured; pass --host-id or set TASKD_HOST_ID"))?;

    let secret = cli
        .secret
        .clone()
        .or_else(|| env.secret.clone())
        .or_else(|| file_cfg.and_then(|cfg| cfg.secret.clone()))
        .unwrap_or_else(|| DEFAULT_SECRET.to_string());

    let secs = |cli_value: Option<u64>, file_value: Option<u64>, default: u64, name: &str| {
        let value = cli_value.or(file_value).unwrap_or(default);
        if value == 0 {
            Err(anyhow!("{name} must be greater than zero"))
        } else {
            Ok(Duration::from_secs(value))
        }
    };

    let interval = secs(
        cli.interval_secs,
        file_cfg.and_then(|cfg| cfg.interval_secs),
        60,
        "interval_secs",
    )?;
    let request_timeout = secs(
        None,
        file_cfg.and_then(|cfg| cfg.request_timeout_secs),
        10,
        "request_timeout_secs",
    )?;
    let command_timeout = secs(
        cli.command_timeout_secs,
        file_cfg.and_then(|cfg| cfg.command_timeout_secs),
        300,
        "command_timeout_secs",
    )?;

    Ok(AgentConfig {
        server_url,
        host_id,
        secrets: SecretRing::new(secret),
        interval,
        request_timeout,
        command_timeout,
        message_surface: build_message_surface(cli, file_cfg)?,
    })
}

fn build_message_surface(cli: &CliOptions, file_cfg: Option<&FileConfig>) -> Result<MessageSurface> {
    if let Some(program) = cli.notifier.as_ref() {
        return Ok(MessageSurface::Command {
            program: program.clone(),
            args: Vec::new(),
        });
    }

    let Some(section) = file_cfg.map(|cfg| &cfg.message) else {
        return Ok(MessageSurface::Log);
    };

    match section.surface.as_deref().unwrap_or("log") {
        "log" => Ok(MessageSurface::Log),
        "command" => {
            let program = section
                .program
                .clone()
                .ok_or_else(|| anyhow!("message.surface = \"command\" needs message.program"))?;
            Ok(MessageSurface::Command {
                program,
                args: section.args.clone().unwrap_or_default(),
            })
        }
        other => Err(anyhow!(
            "Unsupported message surface '{}'. Use 'log' or 'command'.",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn host_id_is_required() {
        let err = resolve_config(&CliOptions::default(), &EnvOverrides::default(), None)
            .expect_err("missing host id");
        assert!(err.to_string().contains("host id"));
    }

    #[test]
    fn defaults_fall_back_to_system_hostname() {
        let env = EnvOverrides {
            system_hostname: Some("workstation-7".into()),
            ..EnvOverrides::default()
        };
        let config = resolve_config(&CliOptions::default(), &env, None).expect("resolve");
        assert_eq!(config.host_id, "workstation-7");
        assert_eq!(config.server_url, DEFAULT_SERVER);
        assert!(config.uses_default_secret());
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.command_timeout, Duration::from_secs(300));
        assert_eq!(config.message_surface, MessageSurface::Log);
    }

    #[test]
    fn file_then_env_then_cli() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            r#"
server = "http://tasks.internal:5000"
host_id = "HOST1"
secret = "file-secret"
interval_secs = 15
request_timeout_secs = 3

[message]
surface = "command"
program = "notify-send"
args = ["taskd"]
"#,
        )
        .expect("write config");
        let file_cfg = load_file_config(Some(&path))
            .expect("load")
            .expect("present");

        let config = resolve_config(&CliOptions::default(), &EnvOverrides::default(), Some(&file_cfg))
            .expect("resolve");
        assert_eq!(config.server_url, "http://tasks.internal:5000");
        assert_eq!(config.host_id, "HOST1");
        assert_eq!(config.secrets.current(), "file-secret");
        assert_eq!(config.interval, Duration::from_secs(15));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(
            config.message_surface,
            MessageSurface::Command {
                program: "notify-send".into(),
                args: vec!["taskd".into()],
            }
        );

        let env = EnvOverrides {
            host_id: Some("HOST2".into()),
            secret: Some("env-secret".into()),
            ..EnvOverrides::default()
        };
        let cli = CliOptions {
            host_id: Some("HOST3".into()),
            interval_secs: Some(5),
            ..CliOptions::default()
        };
        let config = resolve_config(&cli, &env, Some(&file_cfg)).expect("resolve");
        assert_eq!(config.host_id, "HOST3");
        assert_eq!(config.secrets.current(), "env-secret");
        assert_eq!(config.interval, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cli = CliOptions {
            host_id: Some("HOST1".into()),
            interval_secs: Some(0),
            ..CliOptions::default()
        };
        assert!(resolve_config(&cli, &EnvOverrides::default(), None).is_err());

        let file_cfg = FileConfig {
            message: RawMessageSection {
                surface: Some("popup".into()),
                ..RawMessageSection::default()
            },
            ..FileConfig::default()
        };
        let cli = CliOptions {
            host_id: Some("HOST1".into()),
            ..CliOptions::default()
        };
        assert!(resolve_config(&cli, &EnvOverrides::default(), Some(&file_cfg)).is_err());
    }
}
