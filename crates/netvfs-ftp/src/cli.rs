//! Command line client: mount, run one operation, unmount.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::cancel::CancelReason;
use crate::config::SessionConfig;
use crate::metadata::FileInfo;
use crate::ops::{MoveOptions, Operations, PullOptions};
use crate::path::FtpPath;
use crate::session::Session;

/// Arguments of `nvfs-ftp`.
#[derive(Parser, Debug)]
#[command(name = "nvfs-ftp")]
#[command(about = "netvfs FTP client", long_about = None)]
pub struct Cli {
    /// Session config file (.toml or .json); flags override it.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server host.
    #[arg(long)]
    pub host: Option<String>,

    /// Control port.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Login name; anonymous when unset.
    #[arg(short, long)]
    pub user: Option<String>,

    /// Login password.
    #[arg(long, env = "NVFS_FTP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Connection limit.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Operation to run.
    #[command(subcommand)]
    pub command: Command,
}

/// One operation.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List a directory.
    Ls {
        /// Remote directory.
        #[arg(default_value = "/")]
        path: String,
        /// Print entries as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show metadata of one entry.
    Stat {
        /// Remote path.
        path: String,
        /// Do not follow a symbolic link.
        #[arg(long)]
        no_follow: bool,
    },
    /// Write a remote file to stdout.
    Cat {
        /// Remote file.
        path: String,
    },
    /// Download a file.
    Get {
        /// Remote file.
        remote: String,
        /// Local destination.
        local: PathBuf,
        /// Replace an existing local file.
        #[arg(short, long)]
        force: bool,
        /// Delete the remote file afterwards.
        #[arg(long)]
        remove_source: bool,
    },
    /// Upload a file.
    Put {
        /// Local source.
        local: PathBuf,
        /// Remote destination.
        remote: String,
        /// Replace an existing remote file.
        #[arg(short, long)]
        force: bool,
        /// Append to the remote file.
        #[arg(short, long, conflicts_with = "force")]
        append: bool,
    },
    /// Create a directory.
    Mkdir {
        /// Remote directory.
        path: String,
    },
    /// Remove a file or empty directory.
    Rm {
        /// Remote path.
        path: String,
    },
    /// Move an entry.
    Mv {
        /// Remote source.
        src: String,
        /// Remote destination or directory.
        dst: String,
        /// Replace an existing destination.
        #[arg(short, long)]
        force: bool,
    },
    /// Rename an entry within its directory.
    Rename {
        /// Remote path.
        path: String,
        /// New name.
        name: String,
    },
}

impl Cli {
    /// Build the session config from the file and the flags.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SessionConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.user.is_some() {
            config.user = self.user.clone();
        }
        if self.password.is_some() {
            config.password = self.password.clone();
        }
        if self.max_connections.is_some() {
            config.max_connections = self.max_connections;
        }
        config.validate()?;
        Ok(config)
    }

    /// Mount, run the command, unmount.
    pub async fn run(self) -> Result<()> {
        let config = self.session_config()?;
        let session = Session::mount(config).await.context("mount failed")?;
        let (cancel, interrupt) = session.cancel_token().child();
        let on_ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel(CancelReason::UserRequested);
            }
        });
        let res = self.command.execute(&session.with_cancel(cancel)).await;
        on_ctrl_c.abort();
        session.unmount().await;
        res
    }
}

impl Command {
    async fn execute(self, ops: &Operations<'_>) -> Result<()> {
        match self {
            Command::Ls { path, json } => {
                let entries = ops.enumerate(&FtpPath::from_virtual(&path), false).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                } else {
                    for info in &entries {
                        println!("{}", format_entry(info));
                    }
                }
            }
            Command::Stat { path, no_follow } => {
                let info = ops
                    .query_info(&FtpPath::from_virtual(&path), !no_follow)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            Command::Cat { path } => {
                let mut handle = ops.open_for_read(&FtpPath::from_virtual(&path)).await?;
                let mut stdout = tokio::io::stdout();
                let mut buf = vec![0u8; crate::ops::COPY_BUFFER_SIZE];
                loop {
                    let n = match ops.read(&mut handle, &mut buf).await {
                        Ok(n) => n,
                        Err(err) => {
                            ops.close_read(handle).await.ok();
                            return Err(err.into());
                        }
                    };
                    if n == 0 {
                        break;
                    }
                    stdout.write_all(&buf[..n]).await?;
                }
                stdout.flush().await?;
                ops.close_read(handle).await?;
            }
            Command::Get {
                remote,
                local,
                force,
                remove_source,
            } => {
                let options = PullOptions {
                    overwrite: force,
                    remove_source,
                };
                let copied = ops
                    .pull(&FtpPath::from_virtual(&remote), &local, options, |copied, total| {
                        tracing::debug!(copied, ?total, "progress");
                    })
                    .await?;
                eprintln!("{copied} bytes");
            }
            Command::Put {
                local,
                remote,
                force,
                append,
            } => {
                let remote = FtpPath::from_virtual(&remote);
                let mut file = tokio::fs::File::open(&local)
                    .await
                    .with_context(|| format!("opening {}", local.display()))?;
                let mut handle = if append {
                    ops.append(&remote).await?
                } else if force {
                    ops.replace(&remote, false).await?
                } else {
                    ops.create(&remote).await?
                };
                let mut buf = vec![0u8; crate::ops::COPY_BUFFER_SIZE];
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    if let Err(err) = ops.write(&mut handle, &buf[..n]).await {
                        ops.close_write(handle).await.ok();
                        return Err(err.into());
                    }
                }
                let sent = handle.transferred();
                ops.close_write(handle).await?;
                eprintln!("{sent} bytes");
            }
            Command::Mkdir { path } => {
                ops.make_directory(&FtpPath::from_virtual(&path)).await?;
            }
            Command::Rm { path } => {
                ops.delete(&FtpPath::from_virtual(&path)).await?;
            }
            Command::Mv { src, dst, force } => {
                let options = MoveOptions {
                    overwrite: force,
                    backup: false,
                };
                let target = ops
                    .move_file(&FtpPath::from_virtual(&src), &FtpPath::from_virtual(&dst), options)
                    .await?;
                println!("{target}");
            }
            Command::Rename { path, name } => {
                let renamed = ops
                    .set_display_name(&FtpPath::from_virtual(&path), &name)
                    .await?;
                println!("{renamed}");
            }
        }
        Ok(())
    }
}

fn format_entry(info: &FileInfo) -> String {
    let modified = info
        .modified
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".repeat(16));
    let mut line = format!("{} {:>12} {} {}", info.mode_string(), info.size, modified, info.name);
    if let Some(target) = &info.symlink_target {
        line.push_str(" -> ");
        line.push_str(target);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FileKind;

    #[test]
    fn test_parse_ls() {
        let cli = Cli::try_parse_from(["nvfs-ftp", "--host", "ftp.example.org", "ls", "/pub"]).unwrap();
        assert_eq!(cli.host.as_deref(), Some("ftp.example.org"));
        assert!(matches!(cli.command, Command::Ls { ref path, json: false } if path == "/pub"));
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "nvfs-ftp",
            "--host",
            "h",
            "--port",
            "2121",
            "--user",
            "bob",
            "--max-connections",
            "3",
            "rm",
            "/x",
        ])
        .unwrap();
        let config = cli.session_config().unwrap();
        assert_eq!(config.host, "h");
        assert_eq!(config.port, 2121);
        assert_eq!(config.user.as_deref(), Some("bob"));
        assert_eq!(config.max_connections, Some(3));
    }

    #[test]
    fn test_missing_host_is_rejected() {
        let cli = Cli::try_parse_from(["nvfs-ftp", "ls"]).unwrap();
        assert!(cli.session_config().is_err());
    }

    #[test]
    fn test_put_append_conflicts_with_force() {
        assert!(Cli::try_parse_from(["nvfs-ftp", "put", "-f", "-a", "a", "/b"]).is_err());
    }

    #[test]
    fn test_format_entry_shows_link_target() {
        let mut info = FileInfo::new("latest", FileKind::Symlink);
        info.symlink_target = Some("v2".to_string());
        let line = format_entry(&info);
        assert!(line.ends_with("latest -> v2"));
    }
}
